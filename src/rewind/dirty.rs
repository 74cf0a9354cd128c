//! Bookkeeping attached to every object `RewindData` tracks.
use std::{fmt::Debug, hash::Hash};

use glam::{Quat, Vec3};

use crate::{
    history::{DirtyPropertiesPool, FrameAndPhase},
    registry::DirtyEntry,
    state::{GeometryParticleStateBase, JointStateBase},
    world::{JointHandle, ParticleHandle},
};

/// Lifecycle operations shared by the per-object history aggregates.
pub trait ObjectHistory {
    fn release(&mut self, pool: &mut DirtyPropertiesPool);
    fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase);
    fn has_data_in_history(&self) -> bool;
}

impl ObjectHistory for GeometryParticleStateBase {
    fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        GeometryParticleStateBase::release(self, pool)
    }

    fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        GeometryParticleStateBase::clear_entry_and_future(self, frame_and_phase)
    }

    fn has_data_in_history(&self) -> bool {
        GeometryParticleStateBase::has_data_in_history(self)
    }
}

impl ObjectHistory for JointStateBase {
    fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        JointStateBase::release(self, pool)
    }

    fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        JointStateBase::clear_entry_and_future(self, frame_and_phase)
    }

    fn has_data_in_history(&self) -> bool {
        JointStateBase::has_data_in_history(self)
    }
}

/// A tracked object: its history plus the flags driving resimulation.
///
/// The pool slots behind `history` are not freed on drop. `RewindData` releases them on
/// every path that unregisters an info: `remove_particle`, `remove_joint`, aging out and
/// `clear_dirty_objects`.
#[derive(Debug)]
#[must_use = "a tracked object owns pool slots until `release` is called"]
pub struct DirtyObjectInfo<H, S> {
    handle: H,
    history: S,
    /// Frame the dynamics were last written on, particles only.
    pub dirty_dynamics: Option<i32>,
    /// Most recent frame the object was marked dirty on.
    pub last_dirty_frame: i32,
    /// Frame the object was spawned on, when that happened inside the history window.
    pub initialized_on_step: Option<i32>,
    /// The object replays its recorded state during a resim instead of being simulated.
    pub resim_as_follower: bool,
    /// The object diverged from authoritative state and must be fully resimulated.
    pub needs_resim: bool,
}

pub type DirtyParticleInfo = DirtyObjectInfo<ParticleHandle, GeometryParticleStateBase>;
pub type DirtyJointInfo = DirtyObjectInfo<JointHandle, JointStateBase>;

impl<H: Copy, S: ObjectHistory> DirtyObjectInfo<H, S> {
    pub fn new(handle: H, history: S, cur_frame: i32) -> Self {
        Self {
            handle,
            history,
            dirty_dynamics: None,
            last_dirty_frame: cur_frame,
            initialized_on_step: None,
            resim_as_follower: true,
            needs_resim: false,
        }
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    pub fn history(&self) -> &S {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut S {
        &mut self.history
    }

    /// Marks the object dirty on `frame` and hands out its history for writing.
    pub fn add_frame(&mut self, frame: i32) -> &mut S {
        self.last_dirty_frame = frame;
        &mut self.history
    }

    pub fn clear_phase_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        self.history.clear_entry_and_future(frame_and_phase);
    }

    pub fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        self.history.release(pool);
    }

    /// Drops the resim flags once a resimulation is over.
    pub fn reset_resim_flags(&mut self) {
        self.resim_as_follower = true;
        self.needs_resim = false;
    }
}

impl<H, S> DirtyEntry for DirtyObjectInfo<H, S>
where
    H: Copy + Eq + Hash + Debug,
{
    type Key = H;

    fn key(&self) -> H {
        self.handle
    }
}

/// Positional error of one particle, or its pose before a resim started.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DirtyParticleErrorInfo {
    handle: ParticleHandle,
    error_x: Vec3,
    error_r: Quat,
}

impl DirtyParticleErrorInfo {
    pub fn new(handle: ParticleHandle) -> Self {
        Self {
            handle,
            error_x: Vec3::ZERO,
            error_r: Quat::IDENTITY,
        }
    }

    pub fn with_error(handle: ParticleHandle, error_x: Vec3, error_r: Quat) -> Self {
        Self {
            handle,
            error_x,
            error_r,
        }
    }

    pub fn accumulate_error(&mut self, error_x: Vec3, error_r: Quat) {
        self.error_x += error_x;
        self.error_r *= error_r;
    }

    pub fn handle(&self) -> ParticleHandle {
        self.handle
    }

    pub fn error_x(&self) -> Vec3 {
        self.error_x
    }

    pub fn error_r(&self) -> Quat {
        self.error_r
    }
}

impl DirtyEntry for DirtyParticleErrorInfo {
    type Key = ParticleHandle;

    fn key(&self) -> ParticleHandle {
        self.handle
    }
}

/// Correction a resim applied to one particle, handed to rendering for smoothing.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleReplicationError {
    pub error_x: Vec3,
    pub error_r: Quat,
}
