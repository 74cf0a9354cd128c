//! Rollback history for a fixed-step physics simulation.
//!
//! `RewindData` records the state of every object that diverges from its live value
//! ("dirty" objects) into per-property ring buffers, one entry per frame phase. Objects
//! that were never dirtied are not recorded at all: their live state is their history.
//!
//! A frame goes through `advance_frame`, the phase captures (`PrePushData`,
//! `PostPushData`, `PostCallbacks`) and `finish_frame`. When authoritative targets
//! disagree with what was simulated, `rewind_to_frame` restores a past frame and the
//! same sequence is replayed until `latest_frame` is reached again.
use std::{
    collections::HashMap,
    fmt::{Debug, Display, Write as _},
    hash::Hash,
};

use tracing::{debug, trace, warn};

use crate::{
    history::{CircularBuffer, DirtyPropertiesPool, FrameAndPhase, Phase, PropertyBuffer},
    registry::{AllowShrinking, DirtyObjects},
    state::{
        GeometryParticleState, GeometryParticleStateBase, HistoryProperty, JointState,
        JointStateBase, ParticleHistoryState, ParticlePositionRotation, ParticleVelocities,
    },
    world::{
        DirtyJointData, DirtyParticleData, Joint, JointHandle, Particle, ParticleHandle, SyncState,
        World,
    },
    RewindError,
};

pub mod callback;
pub mod config;
pub mod dirty;
mod histories;
mod resim;
pub mod stepper;

pub use callback::{NoRewindCallback, ResimCache, ResimDebugInfo, RewindCallback};
pub use config::{ResimFrameValidation, RewindConfig};
pub use dirty::{
    DirtyJointInfo, DirtyObjectInfo, DirtyParticleErrorInfo, DirtyParticleInfo, ObjectHistory,
    ParticleReplicationError,
};
pub use histories::SharedHistory;
pub use resim::TargetState;
pub use stepper::{EulerIntegrator, RewindStepper, Simulate};

/// One slot of the frame manager ring.
#[derive(Default)]
struct FrameManagerInfo {
    external_resim_cache: Option<Box<dyn ResimCache>>,
    // a slot can hold data of two frames at once, this is the frame it was last set up for
    frame_created_for: Option<i32>,
    delta_time: f32,
}

impl Debug for FrameManagerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameManagerInfo")
            .field("has_resim_cache", &self.external_resim_cache.is_some())
            .field("frame_created_for", &self.frame_created_for)
            .field("delta_time", &self.delta_time)
            .finish()
    }
}

#[derive(Debug)]
pub struct RewindData {
    config: RewindConfig,
    managers: CircularBuffer<FrameManagerInfo>,
    properties_pool: DirtyPropertiesPool,

    dirty_particles: DirtyObjects<DirtyParticleInfo>,
    dirty_joints: DirtyObjects<DirtyJointInfo>,
    dirty_particle_pre_resim_state: DirtyObjects<DirtyParticleErrorInfo>,
    dirty_particle_errors: DirtyObjects<DirtyParticleErrorInfo>,

    cur_frame: i32,
    latest_frame: i32,
    frames_saved: i32,
    resim_frame: Option<i32>,
    latest_target_frame: Option<i32>,
    // targets not compared against history yet
    unchecked_targets: Vec<(ParticleHandle, FrameAndPhase)>,
    // rewinds may never go back past this frame
    block_resim_frame: Option<i32>,

    input_histories: histories::RegisteredHistories,
    state_histories: histories::RegisteredHistories,
}

impl RewindData {
    pub fn new(config: RewindConfig, current_frame: i32) -> Result<Self, RewindError> {
        config.validate()?;
        let managers = CircularBuffer::new(config.num_frames + 1)?;
        Ok(Self {
            config,
            managers,
            properties_pool: DirtyPropertiesPool::new(),
            dirty_particles: DirtyObjects::new(),
            dirty_joints: DirtyObjects::new(),
            dirty_particle_pre_resim_state: DirtyObjects::new(),
            dirty_particle_errors: DirtyObjects::new(),
            cur_frame: current_frame,
            latest_frame: current_frame,
            frames_saved: 0,
            resim_frame: None,
            latest_target_frame: None,
            unchecked_targets: Vec::new(),
            block_resim_frame: None,
            input_histories: Default::default(),
            state_histories: Default::default(),
        })
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Number of frame manager slots.
    pub fn capacity(&self) -> usize {
        self.managers.capacity()
    }

    pub fn current_frame(&self) -> i32 {
        self.cur_frame
    }

    pub fn latest_frame(&self) -> i32 {
        self.latest_frame
    }

    pub fn frames_saved(&self) -> i32 {
        self.frames_saved
    }

    /// Oldest frame history can be queried for.
    pub fn earliest_frame(&self) -> i32 {
        self.cur_frame - self.frames_saved
    }

    pub fn is_resim(&self) -> bool {
        self.cur_frame < self.latest_frame
    }

    pub fn is_final_resim(&self) -> bool {
        self.cur_frame + 1 == self.latest_frame
    }

    pub fn is_frame_within_rewind_history(&self, frame: i32) -> bool {
        frame < self.cur_frame && frame >= self.earliest_frame()
    }

    pub fn resim_frame(&self) -> Option<i32> {
        self.resim_frame
    }

    pub fn set_resim_frame(&mut self, frame: Option<i32>) {
        self.resim_frame = frame;
    }

    pub fn blocked_resim_frame(&self) -> Option<i32> {
        self.block_resim_frame
    }

    pub fn latest_target_frame(&self) -> Option<i32> {
        self.latest_target_frame
    }

    pub fn set_rewind_data_optimization(&mut self, enabled: bool) {
        self.config.rewind_data_optimization = enabled;
    }

    pub fn num_dirty_particles(&self) -> usize {
        self.dirty_particles.len()
    }

    pub fn num_dirty_joints(&self) -> usize {
        self.dirty_joints.len()
    }

    pub fn dirty_particle(&self, handle: ParticleHandle) -> Option<&DirtyParticleInfo> {
        self.dirty_particles.find(handle)
    }

    pub fn dirty_joint(&self, handle: JointHandle) -> Option<&DirtyJointInfo> {
        self.dirty_joints.find(handle)
    }

    pub fn properties_pool(&self) -> &DirtyPropertiesPool {
        &self.properties_pool
    }

    /// Step size recorded for `frame`, if its manager slot was not reused since.
    pub fn delta_time_for_frame(&self, frame: i32) -> Option<f32> {
        let manager = &self.managers[frame];
        if manager.frame_created_for != Some(frame) {
            warn!(frame, created_for = ?manager.frame_created_for, "no delta time recorded for frame");
            return None;
        }
        Some(manager.delta_time)
    }

    pub fn current_step_resim_cache(&mut self) -> Option<&mut (dyn ResimCache + 'static)> {
        self.managers[self.cur_frame].external_resim_cache.as_deref_mut()
    }

    /// Called once per frame before the solver runs.
    ///
    /// `create_cache` is only invoked when collision resim caching is on and the slot of
    /// the current frame holds no cache yet.
    pub fn advance_frame<F>(&mut self, delta_time: f32, create_cache: F)
    where
        F: FnOnce() -> Option<Box<dyn ResimCache>>,
    {
        let frame = self.cur_frame;
        let is_resim = self.is_resim();
        let use_cache = self.config.use_collision_resim_cache;

        let manager = &mut self.managers[frame];
        manager.delta_time = delta_time;
        manager.frame_created_for = Some(frame);
        if use_cache {
            if is_resim {
                if let Some(cache) = manager.external_resim_cache.as_mut() {
                    cache.set_resimming(true);
                }
            } else {
                match manager.external_resim_cache.as_mut() {
                    Some(cache) => cache.reset_cache(),
                    None => manager.external_resim_cache = create_cache(),
                }
                if let Some(cache) = manager.external_resim_cache.as_mut() {
                    cache.set_resimming(false);
                }
            }
        } else {
            manager.external_resim_cache = None;
        }

        debug!(frame, resim = is_resim, delta_time, "advance frame");
        self.advance_frame_imp();
    }

    fn advance_frame_imp(&mut self) {
        if self.is_resim() {
            return;
        }
        let cur = self.cur_frame;
        let expiry = cur - 1 - self.frames_saved;

        for info in self.dirty_particles.iter_mut() {
            if info.dirty_dynamics.is_some_and(|frame| frame < cur) {
                info.dirty_dynamics = None;
            }
        }
        let pool = &mut self.properties_pool;
        let expired = expire_stale(&mut self.dirty_particles, pool, expiry, |info| {
            info.dirty_dynamics.is_none()
        });
        let expired_joints = expire_stale(&mut self.dirty_joints, pool, expiry, |_| true);
        if expired + expired_joints > 0 {
            trace!(frame = cur, expired, expired_joints, "released aged out history");
        }
        let dropped = self.input_histories.prune() + self.state_histories.prune();
        if dropped > 0 {
            trace!(frame = cur, dropped, "pruned dropped histories");
        }
    }

    /// Called once the solver finished a frame.
    pub fn finish_frame(&mut self, world: &mut World) {
        if self.is_final_resim() {
            for info in self.dirty_particles.iter_mut() {
                info.reset_resim_flags();
                if let Some(particle) = world.particle_mut(info.handle()) {
                    particle.sync_state = SyncState::InSync;
                }
            }
            for info in self.dirty_joints.iter_mut() {
                info.reset_resim_flags();
                if let Some(joint) = world.joint_mut(info.handle()) {
                    joint.sync_state = SyncState::InSync;
                }
            }
            for pre_resim in self.dirty_particle_pre_resim_state.iter() {
                let handle = pre_resim.handle();
                let Some(particle) = world.particle(handle) else {
                    continue;
                };
                let error_x = pre_resim.error_x() - particle.xr.x;
                let error_r = pre_resim.error_r() * particle.xr.r.inverse();
                match self.dirty_particle_errors.find_mut(handle) {
                    Some(error) => error.accumulate_error(error_x, error_r),
                    None => {
                        self.dirty_particle_errors
                            .add(DirtyParticleErrorInfo::with_error(handle, error_x, error_r));
                    }
                }
            }
            self.dirty_particle_pre_resim_state.reset();
            debug!(frame = self.cur_frame, "final resim frame finished");
        }

        self.cur_frame += 1;
        self.latest_frame = self.latest_frame.max(self.cur_frame);
        self.frames_saved = (self.frames_saved + 1).min(self.capacity() as i32);
    }

    /// Starts tracking a particle moved by the physics thread and records it at `PostPushData`.
    pub fn mark_dirty_from_pt(
        &mut self,
        world: &mut World,
        handle: ParticleHandle,
    ) -> Result<(), RewindError> {
        self.track_and_cache_particle(world, handle, Phase::PostPushData)
    }

    pub fn mark_dirty_joint_from_pt(
        &mut self,
        world: &mut World,
        handle: JointHandle,
    ) -> Result<(), RewindError> {
        let joint = world.joint_mut(handle).ok_or(RewindError::UnknownJoint)?;
        let key = FrameAndPhase::new(self.cur_frame, Phase::PostPushData);
        let resim = self.is_resim();
        let (info, pool) = self.find_or_add_dirty_joint(handle);
        info.add_frame(key.frame);
        cache_joint(info, joint, key, pool, resim)
    }

    /// Records the live state of every tracked object under `phase` of the current frame.
    ///
    /// During a resim, objects still in sync are only compared against what was recorded:
    /// a match leaves history untouched, a mismatch desyncs the object and records it.
    pub fn cache_current_dirty_data(
        &mut self,
        world: &mut World,
        phase: Phase,
    ) -> Result<(), RewindError> {
        if self.config.cache_one_phase && phase != Phase::PostPushData {
            return Ok(());
        }
        let key = FrameAndPhase::new(self.cur_frame, phase);
        let resim = self.is_resim();

        for info in self.dirty_particles.iter_mut() {
            let Some(particle) = world.particle_mut(info.handle()) else {
                continue;
            };
            if particle.disabled {
                continue;
            }
            cache_particle(info, particle, key, &mut self.properties_pool, resim)?;
        }
        for info in self.dirty_joints.iter_mut() {
            let Some(joint) = world.joint_mut(info.handle()) else {
                continue;
            };
            cache_joint(info, joint, key, &mut self.properties_pool, resim)?;
        }
        trace!(%key, particles = self.dirty_particles.len(), joints = self.dirty_joints.len(), "cached dirty data");
        Ok(())
    }

    /// Records the values game data is about to overwrite, before it is applied.
    ///
    /// Only the groups present in `dirty` are recorded, under `PrePushData` of the current
    /// frame. Apply the data with `DirtyParticleData::push_to_particle` afterwards.
    pub fn push_gt_dirty_data(
        &mut self,
        world: &World,
        handle: ParticleHandle,
        dirty: &DirtyParticleData,
    ) -> Result<(), RewindError> {
        let particle = world.try_particle(handle)?;
        if dirty.is_empty() || (self.is_resim() && particle.sync_state == SyncState::InSync) {
            return Ok(());
        }
        let key = FrameAndPhase::new(self.cur_frame, Phase::PrePushData);
        let (info, pool) = self.find_or_add_dirty_particle(handle, None);
        if dirty.dynamics.is_some() {
            info.dirty_dynamics = Some(key.frame);
        }
        let history = info.add_frame(key.frame);

        if dirty.xr.is_some() {
            write_group(&mut history.particle_position_rotation, particle, key, pool)?;
        }
        if dirty.velocities.is_some() {
            write_group(&mut history.velocities, particle, key, pool)?;
        }
        if dirty.misc.is_some() {
            write_group(&mut history.dynamics_misc, particle, key, pool)?;
        }
        if dirty.mass.is_some() {
            write_group(&mut history.mass_props, particle, key, pool)?;
        }
        if dirty.kinematic_target.is_some() {
            write_group(&mut history.kinematic_target, particle, key, pool)?;
        }
        if dirty.non_frequent.is_some() {
            write_group(&mut history.non_frequent_data, particle, key, pool)?;
        }
        if dirty.dynamics.is_some() && !particle.dynamics.is_zero() {
            write_group(&mut history.dynamics, particle, key, pool)?;
        }
        Ok(())
    }

    pub fn push_gt_dirty_joint_data(
        &mut self,
        world: &World,
        handle: JointHandle,
        dirty: &DirtyJointData,
    ) -> Result<(), RewindError> {
        let joint = world.try_joint(handle)?;
        if self.is_resim() && joint.sync_state == SyncState::InSync {
            return Ok(());
        }
        let key = FrameAndPhase::new(self.cur_frame, Phase::PrePushData);
        let (info, pool) = self.find_or_add_dirty_joint(handle);
        let history = info.add_frame(key.frame);
        if dirty.settings.is_some() {
            write_group(&mut history.joint_settings, joint, key, pool)?;
        }
        if dirty.proxies.is_some() {
            write_group(&mut history.joint_proxies, joint, key, pool)?;
        }
        Ok(())
    }

    /// Records a particle after sim callbacks ran, right before the solver moves it.
    pub fn push_pt_dirty_data(
        &mut self,
        world: &mut World,
        handle: ParticleHandle,
    ) -> Result<(), RewindError> {
        let phase = if self.config.cache_one_phase {
            Phase::PostPushData
        } else {
            Phase::PostCallbacks
        };
        self.track_and_cache_particle(world, handle, phase)
    }

    /// Tracks a particle spawned on `initialized_step` so a rewind before that step disables it.
    pub fn spawn_proxy_if_needed(
        &mut self,
        world: &World,
        handle: ParticleHandle,
        initialized_step: i32,
    ) -> Result<(), RewindError> {
        world.try_particle(handle)?;
        if initialized_step < self.earliest_frame() {
            return Ok(());
        }
        self.find_or_add_dirty_particle(handle, Some(initialized_step));
        Ok(())
    }

    /// Stops tracking a particle and frees its history.
    pub fn remove_particle(&mut self, handle: ParticleHandle, allow_shrinking: AllowShrinking) {
        if let Some(mut info) = self.dirty_particles.remove(handle, allow_shrinking) {
            info.release(&mut self.properties_pool);
        }
        let _ = self.dirty_particle_pre_resim_state.remove(handle, allow_shrinking);
        let _ = self.dirty_particle_errors.remove(handle, allow_shrinking);
        self.unchecked_targets.retain(|&(target, _)| target != handle);
        self.input_histories.forget_particle(handle);
        self.state_histories.forget_particle(handle);
    }

    pub fn remove_joint(&mut self, handle: JointHandle, allow_shrinking: AllowShrinking) {
        if let Some(mut info) = self.dirty_joints.remove(handle, allow_shrinking) {
            info.release(&mut self.properties_pool);
        }
    }

    /// Stops tracking every object and gives their history slots back to the pool.
    pub fn clear_dirty_objects(&mut self) {
        let pool = &mut self.properties_pool;
        let particles = self.dirty_particles.len();
        for mut info in self.dirty_particles.drain() {
            info.release(pool);
        }
        for mut info in self.dirty_joints.drain() {
            info.release(pool);
        }
        self.dirty_particle_pre_resim_state.reset();
        self.dirty_particle_errors.reset();
        self.unchecked_targets.clear();
        debug!(frame = self.cur_frame, particles, "cleared tracked objects");
    }

    /// State of a particle as it was at `(frame, phase)`.
    ///
    /// Refused while resimulating, and for frames older than the retained window.
    pub fn get_past_state_at_frame<'a>(
        &'a self,
        world: &'a World,
        handle: ParticleHandle,
        frame: i32,
        phase: Phase,
    ) -> Result<GeometryParticleState<'a>, RewindError> {
        self.check_history_query(frame)?;
        let particle = world.try_particle(handle)?;
        let state = self.dirty_particles.find(handle).map(DirtyParticleInfo::history);
        Ok(GeometryParticleState::new(
            handle,
            particle,
            &self.properties_pool,
            state,
            FrameAndPhase::new(frame, phase),
        ))
    }

    pub fn get_past_joint_state_at_frame<'a>(
        &'a self,
        world: &'a World,
        handle: JointHandle,
        frame: i32,
        phase: Phase,
    ) -> Result<JointState<'a>, RewindError> {
        self.check_history_query(frame)?;
        let joint = world.try_joint(handle)?;
        let state = self.dirty_joints.find(handle).map(DirtyJointInfo::history);
        Ok(JointState::new(
            handle,
            joint,
            &self.properties_pool,
            state,
            FrameAndPhase::new(frame, phase),
        ))
    }

    /// Grows the retained window so `frame` is queryable, bounded by capacity.
    pub fn extend_history_with_frame(&mut self, frame: i32) {
        let needed = self.cur_frame - frame;
        self.frames_saved = self
            .frames_saved
            .max(needed)
            .min(self.capacity() as i32);
    }

    /// Drops the history of one particle from `(frame, phase)` on.
    pub fn clear_phase_and_future(&mut self, handle: ParticleHandle, frame: i32, phase: Phase) {
        if let Some(info) = self.dirty_particles.find_mut(handle) {
            info.clear_phase_and_future(FrameAndPhase::new(frame, phase));
        }
    }

    /// Writes an externally supplied state into a particle's history at `(frame, phase)`.
    ///
    /// Unlike the per-frame captures this may land anywhere in the past; later entries are
    /// kept and shifted.
    pub fn push_state_at_frame(
        &mut self,
        world: &World,
        handle: ParticleHandle,
        frame: i32,
        phase: Phase,
        state: &TargetState,
    ) -> Result<(), RewindError> {
        let particle = world.try_particle(handle)?;
        let key = FrameAndPhase::new(frame, phase);
        let (info, pool) = self.find_or_add_dirty_particle(handle, None);
        info.last_dirty_frame = info.last_dirty_frame.max(frame);
        let history = info.history_mut();

        *history.particle_position_rotation.insert(key, pool) = ParticlePositionRotation {
            x: state.position,
            r: state.rotation,
        };
        *history.velocities.insert(key, pool) = ParticleVelocities {
            v: state.linear_velocity,
            w: state.angular_velocity,
        };
        *history.dynamics_misc.insert(key, pool) = state.misc_for(particle);
        Ok(())
    }

    /// Saves the position and velocity cursors of a particle's history.
    pub fn extract_history_state(&mut self, handle: ParticleHandle) -> ParticleHistoryState {
        self.find_or_add_dirty_particle(handle, None)
            .0
            .history()
            .extract_history_state()
    }

    pub fn restore_history_state(&mut self, handle: ParticleHandle, state: ParticleHistoryState) {
        self.find_or_add_dirty_particle(handle, None)
            .0
            .history_mut()
            .restore_history_state(state);
    }

    /// Moves accumulated post-resim corrections into `errors`, summing with what is there.
    pub fn buffer_physics_results(
        &mut self,
        errors: &mut HashMap<ParticleHandle, ParticleReplicationError>,
    ) {
        for info in self.dirty_particle_errors.iter() {
            errors
                .entry(info.handle())
                .and_modify(|error| {
                    error.error_x += info.error_x();
                    error.error_r *= info.error_r();
                })
                .or_insert(ParticleReplicationError {
                    error_x: info.error_x(),
                    error_r: info.error_r(),
                });
        }
        self.dirty_particle_errors.reset();
    }

    /// Renders every tracked object's history. Frames are shifted by `frame_print_offset`.
    pub fn dump_history(&self, frame_print_offset: i32) -> String {
        let pool = &self.properties_pool;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "frame {} latest {} saved {} resim {:?} blocked {:?}",
            self.cur_frame + frame_print_offset,
            self.latest_frame + frame_print_offset,
            self.frames_saved,
            self.resim_frame,
            self.block_resim_frame
        );
        for info in self.dirty_particles.iter() {
            let _ = writeln!(
                out,
                "{} last_dirty {} initialized_on {:?} follower {} needs_resim {}",
                info.handle(),
                info.last_dirty_frame + frame_print_offset,
                info.initialized_on_step,
                info.resim_as_follower,
                info.needs_resim
            );
            let history = info.history();
            for (key, xr) in history.particle_position_rotation.iter(pool) {
                let _ = writeln!(out, "  {}/{} x {} r {}", key.frame + frame_print_offset, key.phase, xr.x, xr.r);
            }
            for (key, vel) in history.velocities.iter(pool) {
                let _ = writeln!(out, "  {}/{} v {} w {}", key.frame + frame_print_offset, key.phase, vel.v, vel.w);
            }
            for (key, target) in history.target_positions.iter(pool) {
                let _ = writeln!(out, "  {}/{} target x {}", key.frame + frame_print_offset, key.phase, target.x);
            }
        }
        for info in self.dirty_joints.iter() {
            let _ = writeln!(out, "{} last_dirty {}", info.handle(), info.last_dirty_frame + frame_print_offset);
            for (key, settings) in info.history().joint_settings.iter(pool) {
                let _ = writeln!(out, "  {}/{} stiffness {}", key.frame + frame_print_offset, key.phase, settings.stiffness);
            }
        }
        debug!(history = %out, "rewind history dump");
        out
    }

    fn check_history_query(&self, frame: i32) -> Result<(), RewindError> {
        if self.is_resim() {
            warn!(frame, "history queried during a resim");
            return Err(RewindError::ResimInProgress);
        }
        if frame < self.earliest_frame() {
            warn!(frame, earliest = self.earliest_frame(), "history queried before the retained window");
            return Err(RewindError::FrameOutOfHistory {
                frame,
                earliest: self.earliest_frame(),
                current: self.cur_frame,
            });
        }
        Ok(())
    }

    fn track_and_cache_particle(
        &mut self,
        world: &mut World,
        handle: ParticleHandle,
        phase: Phase,
    ) -> Result<(), RewindError> {
        let particle = world.try_particle_mut(handle)?;
        let key = FrameAndPhase::new(self.cur_frame, phase);
        let resim = self.is_resim();
        let (info, pool) = self.find_or_add_dirty_particle(handle, None);
        info.add_frame(key.frame);
        cache_particle(info, particle, key, pool, resim)
    }

    /// Tracked entry of `handle`, created on first use, together with the pool its history
    /// writes into.
    pub(crate) fn find_or_add_dirty_particle(
        &mut self,
        handle: ParticleHandle,
        initialized_on: Option<i32>,
    ) -> (&mut DirtyParticleInfo, &mut DirtyPropertiesPool) {
        let size = self.managers.capacity();
        let one_phase = self.config.cache_one_phase;
        let info = find_or_add(&mut self.dirty_particles, handle, self.cur_frame, || {
            GeometryParticleStateBase::new(size, one_phase)
        });
        if info.initialized_on_step.is_none() {
            info.initialized_on_step = initialized_on;
        }
        (info, &mut self.properties_pool)
    }

    fn find_or_add_dirty_joint(
        &mut self,
        handle: JointHandle,
    ) -> (&mut DirtyJointInfo, &mut DirtyPropertiesPool) {
        let size = self.managers.capacity();
        let one_phase = self.config.cache_one_phase;
        let info = find_or_add(&mut self.dirty_joints, handle, self.cur_frame, || {
            JointStateBase::new(size, one_phase)
        });
        (info, &mut self.properties_pool)
    }
}

fn find_or_add<H, S>(
    objects: &mut DirtyObjects<DirtyObjectInfo<H, S>>,
    handle: H,
    cur_frame: i32,
    make_history: impl FnOnce() -> S,
) -> &mut DirtyObjectInfo<H, S>
where
    H: Copy + Eq + Hash + Debug,
    S: ObjectHistory,
{
    if objects.contains(handle) {
        objects.find_checked_mut(handle)
    } else {
        trace!(?handle, frame = cur_frame, "tracking object");
        objects.add(DirtyObjectInfo::new(handle, make_history(), cur_frame))
    }
}

/// Swap-removes every object last dirtied before `expiry` and releases its history.
fn expire_stale<H, S>(
    objects: &mut DirtyObjects<DirtyObjectInfo<H, S>>,
    pool: &mut DirtyPropertiesPool,
    expiry: i32,
    can_expire: impl Fn(&DirtyObjectInfo<H, S>) -> bool,
) -> usize
where
    H: Copy + Eq + Hash + Debug + Display,
    S: ObjectHistory,
{
    let mut expired = 0;
    // back to front, swap-remove only moves already visited entries
    for idx in (0..objects.len()).rev() {
        let info = objects.dense_at(idx);
        if info.last_dirty_frame >= expiry || !can_expire(info) {
            continue;
        }
        if let Some(mut info) = objects.remove_at(idx, AllowShrinking::No) {
            trace!(object = %info.handle(), last_dirty = info.last_dirty_frame, "history aged out");
            info.release(pool);
            expired += 1;
        }
    }
    expired
}

fn write_group<H, T, const NO_ENTRY_IS_HEAD: bool>(
    buffer: &mut PropertyBuffer<T, NO_ENTRY_IS_HEAD>,
    head: &H,
    key: FrameAndPhase,
    pool: &mut DirtyPropertiesPool,
) -> Result<(), RewindError>
where
    T: HistoryProperty<H>,
{
    if let Some(slot) = buffer.write_access_non_decreasing(key, pool)? {
        *slot = T::copy_from(head);
    }
    Ok(())
}

fn record_particle(
    history: &mut GeometryParticleStateBase,
    particle: &Particle,
    key: FrameAndPhase,
    pool: &mut DirtyPropertiesPool,
) -> Result<(), RewindError> {
    write_group(&mut history.particle_position_rotation, particle, key, pool)?;
    write_group(&mut history.non_frequent_data, particle, key, pool)?;
    write_group(&mut history.velocities, particle, key, pool)?;
    write_group(&mut history.dynamics_misc, particle, key, pool)?;
    write_group(&mut history.mass_props, particle, key, pool)?;
    write_group(&mut history.kinematic_target, particle, key, pool)?;
    // absent dynamics read back as zero
    if !particle.dynamics.is_zero() {
        write_group(&mut history.dynamics, particle, key, pool)?;
    }
    Ok(())
}

fn cache_particle(
    info: &mut DirtyParticleInfo,
    particle: &mut Particle,
    key: FrameAndPhase,
    pool: &mut DirtyPropertiesPool,
    resim: bool,
) -> Result<(), RewindError> {
    if resim && particle.sync_state == SyncState::InSync {
        // forces are consumed by the solver before the post-callback capture is compared
        let in_sync = if key.phase == Phase::PostCallbacks {
            info.history().is_in_sync::<true>(particle, key, pool)
        } else {
            info.history().is_in_sync::<false>(particle, key, pool)
        };
        if in_sync {
            return Ok(());
        }
        debug!(particle = %info.handle(), %key, "particle desynced during resim");
        info.clear_phase_and_future(key);
        particle.sync_state = SyncState::HardDesync;
    }
    record_particle(info.history_mut(), particle, key, pool)
}

fn cache_joint(
    info: &mut DirtyJointInfo,
    joint: &mut Joint,
    key: FrameAndPhase,
    pool: &mut DirtyPropertiesPool,
    resim: bool,
) -> Result<(), RewindError> {
    if resim && joint.sync_state == SyncState::InSync {
        if info.history().is_in_sync(joint, key, pool) {
            return Ok(());
        }
        debug!(joint = %info.handle(), %key, "joint desynced during resim");
        info.clear_phase_and_future(key);
        joint.sync_state = SyncState::HardDesync;
    }
    let history = info.history_mut();
    write_group(&mut history.joint_settings, joint, key, pool)?;
    write_group(&mut history.joint_proxies, joint, key, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::ParticleKind;
    use glam::{Quat, Vec3};

    fn setup(num_frames: usize, start: i32) -> (RewindData, World, ParticleHandle) {
        let rewind = RewindData::new(RewindConfig::default().with_num_frames(num_frames), start).unwrap();
        let mut world = World::new();
        let handle = world.spawn_particle(Particle::rigid());
        (rewind, world, handle)
    }

    fn no_cache() -> Option<Box<dyn ResimCache>> {
        None
    }

    fn run_frame(rewind: &mut RewindData, world: &mut World, handle: ParticleHandle, x: f32) {
        rewind.advance_frame(1.0 / 60.0, no_cache);
        world.particle_mut(handle).unwrap().xr.x = Vec3::new(x, 0.0, 0.0);
        rewind.mark_dirty_from_pt(world, handle).unwrap();
        rewind.cache_current_dirty_data(world, Phase::PostPushData).unwrap();
        rewind.finish_frame(world);
    }

    #[test]
    fn test_frame_bookkeeping() {
        let (mut rewind, mut world, handle) = setup(4, 10);
        assert_eq!(rewind.capacity(), 5);
        for frame in 10..20 {
            run_frame(&mut rewind, &mut world, handle, frame as f32);
        }
        assert_eq!(rewind.current_frame(), 20);
        assert_eq!(rewind.latest_frame(), 20);
        assert_eq!(rewind.frames_saved(), 5);
        assert_eq!(rewind.earliest_frame(), 15);
        assert!(!rewind.is_resim());
        assert!(rewind.is_frame_within_rewind_history(15));
        assert!(!rewind.is_frame_within_rewind_history(20));
        assert_eq!(rewind.delta_time_for_frame(19), Some(1.0 / 60.0));
        // slot of frame 14 was reused by frame 19
        assert_eq!(rewind.delta_time_for_frame(14), None);
    }

    #[test]
    fn test_past_state_resolves_history_and_head() {
        let (mut rewind, mut world, handle) = setup(8, 0);
        let untouched = world.spawn_particle(Particle::new(ParticleKind::Static).with_position(Vec3::Y));
        for frame in 0..4 {
            run_frame(&mut rewind, &mut world, handle, frame as f32 * 2.0);
        }
        let past = rewind
            .get_past_state_at_frame(&world, handle, 1, Phase::PostPushData)
            .unwrap();
        assert_eq!(past.x(), Vec3::new(2.0, 0.0, 0.0));

        let head = rewind
            .get_past_state_at_frame(&world, untouched, 1, Phase::PostPushData)
            .unwrap();
        assert_eq!(head.x(), Vec3::Y);
        assert!(!head.has_history());

        assert!(matches!(
            rewind.get_past_state_at_frame(&world, handle, -5, Phase::PostPushData),
            Err(RewindError::FrameOutOfHistory { frame: -5, .. })
        ));
    }

    #[test]
    fn test_gt_push_records_replaced_values() {
        let (mut rewind, mut world, handle) = setup(8, 0);
        rewind.advance_frame(0.1, no_cache);
        let dirty = DirtyParticleData {
            xr: Some(ParticlePositionRotation {
                x: Vec3::new(4.0, 0.0, 0.0),
                r: Quat::IDENTITY,
            }),
            dynamics: Some(crate::state::ParticleDynamics {
                acceleration: Vec3::Y,
                ..bytemuck::Zeroable::zeroed()
            }),
            ..Default::default()
        };
        rewind.push_gt_dirty_data(&world, handle, &dirty).unwrap();
        dirty.push_to_particle(world.particle_mut(handle).unwrap());
        rewind.cache_current_dirty_data(&mut world, Phase::PostPushData).unwrap();
        rewind.finish_frame(&mut world);

        let info = rewind.dirty_particle(handle).unwrap();
        assert_eq!(info.dirty_dynamics, Some(0));
        let before = rewind
            .get_past_state_at_frame(&world, handle, 0, Phase::PrePushData)
            .unwrap();
        assert_eq!(before.x(), Vec3::ZERO);
        assert_eq!(before.acceleration(), Vec3::ZERO);
        let after = rewind
            .get_past_state_at_frame(&world, handle, 0, Phase::PostPushData)
            .unwrap();
        assert_eq!(after.x(), Vec3::new(4.0, 0.0, 0.0));
        assert_eq!(after.acceleration(), Vec3::Y);

        // pending dynamics are dropped on the next advance
        rewind.advance_frame(0.1, no_cache);
        assert_eq!(rewind.dirty_particle(handle).unwrap().dirty_dynamics, None);
    }

    #[test]
    fn test_stale_objects_age_out() {
        let (mut rewind, mut world, handle) = setup(2, 0);
        let other = world.spawn_particle(Particle::rigid());
        rewind.mark_dirty_from_pt(&mut world, other).unwrap();
        for frame in 0..8 {
            run_frame(&mut rewind, &mut world, handle, frame as f32);
        }
        assert_eq!(rewind.num_dirty_particles(), 1);
        assert!(rewind.dirty_particle(other).is_none());
        assert!(rewind.dirty_particle(handle).is_some());

        rewind.remove_particle(handle, AllowShrinking::Yes);
        assert_eq!(rewind.num_dirty_particles(), 0);
        assert_eq!(rewind.properties_pool().num_live(), 0);
    }

    #[test]
    fn test_joint_history_and_removal() {
        let (mut rewind, mut world, handle) = setup(4, 0);
        let anchor = world.spawn_particle(Particle::new(ParticleKind::Static));
        let joint = world
            .add_joint(handle, anchor, bytemuck::Zeroable::zeroed())
            .unwrap();
        rewind.advance_frame(0.1, no_cache);
        rewind.mark_dirty_joint_from_pt(&mut world, joint).unwrap();
        rewind.finish_frame(&mut world);
        rewind.advance_frame(0.1, no_cache);
        let dirty = DirtyJointData {
            settings: Some(crate::state::JointSettings {
                stiffness: 2.0,
                ..bytemuck::Zeroable::zeroed()
            }),
            proxies: None,
        };
        rewind.push_gt_dirty_joint_data(&world, joint, &dirty).unwrap();
        dirty.push_to_joint(world.joint_mut(joint).unwrap());
        rewind.cache_current_dirty_data(&mut world, Phase::PostPushData).unwrap();
        rewind.finish_frame(&mut world);

        let past = rewind
            .get_past_joint_state_at_frame(&world, joint, 0, Phase::PostPushData)
            .unwrap();
        assert_eq!(past.settings().stiffness, 0.0);
        let now = rewind
            .get_past_joint_state_at_frame(&world, joint, 1, Phase::PostPushData)
            .unwrap();
        assert_eq!(now.settings().stiffness, 2.0);
        assert!(rewind.dump_history(0).contains("stiffness 2"));

        rewind.remove_joint(joint, AllowShrinking::No);
        assert_eq!(rewind.num_dirty_joints(), 0);
    }

    #[test]
    fn test_clear_releases_every_slot() {
        let (mut rewind, mut world, handle) = setup(4, 0);
        let anchor = world.spawn_particle(Particle::new(ParticleKind::Static));
        let joint = world
            .add_joint(handle, anchor, bytemuck::Zeroable::zeroed())
            .unwrap();
        rewind.mark_dirty_joint_from_pt(&mut world, joint).unwrap();
        for frame in 0..3 {
            run_frame(&mut rewind, &mut world, handle, frame as f32);
        }
        assert!(rewind.properties_pool().num_live() > 0);

        rewind.clear_dirty_objects();
        assert_eq!(rewind.num_dirty_particles(), 0);
        assert_eq!(rewind.num_dirty_joints(), 0);
        assert_eq!(rewind.properties_pool().num_live(), 0);

        // tracking starts over from the next capture
        run_frame(&mut rewind, &mut world, handle, 5.0);
        assert!(rewind.dirty_particle(handle).is_some());
    }

    #[test]
    fn test_resim_cache_lifecycle() {
        #[derive(Default)]
        struct CountingCache {
            resimming: bool,
            resets: u32,
        }
        impl ResimCache for CountingCache {
            fn set_resimming(&mut self, resimming: bool) {
                self.resimming = resimming;
            }
            fn is_resimming(&self) -> bool {
                self.resimming
            }
            fn reset_cache(&mut self) {
                self.resets += 1;
            }
        }

        let config = RewindConfig::default()
            .with_num_frames(4)
            .with_collision_resim_cache(true);
        let mut rewind = RewindData::new(config, 0).unwrap();
        let mut world = World::new();
        let mut created = 0;
        for _ in 0..3 {
            rewind.advance_frame(0.1, || {
                created += 1;
                Some(Box::new(CountingCache::default()) as Box<dyn ResimCache>)
            });
            assert!(!rewind.current_step_resim_cache().unwrap().is_resimming());
            rewind.finish_frame(&mut world);
        }
        assert_eq!(created, 3);

        rewind.rewind_to_frame(&mut world, 1).unwrap();
        rewind.advance_frame(0.1, no_cache);
        assert!(rewind.current_step_resim_cache().unwrap().is_resimming());
    }

    #[test]
    fn test_state_push_and_history_cursors() {
        let (mut rewind, mut world, handle) = setup(8, 0);
        for frame in 0..4 {
            run_frame(&mut rewind, &mut world, handle, frame as f32);
        }
        let saved = rewind.extract_history_state(handle);
        rewind.clear_phase_and_future(handle, 2, Phase::PostPushData);
        let state = TargetState {
            position: Vec3::new(7.0, 0.0, 0.0),
            should_sleep: true,
            ..TargetState::default()
        };
        rewind
            .push_state_at_frame(&world, handle, 2, Phase::PostPushData, &state)
            .unwrap();
        let pushed = rewind
            .get_past_state_at_frame(&world, handle, 2, Phase::PostPushData)
            .unwrap();
        assert_eq!(pushed.x(), Vec3::new(7.0, 0.0, 0.0));
        assert_eq!(pushed.object_state(), crate::state::ObjectState::Sleeping);

        rewind.restore_history_state(handle, saved);
        let restored = rewind
            .get_past_state_at_frame(&world, handle, 3, Phase::PostPushData)
            .unwrap();
        assert_eq!(restored.x(), Vec3::new(3.0, 0.0, 0.0));
    }
}
