//! Property groups captured in history, and how each maps onto its live object.
//!
//! Every group is a plain `Copy` value. The all-zero bit pattern is valid for each of
//! them, which lets the pool hand out zeroed slots and gives exact-mode buffers their
//! "no entry means zero" comparison value.
use bytemuck::Zeroable;
use glam::{Quat, Vec3};

use crate::{
    history::PoolProperty,
    world::{Joint, Particle, ParticleHandle},
};

/// Copies a property group between a live object and a history slot.
pub trait HistoryProperty<Head>: PoolProperty + Copy + PartialEq {
    fn copy_from(head: &Head) -> Self;
    fn apply_to(&self, head: &mut Head);
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticlePositionRotation {
    pub x: Vec3,
    pub r: Quat,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleVelocities {
    pub v: Vec3,
    pub w: Vec3,
}

/// Per-step forces and impulses. Cleared by the solver after every step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleDynamics {
    pub acceleration: Vec3,
    pub angular_acceleration: Vec3,
    pub linear_impulse_velocity: Vec3,
    pub angular_impulse_velocity: Vec3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    #[default]
    Uninitialized = 0,
    Sleeping,
    Kinematic,
    Static,
    Dynamic,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleDynamicMisc {
    pub linear_ether_drag: f32,
    pub angular_ether_drag: f32,
    pub max_linear_speed_sq: f32,
    pub max_angular_speed_sq: f32,
    pub initial_overlap_depenetration_velocity: f32,
    pub sleep_threshold_multiplier: f32,
    pub object_state: ObjectState,
    pub collision_group: i32,
    pub control_flags: u8,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleMassProps {
    pub center_of_mass: Vec3,
    pub rotation_of_mass: Quat,
    pub inertia: Vec3,
    pub mass: f32,
    pub inv_mass: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum KinematicTargetMode {
    #[default]
    None = 0,
    Reset,
    Position,
    Velocity,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KinematicTarget {
    pub mode: KinematicTargetMode,
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParticleNonFrequentData {
    pub geometry: u32,
    pub unique_idx: u32,
    pub spatial_idx: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum JointMotion {
    #[default]
    Free = 0,
    Limited,
    Locked,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct JointSettings {
    pub stiffness: f32,
    pub linear_projection: f32,
    pub angular_projection: f32,
    pub linear_limit: f32,
    pub angular_limits: Vec3,
    pub linear_motion: [JointMotion; 3],
    pub angular_motion: [JointMotion; 3],
    pub collision_enabled: bool,
    pub projection_enabled: bool,
    pub linear_break_force: f32,
    pub angular_break_force: f32,
}

/// The pair of particles a joint constrains.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JointProxies {
    pub particles: [ParticleHandle; 2],
}

// SAFETY: every field is a float, integer, bool, fieldless `repr(u8)` enum with a zero
// discriminant, glam vector or handle, all valid as zero bytes.
unsafe impl Zeroable for ParticlePositionRotation {}
unsafe impl Zeroable for ParticleVelocities {}
unsafe impl Zeroable for ParticleDynamics {}
unsafe impl Zeroable for ParticleDynamicMisc {}
unsafe impl Zeroable for ParticleMassProps {}
unsafe impl Zeroable for KinematicTarget {}
unsafe impl Zeroable for ParticleNonFrequentData {}
unsafe impl Zeroable for JointSettings {}
unsafe impl Zeroable for JointProxies {}

macro_rules! history_property {
    ($ty:ty, $head:ty, $field:ident) => {
        impl HistoryProperty<$head> for $ty {
            fn copy_from(head: &$head) -> Self {
                head.$field
            }
            fn apply_to(&self, head: &mut $head) {
                head.$field = *self;
            }
        }
    };
}

history_property!(ParticlePositionRotation, Particle, xr);
history_property!(ParticleVelocities, Particle, velocities);
history_property!(ParticleDynamics, Particle, dynamics);
history_property!(ParticleDynamicMisc, Particle, misc);
history_property!(ParticleMassProps, Particle, mass);
history_property!(KinematicTarget, Particle, kinematic_target);
history_property!(ParticleNonFrequentData, Particle, non_frequent);
history_property!(JointSettings, Joint, settings);
history_property!(JointProxies, Joint, proxies);

impl ParticleDynamics {
    pub fn is_zero(&self) -> bool {
        *self == Self::zeroed()
    }
}
