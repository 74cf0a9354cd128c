//! Recorded per-object state: the property groups, the per-particle and per-joint
//! aggregates of ring buffers, and the lazily resolved views handed out to callers.
pub mod joint;
pub mod particle;
pub mod properties;

pub use joint::{JointState, JointStateBase};
pub use particle::{GeometryParticleState, GeometryParticleStateBase, ParticleHistoryState};
pub use properties::{
    HistoryProperty, JointMotion, JointProxies, JointSettings, KinematicTarget,
    KinematicTargetMode, ObjectState, ParticleDynamicMisc, ParticleDynamics, ParticleMassProps,
    ParticleNonFrequentData, ParticlePositionRotation, ParticleVelocities,
};
