//! Live simulation objects the rewind history tracks.
//!
//! The `World` owns every particle and joint. Everything else refers to them through
//! copyable generational handles, so the history never keeps an object alive and a
//! destroyed object can never be reached through a stale key.
use std::fmt::Display;

use bytemuck::Zeroable;
use glam::{Quat, Vec3};

use crate::{
    state::{
        JointProxies, JointSettings, KinematicTarget, ObjectState, ParticleDynamicMisc,
        ParticleDynamics, ParticleMassProps, ParticleNonFrequentData, ParticlePositionRotation,
        ParticleVelocities,
    },
    RewindError,
};

pub mod arena;

pub use arena::{Arena, RawHandle};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleHandle(pub RawHandle);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointHandle(pub RawHandle);

// SAFETY: two `u32`s, all-zero is a valid (dead) handle.
unsafe impl Zeroable for ParticleHandle {}

impl Display for ParticleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Particle({}v{})", self.0.index, self.0.generation)
    }
}

impl Display for JointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Joint({}v{})", self.0.index, self.0.generation)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParticleKind {
    Static,
    Kinematic,
    Rigid,
}

/// Whether an object's live state still agrees with its recorded history during a resim.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    InSync,
    HardDesync,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub kind: ParticleKind,
    pub xr: ParticlePositionRotation,
    pub velocities: ParticleVelocities,
    pub dynamics: ParticleDynamics,
    pub misc: ParticleDynamicMisc,
    pub mass: ParticleMassProps,
    pub kinematic_target: KinematicTarget,
    pub non_frequent: ParticleNonFrequentData,
    pub sync_state: SyncState,
    pub disabled: bool,
}

impl Particle {
    pub fn new(kind: ParticleKind) -> Self {
        let object_state = match kind {
            ParticleKind::Static => ObjectState::Static,
            ParticleKind::Kinematic => ObjectState::Kinematic,
            ParticleKind::Rigid => ObjectState::Dynamic,
        };
        let (mass, inv_mass) = match kind {
            ParticleKind::Rigid => (1.0, 1.0),
            _ => (0.0, 0.0),
        };
        Self {
            kind,
            xr: ParticlePositionRotation {
                x: Vec3::ZERO,
                r: Quat::IDENTITY,
            },
            velocities: ParticleVelocities::zeroed(),
            dynamics: ParticleDynamics::zeroed(),
            misc: ParticleDynamicMisc {
                sleep_threshold_multiplier: 1.0,
                object_state,
                ..ParticleDynamicMisc::zeroed()
            },
            mass: ParticleMassProps {
                center_of_mass: Vec3::ZERO,
                rotation_of_mass: Quat::IDENTITY,
                inertia: Vec3::ONE,
                mass,
                inv_mass,
            },
            kinematic_target: KinematicTarget::zeroed(),
            non_frequent: ParticleNonFrequentData::zeroed(),
            sync_state: SyncState::InSync,
            disabled: false,
        }
    }

    pub fn rigid() -> Self {
        Self::new(ParticleKind::Rigid)
    }

    pub fn with_position(mut self, x: Vec3) -> Self {
        self.xr.x = x;
        self
    }

    pub fn with_velocity(mut self, v: Vec3) -> Self {
        self.velocities.v = v;
        self
    }

    pub fn is_kinematic(&self) -> bool {
        matches!(self.kind, ParticleKind::Kinematic | ParticleKind::Rigid)
    }

    pub fn is_rigid(&self) -> bool {
        self.kind == ParticleKind::Rigid
    }

    pub fn is_sleeping(&self) -> bool {
        self.misc.object_state == ObjectState::Sleeping
    }

    /// Puts a rigid particle to sleep, or wakes it back up as dynamic.
    pub fn set_sleeping(&mut self, sleeping: bool) {
        if !self.is_rigid() {
            return;
        }
        self.misc.object_state = if sleeping {
            self.velocities = ParticleVelocities::zeroed();
            ObjectState::Sleeping
        } else {
            ObjectState::Dynamic
        };
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Joint {
    pub settings: JointSettings,
    pub proxies: JointProxies,
    pub sync_state: SyncState,
}

/// Owner of all live particles and joints.
#[derive(Debug, Default)]
pub struct World {
    particles: Arena<Particle>,
    joints: Arena<Joint>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_particle(&mut self, particle: Particle) -> ParticleHandle {
        let handle = ParticleHandle(self.particles.insert(particle));
        if let Some(particle) = self.particles.get_mut(handle.0) {
            particle.non_frequent.unique_idx = handle.0.index;
        }
        handle
    }

    pub fn particle(&self, handle: ParticleHandle) -> Option<&Particle> {
        self.particles.get(handle.0)
    }

    pub fn particle_mut(&mut self, handle: ParticleHandle) -> Option<&mut Particle> {
        self.particles.get_mut(handle.0)
    }

    pub fn try_particle(&self, handle: ParticleHandle) -> Result<&Particle, RewindError> {
        self.particle(handle).ok_or(RewindError::UnknownParticle)
    }

    pub fn try_particle_mut(&mut self, handle: ParticleHandle) -> Result<&mut Particle, RewindError> {
        self.particle_mut(handle).ok_or(RewindError::UnknownParticle)
    }

    /// Destroys a particle. Joints attached to it stay alive with a dangling proxy.
    pub fn remove_particle(&mut self, handle: ParticleHandle) -> Option<Particle> {
        self.particles.remove(handle.0)
    }

    pub fn particles(&self) -> impl Iterator<Item = (ParticleHandle, &Particle)> {
        self.particles
            .iter()
            .map(|(raw, particle)| (ParticleHandle(raw), particle))
    }

    pub fn particles_mut(&mut self) -> impl Iterator<Item = (ParticleHandle, &mut Particle)> {
        self.particles
            .iter_mut()
            .map(|(raw, particle)| (ParticleHandle(raw), particle))
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    /// Connects two live particles.
    pub fn add_joint(
        &mut self,
        first: ParticleHandle,
        second: ParticleHandle,
        settings: JointSettings,
    ) -> Result<JointHandle, RewindError> {
        if !self.particles.contains(first.0) || !self.particles.contains(second.0) {
            return Err(RewindError::UnknownParticle);
        }
        let joint = Joint {
            settings,
            proxies: JointProxies {
                particles: [first, second],
            },
            sync_state: SyncState::InSync,
        };
        Ok(JointHandle(self.joints.insert(joint)))
    }

    pub fn joint(&self, handle: JointHandle) -> Option<&Joint> {
        self.joints.get(handle.0)
    }

    pub fn joint_mut(&mut self, handle: JointHandle) -> Option<&mut Joint> {
        self.joints.get_mut(handle.0)
    }

    pub fn try_joint(&self, handle: JointHandle) -> Result<&Joint, RewindError> {
        self.joint(handle).ok_or(RewindError::UnknownJoint)
    }

    pub fn remove_joint(&mut self, handle: JointHandle) -> Option<Joint> {
        self.joints.remove(handle.0)
    }

    pub fn joints(&self) -> impl Iterator<Item = (JointHandle, &Joint)> {
        self.joints.iter().map(|(raw, joint)| (JointHandle(raw), joint))
    }
}

/// Property groups written by the game side for one particle in one frame.
///
/// Only `Some` groups are dirty. `RewindData::push_gt_dirty_data` records the values they
/// replace before `push_to_particle` applies them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirtyParticleData {
    pub xr: Option<ParticlePositionRotation>,
    pub velocities: Option<ParticleVelocities>,
    pub dynamics: Option<ParticleDynamics>,
    pub misc: Option<ParticleDynamicMisc>,
    pub mass: Option<ParticleMassProps>,
    pub kinematic_target: Option<KinematicTarget>,
    pub non_frequent: Option<ParticleNonFrequentData>,
}

impl DirtyParticleData {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn push_to_particle(&self, particle: &mut Particle) {
        if let Some(xr) = self.xr {
            particle.xr = xr;
        }
        if let Some(velocities) = self.velocities {
            particle.velocities = velocities;
        }
        if let Some(dynamics) = self.dynamics {
            particle.dynamics = dynamics;
        }
        if let Some(misc) = self.misc {
            particle.misc = misc;
        }
        if let Some(mass) = self.mass {
            particle.mass = mass;
        }
        if let Some(target) = self.kinematic_target {
            particle.kinematic_target = target;
        }
        if let Some(non_frequent) = self.non_frequent {
            particle.non_frequent = non_frequent;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirtyJointData {
    pub settings: Option<JointSettings>,
    pub proxies: Option<JointProxies>,
}

impl DirtyJointData {
    pub fn push_to_joint(&self, joint: &mut Joint) {
        if let Some(settings) = self.settings {
            joint.settings = settings;
        }
        if let Some(proxies) = self.proxies {
            joint.proxies = proxies;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_requires_live_particles() {
        let mut world = World::new();
        let a = world.spawn_particle(Particle::rigid());
        let b = world.spawn_particle(Particle::new(ParticleKind::Static));
        let joint = world.add_joint(a, b, JointSettings::zeroed()).unwrap();
        assert_eq!(world.joint(joint).unwrap().proxies.particles, [a, b]);

        world.remove_particle(b);
        assert_eq!(
            world.add_joint(a, b, JointSettings::zeroed()),
            Err(RewindError::UnknownParticle)
        );
        assert_eq!(world.try_particle(b), Err(RewindError::UnknownParticle));
    }

    #[test]
    fn test_push_only_dirty_groups() {
        let mut particle = Particle::rigid().with_velocity(Vec3::X);
        let dirty = DirtyParticleData {
            xr: Some(ParticlePositionRotation {
                x: Vec3::new(0.0, 5.0, 0.0),
                r: Quat::IDENTITY,
            }),
            ..Default::default()
        };
        assert!(!dirty.is_empty());
        dirty.push_to_particle(&mut particle);
        assert_eq!(particle.xr.x.y, 5.0);
        assert_eq!(particle.velocities.v, Vec3::X);
    }

    #[test]
    fn test_sleep_only_applies_to_rigid() {
        let mut rigid = Particle::rigid().with_velocity(Vec3::ONE);
        rigid.set_sleeping(true);
        assert!(rigid.is_sleeping());
        assert_eq!(rigid.velocities.v, Vec3::ZERO);

        let mut kinematic = Particle::new(ParticleKind::Kinematic);
        kinematic.set_sleeping(true);
        assert_eq!(kinematic.misc.object_state, ObjectState::Kinematic);
    }
}
