use std::fmt::Display;

use crate::{
    history::{DirtyPropertiesPool, FrameAndPhase, PropertyBuffer},
    state::{particle::circular_size, HistoryProperty, JointProxies, JointSettings},
    world::{Joint, JointHandle},
};

/// Recorded settings and constrained pair of one joint.
#[derive(Debug)]
pub struct JointStateBase {
    pub joint_settings: PropertyBuffer<JointSettings>,
    pub joint_proxies: PropertyBuffer<JointProxies>,
}

impl JointStateBase {
    pub fn new(num_frames: usize, cache_one_phase: bool) -> Self {
        let size = circular_size(num_frames, cache_one_phase);
        Self {
            joint_settings: PropertyBuffer::new(size),
            joint_proxies: PropertyBuffer::new(size),
        }
    }

    pub fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        self.joint_settings.release(pool);
        self.joint_proxies.release(pool);
    }

    pub fn reset(&mut self) {
        self.joint_settings.reset();
        self.joint_proxies.reset();
    }

    pub fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        self.joint_settings.clear_entry_and_future(frame_and_phase);
        self.joint_proxies.clear_entry_and_future(frame_and_phase);
    }

    pub fn is_clean(&self, frame_and_phase: FrameAndPhase) -> bool {
        self.joint_settings.is_clean(frame_and_phase) && self.joint_proxies.is_clean(frame_and_phase)
    }

    pub fn is_in_sync(
        &self,
        joint: &Joint,
        frame_and_phase: FrameAndPhase,
        pool: &DirtyPropertiesPool,
    ) -> bool {
        self.joint_settings.is_in_sync(joint, frame_and_phase, pool)
            && self.joint_proxies.is_in_sync(joint, frame_and_phase, pool)
    }

    pub fn has_data_in_history(&self) -> bool {
        !(self.joint_settings.is_empty() && self.joint_proxies.is_empty())
    }

    pub fn restore_to(
        &self,
        joint: &mut Joint,
        frame_and_phase: FrameAndPhase,
        pool: &DirtyPropertiesPool,
    ) {
        if let Some(settings) = self.joint_settings.read(frame_and_phase, pool) {
            settings.apply_to(joint);
        }
        if let Some(proxies) = self.joint_proxies.read(frame_and_phase, pool) {
            proxies.apply_to(joint);
        }
    }
}

/// Joint state at one `FrameAndPhase`, falling back to the live joint.
pub struct JointState<'a> {
    handle: JointHandle,
    joint: &'a Joint,
    pool: &'a DirtyPropertiesPool,
    state: Option<&'a JointStateBase>,
    frame_and_phase: FrameAndPhase,
}

impl<'a> JointState<'a> {
    pub fn new(
        handle: JointHandle,
        joint: &'a Joint,
        pool: &'a DirtyPropertiesPool,
        state: Option<&'a JointStateBase>,
        frame_and_phase: FrameAndPhase,
    ) -> Self {
        Self {
            handle,
            joint,
            pool,
            state,
            frame_and_phase,
        }
    }

    pub fn handle(&self) -> JointHandle {
        self.handle
    }

    pub fn settings(&self) -> JointSettings {
        self.state
            .and_then(|state| state.joint_settings.read(self.frame_and_phase, self.pool))
            .copied()
            .unwrap_or(self.joint.settings)
    }

    pub fn proxies(&self) -> JointProxies {
        self.state
            .and_then(|state| state.joint_proxies.read(self.frame_and_phase, self.pool))
            .copied()
            .unwrap_or(self.joint.proxies)
    }
}

impl Display for JointState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [first, second] = self.proxies().particles;
        writeln!(f, "{} between {} and {} at {}", self.handle, first, second, self.frame_and_phase)?;
        let settings = self.settings();
        writeln!(f, "stiffness: {}", settings.stiffness)?;
        writeln!(f, "linear_projection: {}", settings.linear_projection)?;
        writeln!(f, "angular_projection: {}", settings.angular_projection)?;
        writeln!(f, "linear_limit: {}", settings.linear_limit)?;
        writeln!(f, "angular_limits: {}", settings.angular_limits)?;
        writeln!(f, "linear_motion: {:?}", settings.linear_motion)?;
        writeln!(f, "angular_motion: {:?}", settings.angular_motion)?;
        writeln!(f, "collision_enabled: {}", settings.collision_enabled)?;
        writeln!(f, "projection_enabled: {}", settings.projection_enabled)?;
        writeln!(f, "linear_break_force: {}", settings.linear_break_force)?;
        writeln!(f, "angular_break_force: {}", settings.angular_break_force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        history::Phase,
        world::{Particle, World},
    };
    use bytemuck::Zeroable;

    #[test]
    fn test_joint_history_overrides_head() {
        let mut world = World::new();
        let a = world.spawn_particle(Particle::rigid());
        let b = world.spawn_particle(Particle::rigid());
        let handle = world.add_joint(a, b, JointSettings::zeroed()).unwrap();
        let mut pool = DirtyPropertiesPool::new();
        let mut state = JointStateBase::new(2, false);

        let k = FrameAndPhase::new(3, Phase::PostPushData);
        let recorded = JointSettings {
            stiffness: 0.5,
            ..JointSettings::zeroed()
        };
        *state.joint_settings.write_access_monotonic(k, &mut pool).unwrap() = recorded;

        let joint = world.joint(handle).unwrap();
        assert!(!state.is_in_sync(joint, k, &pool));
        let view = JointState::new(handle, joint, &pool, Some(&state), k);
        assert_eq!(view.settings().stiffness, 0.5);
        assert_eq!(view.proxies().particles, [a, b]);
        assert!(view.to_string().contains("stiffness: 0.5"));

        let mut live = joint.clone();
        state.restore_to(&mut live, k, &pool);
        assert!(state.is_in_sync(&live, k, &pool));

        state.release(&mut pool);
        assert!(!state.has_data_in_history());
    }
}
