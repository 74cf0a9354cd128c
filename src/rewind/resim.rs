//! Rewinding, target comparison and the per-frame work of a resimulation.
use glam::{Quat, Vec3};
use tracing::{debug, trace, warn};

use crate::{
    history::{FrameAndPhase, Phase},
    state::{ObjectState, ParticleDynamicMisc, ParticlePositionRotation, ParticleVelocities},
    world::{Particle, ParticleHandle, SyncState, World},
    RewindError,
};

use super::{DirtyParticleInfo, ResimFrameValidation, RewindData};

/// Authoritative state of a particle on some past frame, usually received from a server.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TargetState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub should_sleep: bool,
}

impl TargetState {
    /// The particle's misc group with its object state replaced by the target's sleep flag.
    pub fn misc_for(&self, particle: &Particle) -> ParticleDynamicMisc {
        let mut misc = particle.misc;
        if particle.is_rigid() {
            misc.object_state = if self.should_sleep {
                ObjectState::Sleeping
            } else {
                ObjectState::Dynamic
            };
        }
        misc
    }
}

fn earliest_of(current: Option<i32>, frame: i32) -> Option<i32> {
    Some(current.map_or(frame, |earliest| earliest.min(frame)))
}

impl RewindData {
    /// Restores every tracked object to its state at `frame` and starts a resim from there.
    ///
    /// `frame` must lie in `[earliest_frame, current_frame)`. Objects are restored from
    /// their `PostPushData` entry; particles spawned after `frame` are disabled until the
    /// resim reaches their spawn step.
    pub fn rewind_to_frame(&mut self, world: &mut World, frame: i32) -> Result<(), RewindError> {
        if self.is_resim() {
            warn!(frame, current = self.cur_frame, "rewind requested during a resim");
            return Err(RewindError::ResimInProgress);
        }
        if !self.is_frame_within_rewind_history(frame) {
            warn!(
                frame,
                earliest = self.earliest_frame(),
                current = self.cur_frame,
                "rewind outside of history"
            );
            return Err(RewindError::FrameOutOfHistory {
                frame,
                earliest: self.earliest_frame(),
                current: self.cur_frame,
            });
        }
        let key = FrameAndPhase::new(frame, Phase::PostPushData);
        let optimization = self.config.rewind_data_optimization;

        self.dirty_particle_pre_resim_state.reset();
        for info in self.dirty_particles.iter() {
            if let Some(particle) = world.particle(info.handle()) {
                self.dirty_particle_pre_resim_state
                    .add(super::DirtyParticleErrorInfo::with_error(
                        info.handle(),
                        particle.xr.x,
                        particle.xr.r,
                    ));
            }
        }

        let mut num_resim = 0;
        for info in self.dirty_particles.iter_mut() {
            let Some(particle) = world.particle_mut(info.handle()) else {
                continue;
            };
            info.history().restore_to(particle, key, &self.properties_pool);
            if info.initialized_on_step.is_some_and(|step| step > frame) {
                particle.disabled = true;
            }
            if !optimization || info.needs_resim {
                info.clear_phase_and_future(key);
                info.resim_as_follower = false;
                particle.sync_state = SyncState::HardDesync;
                num_resim += 1;
            } else {
                info.resim_as_follower = true;
                particle.sync_state = SyncState::InSync;
            }
        }
        for info in self.dirty_joints.iter_mut() {
            let Some(joint) = world.joint_mut(info.handle()) else {
                continue;
            };
            info.history().restore_to(joint, key, &self.properties_pool);
            if optimization {
                joint.sync_state = SyncState::InSync;
            } else {
                info.clear_phase_and_future(key);
                joint.sync_state = SyncState::HardDesync;
            }
        }

        let missing = self.missing_input_frames(frame, self.latest_frame);
        if missing > 0 {
            debug!(frame, missing, "registered inputs do not cover the whole resim");
        }
        self.frames_saved -= self.cur_frame - frame;
        self.cur_frame = frame;
        self.resim_frame = None;
        debug!(
            frame,
            latest = self.latest_frame,
            resimulated = num_resim,
            followers = self.dirty_particles.len() - num_resim,
            "rewound"
        );
        Ok(())
    }

    /// Compares targets received since the last call against what was simulated.
    ///
    /// Each target is checked once, as soon as its frame has been simulated. Targets for
    /// frames not simulated yet stay queued, targets older than the history window are
    /// dropped. Every particle whose history strays beyond the configured thresholds is
    /// flagged for a full resim. Returns the oldest frame with a mismatch.
    pub fn compare_targets_to_last_frame(&mut self, world: &World) -> Option<i32> {
        if self.config.skip_desync_test {
            self.unchecked_targets.clear();
            return None;
        }
        let earliest = self.earliest_frame();
        let cur = self.cur_frame;

        let mut unchecked = std::mem::take(&mut self.unchecked_targets);
        let mut rewind_frame = None;
        unchecked.retain(|&(handle, key)| {
            if key.frame >= cur {
                return true;
            }
            if key.frame >= earliest && self.check_target(world, handle, key) {
                rewind_frame = earliest_of(rewind_frame, key.frame);
            }
            false
        });
        self.unchecked_targets = unchecked;
        rewind_frame
    }

    /// Checks the target of `handle` at `key` against its history, flagging it on a mismatch.
    fn check_target(&mut self, world: &World, handle: ParticleHandle, key: FrameAndPhase) -> bool {
        let Some(particle) = world.particle(handle) else {
            return false;
        };
        let Some(info) = self.dirty_particles.find_mut(handle) else {
            return false;
        };
        let config = &self.config;
        let pool = &self.properties_pool;
        let history = info.history();
        let mut desync = false;

        if let Some(target) = history.target_positions.read(key, pool) {
            let local = history
                .particle_position_rotation
                .read(key, pool)
                .copied()
                .unwrap_or(particle.xr);
            desync |= Self::check_vector_threshold(target.x, local.x, config.position_threshold)
                || Self::check_quaternion_threshold(
                    target.r,
                    local.r,
                    config.rotation_threshold_degrees,
                );
        }
        if let Some(target) = history.target_velocities.read(key, pool) {
            let local = history
                .velocities
                .read(key, pool)
                .copied()
                .unwrap_or(particle.velocities);
            desync |= Self::check_vector_threshold(target.v, local.v, config.linear_velocity_threshold)
                || Self::check_vector_threshold(target.w, local.w, config.angular_velocity_threshold);
        }
        if let Some(target) = history.target_states.read(key, pool) {
            let local = history
                .dynamics_misc
                .read(key, pool)
                .copied()
                .unwrap_or(particle.misc);
            let target_sleeping = target.object_state == ObjectState::Sleeping;
            desync |= target_sleeping != (local.object_state == ObjectState::Sleeping);
        }

        if desync {
            debug!(particle = %handle, %key, "particle diverged from its target");
            info.needs_resim = true;
            info.resim_as_follower = false;
        }
        desync
    }

    /// Asks for a resim starting at `frame`, optionally flagging `particle` as the cause.
    ///
    /// The frame is clamped to the blocked frame and to the retained window, then moved to
    /// a frame every relevant particle has targets on. The last request wins.
    pub fn request_resimulation(&mut self, frame: i32, particle: Option<ParticleHandle>) {
        let mut requested = frame;
        if let Some(blocked) = self.block_resim_frame {
            if requested < blocked {
                debug!(requested, blocked, "resim request clamped to blocked frame");
                requested = blocked;
            }
        }
        let earliest = self.earliest_frame();
        if requested < earliest {
            debug!(requested, earliest, "resim request clamped to history window");
            requested = earliest;
        }
        if let Some(handle) = particle {
            match self.dirty_particles.find_mut(handle) {
                Some(info) => {
                    info.needs_resim = true;
                    info.resim_as_follower = false;
                }
                None => warn!(particle = %handle, "resim requested for an untracked particle"),
            }
        }
        let valid = self.find_valid_resim_frame(requested);
        debug!(frame, requested, valid, "resim requested");
        self.resim_frame = Some(valid);
    }

    /// Walks back from `requested` to the newest frame on which every candidate particle has
    /// a target, and an input when it has a registered input history. Falls back to
    /// `requested` when no frame qualifies.
    pub fn find_valid_resim_frame(&self, requested: i32) -> i32 {
        let validation = self.config.resim_frame_validation;
        let candidates: Vec<&DirtyParticleInfo> = self
            .dirty_particles
            .iter()
            .filter(|info| match validation {
                ResimFrameValidation::Particle => info.needs_resim,
                ResimFrameValidation::EntireFrame => {
                    !info.history().target_positions.is_empty()
                }
            })
            .collect();
        if candidates.is_empty() {
            return requested;
        }

        let floor = self
            .block_resim_frame
            .map_or(self.earliest_frame(), |blocked| blocked.max(self.earliest_frame()));
        let pool = &self.properties_pool;
        for frame in (floor..=requested).rev() {
            let keys = FrameAndPhase::phases_of(frame);
            let complete = candidates.iter().all(|info| {
                keys.iter()
                    .any(|&key| info.history().target_positions.read(key, pool).is_some())
                    && self.has_input_for(info.handle(), frame)
            });
            if complete {
                return frame;
            }
        }
        trace!(requested, floor, "no frame has targets for every candidate");
        requested
    }

    /// Forbids rewinding to any frame before the current one.
    pub fn block_resim(&mut self) {
        let frame = self
            .block_resim_frame
            .map_or(self.cur_frame, |blocked| blocked.max(self.cur_frame));
        self.block_resim_frame = Some(frame);
        debug!(frame, "resim blocked");
    }

    /// Records an authoritative state for a particle on a past frame.
    pub fn set_target_state_at_frame(
        &mut self,
        world: &World,
        handle: ParticleHandle,
        frame: i32,
        phase: Phase,
        target: &TargetState,
    ) -> Result<(), RewindError> {
        let particle = world.try_particle(handle)?;
        let key = FrameAndPhase::new(frame, phase);
        let (info, pool) = self.find_or_add_dirty_particle(handle, None);
        let history = info.history_mut();

        *history.target_positions.insert(key, pool) = ParticlePositionRotation {
            x: target.position,
            r: target.rotation,
        };
        *history.target_velocities.insert(key, pool) = ParticleVelocities {
            v: target.linear_velocity,
            w: target.angular_velocity,
        };
        *history.target_states.insert(key, pool) = target.misc_for(particle);

        self.latest_target_frame = Some(self.latest_target_frame.map_or(frame, |f| f.max(frame)));
        if !self.unchecked_targets.contains(&(handle, key)) {
            self.unchecked_targets.push((handle, key));
        }
        trace!(particle = %handle, %key, "target recorded");
        Ok(())
    }

    /// Writes recorded targets of `frame` onto the live particles.
    ///
    /// With `reset_simulation` every tracked particle is corrected, otherwise only those
    /// flagged for a resim. The newest phase with a target wins.
    pub fn apply_targets(&self, world: &mut World, frame: i32, reset_simulation: bool) {
        let keys = FrameAndPhase::phases_of(frame);
        let pool = &self.properties_pool;
        for info in self.dirty_particles.iter() {
            if !reset_simulation && !info.needs_resim {
                continue;
            }
            let Some(particle) = world.particle_mut(info.handle()) else {
                continue;
            };
            let history = info.history();
            let mut applied = false;
            if let Some(xr) = keys
                .iter()
                .rev()
                .find_map(|&key| history.target_positions.read(key, pool))
            {
                particle.xr = *xr;
                applied = true;
            }
            if let Some(velocities) = keys
                .iter()
                .rev()
                .find_map(|&key| history.target_velocities.read(key, pool))
            {
                particle.velocities = *velocities;
            }
            if let Some(state) = keys
                .iter()
                .rev()
                .find_map(|&key| history.target_states.read(key, pool))
            {
                particle.set_sleeping(state.object_state == ObjectState::Sleeping);
            }
            if applied {
                trace!(particle = %info.handle(), frame, "target applied");
            }
        }
    }

    /// Replays recorded state onto objects that follow history during a resim.
    ///
    /// Also re-enables particles whose spawn step is `frame`.
    pub fn step_non_resim_particles(&self, world: &mut World, frame: i32) {
        let key = FrameAndPhase::new(frame, Phase::PostPushData);
        let pool = &self.properties_pool;
        for info in self.dirty_particles.iter() {
            let Some(particle) = world.particle_mut(info.handle()) else {
                continue;
            };
            if info.initialized_on_step == Some(frame) {
                particle.disabled = false;
            }
            if info.resim_as_follower && particle.sync_state == SyncState::InSync {
                info.history().restore_to(particle, key, pool);
            }
        }
        for info in self.dirty_joints.iter() {
            let Some(joint) = world.joint_mut(info.handle()) else {
                continue;
            };
            if joint.sync_state == SyncState::InSync {
                info.history().restore_to(joint, key, pool);
            }
        }
    }

    /// True when `a` and `b` are further than `threshold` apart.
    pub fn check_vector_threshold(a: Vec3, b: Vec3, threshold: f32) -> bool {
        (a - b).length_squared() > threshold * threshold
    }

    /// True when the rotation between `a` and `b` exceeds `threshold_degrees`.
    pub fn check_quaternion_threshold(a: Quat, b: Quat, threshold_degrees: f32) -> bool {
        a.angle_between(b).to_degrees() > threshold_degrees
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        registry::AllowShrinking,
        rewind::{ParticleReplicationError, ResimCache, RewindConfig},
    };

    fn no_cache() -> Option<Box<dyn ResimCache>> {
        None
    }

    fn setup(config: RewindConfig) -> (RewindData, World, ParticleHandle) {
        let rewind = RewindData::new(config, 0).unwrap();
        let mut world = World::new();
        let handle = world.spawn_particle(Particle::rigid());
        (rewind, world, handle)
    }

    /// Runs frames `0..frames`, moving `handle` to `x = frame` each time.
    fn record_frames(rewind: &mut RewindData, world: &mut World, handle: ParticleHandle, frames: i32) {
        for frame in 0..frames {
            rewind.advance_frame(0.1, no_cache);
            world.particle_mut(handle).unwrap().xr.x = Vec3::new(frame as f32, 0.0, 0.0);
            rewind.mark_dirty_from_pt(world, handle).unwrap();
            rewind.cache_current_dirty_data(world, Phase::PostPushData).unwrap();
            rewind.finish_frame(world);
        }
    }

    fn target_at(x: f32) -> TargetState {
        TargetState {
            position: Vec3::new(x, 0.0, 0.0),
            ..TargetState::default()
        }
    }

    #[test]
    fn test_thresholds() {
        assert!(!RewindData::check_vector_threshold(Vec3::ZERO, Vec3::new(0.1, 0.0, 0.0), 0.1));
        assert!(RewindData::check_vector_threshold(Vec3::ZERO, Vec3::new(0.2, 0.0, 0.0), 0.1));
        let a = Quat::from_rotation_y(0.0);
        let b = Quat::from_rotation_y(2.0_f32.to_radians());
        assert!(RewindData::check_quaternion_threshold(a, b, 1.0));
        assert!(!RewindData::check_quaternion_threshold(a, b, 3.0));
        // q and -q are the same rotation
        assert!(!RewindData::check_quaternion_threshold(a, -a, 0.5));
    }

    #[test]
    fn test_rewind_restores_and_keeps_window() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        record_frames(&mut rewind, &mut world, handle, 6);
        let earliest = rewind.earliest_frame();

        rewind.rewind_to_frame(&mut world, 2).unwrap();
        assert_eq!(rewind.current_frame(), 2);
        assert_eq!(rewind.latest_frame(), 6);
        assert_eq!(rewind.earliest_frame(), earliest);
        assert!(rewind.is_resim());
        let particle = world.particle(handle).unwrap();
        assert_eq!(particle.xr.x, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(particle.sync_state, SyncState::HardDesync);
        assert_eq!(
            rewind.rewind_to_frame(&mut world, 1),
            Err(RewindError::ResimInProgress)
        );
    }

    #[test]
    fn test_rewind_outside_history_is_refused() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(2));
        record_frames(&mut rewind, &mut world, handle, 6);
        assert_eq!(rewind.earliest_frame(), 3);
        assert_eq!(
            rewind.rewind_to_frame(&mut world, 2),
            Err(RewindError::FrameOutOfHistory {
                frame: 2,
                earliest: 3,
                current: 6
            })
        );
        assert!(rewind.rewind_to_frame(&mut world, 6).is_err());
        assert_eq!(rewind.current_frame(), 6);
    }

    #[test]
    fn test_compare_flags_oldest_diverging_frame() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        let steady = world.spawn_particle(Particle::rigid());
        rewind.mark_dirty_from_pt(&mut world, steady).unwrap();
        record_frames(&mut rewind, &mut world, handle, 6);

        rewind
            .set_target_state_at_frame(&world, handle, 4, Phase::PostPushData, &target_at(9.0))
            .unwrap();
        rewind
            .set_target_state_at_frame(&world, handle, 3, Phase::PostPushData, &target_at(3.0))
            .unwrap();
        rewind
            .set_target_state_at_frame(&world, steady, 3, Phase::PostPushData, &target_at(0.0))
            .unwrap();
        assert_eq!(rewind.latest_target_frame(), Some(4));

        assert_eq!(rewind.compare_targets_to_last_frame(&world), Some(4));
        assert!(rewind.dirty_particle(handle).unwrap().needs_resim);
        assert!(!rewind.dirty_particle(steady).unwrap().needs_resim);
    }

    #[test]
    fn test_each_target_is_compared_once() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        record_frames(&mut rewind, &mut world, handle, 4);
        rewind
            .set_target_state_at_frame(&world, handle, 2, Phase::PrePushData, &target_at(7.0))
            .unwrap();
        rewind
            .set_target_state_at_frame(&world, handle, 5, Phase::PostPushData, &target_at(7.0))
            .unwrap();

        assert_eq!(rewind.compare_targets_to_last_frame(&world), Some(2));
        assert_eq!(rewind.compare_targets_to_last_frame(&world), None);

        // frame 5 is compared once it has been simulated
        record_frames(&mut rewind, &mut world, handle, 2);
        assert_eq!(rewind.current_frame(), 6);
        assert_eq!(rewind.compare_targets_to_last_frame(&world), Some(5));
        assert_eq!(rewind.compare_targets_to_last_frame(&world), None);
    }

    #[test]
    fn test_compare_detects_sleep_mismatch() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        record_frames(&mut rewind, &mut world, handle, 4);
        let sleeping = TargetState {
            should_sleep: true,
            ..target_at(2.0)
        };
        rewind
            .set_target_state_at_frame(&world, handle, 2, Phase::PostPushData, &sleeping)
            .unwrap();
        assert_eq!(rewind.compare_targets_to_last_frame(&world), Some(2));
    }

    #[test]
    fn test_skip_desync_test() {
        let config = RewindConfig::default()
            .with_num_frames(8)
            .with_skip_desync_test(true);
        let (mut rewind, mut world, handle) = setup(config);
        record_frames(&mut rewind, &mut world, handle, 4);
        rewind
            .set_target_state_at_frame(&world, handle, 1, Phase::PostPushData, &target_at(50.0))
            .unwrap();
        assert_eq!(rewind.compare_targets_to_last_frame(&world), None);
    }

    #[test]
    fn test_request_is_clamped_to_block_and_window() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(4));
        record_frames(&mut rewind, &mut world, handle, 8);
        assert_eq!(rewind.earliest_frame(), 3);

        rewind.request_resimulation(0, None);
        assert_eq!(rewind.resim_frame(), Some(3));

        rewind.block_resim();
        assert_eq!(rewind.blocked_resim_frame(), Some(8));
        rewind.request_resimulation(5, None);
        assert_eq!(rewind.resim_frame(), Some(8));
        assert!(!rewind.is_frame_within_rewind_history(8));
    }

    #[test]
    fn test_valid_frame_needs_targets_for_every_candidate() {
        let (mut rewind, mut world, first) = setup(RewindConfig::default().with_num_frames(16));
        let second = world.spawn_particle(Particle::rigid());
        rewind.mark_dirty_from_pt(&mut world, second).unwrap();
        record_frames(&mut rewind, &mut world, first, 10);

        for frame in [3, 5, 7] {
            rewind
                .set_target_state_at_frame(&world, first, frame, Phase::PostPushData, &target_at(0.0))
                .unwrap();
        }
        for frame in [3, 4] {
            rewind
                .set_target_state_at_frame(&world, second, frame, Phase::PrePushData, &target_at(0.0))
                .unwrap();
        }
        rewind.request_resimulation(8, Some(first));
        assert_eq!(rewind.resim_frame(), Some(7));
        rewind.request_resimulation(8, Some(second));
        assert_eq!(rewind.resim_frame(), Some(3));

        let entire = RewindConfig::default()
            .with_num_frames(16)
            .with_resim_frame_validation(ResimFrameValidation::EntireFrame);
        let (mut rewind, mut world, only) = setup(entire);
        record_frames(&mut rewind, &mut world, only, 10);
        // nothing has targets, the request is kept
        assert_eq!(rewind.find_valid_resim_frame(6), 6);
        rewind
            .set_target_state_at_frame(&world, only, 2, Phase::PostCallbacks, &target_at(0.0))
            .unwrap();
        assert_eq!(rewind.find_valid_resim_frame(6), 2);
    }

    #[test]
    fn test_valid_frame_needs_registered_inputs() {
        use std::{cell::RefCell, rc::Rc};

        use crate::{
            history::{DataHistory, HistoryData, HistoryRecord},
            rewind::SharedHistory,
        };

        #[derive(Clone, Default)]
        struct Throttle;
        impl HistoryData for Throttle {}

        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(16));
        record_frames(&mut rewind, &mut world, handle, 10);
        for frame in [5, 7] {
            rewind
                .set_target_state_at_frame(&world, handle, frame, Phase::PostPushData, &target_at(0.0))
                .unwrap();
        }
        let mut inputs = DataHistory::new(16).unwrap();
        for frame in [5, 6] {
            inputs.record_data(HistoryRecord::new(frame, frame, Throttle));
        }
        let inputs: SharedHistory = Rc::new(RefCell::new(inputs));
        rewind.add_input_history(&inputs, Some(handle)).unwrap();

        // frame 7 has a target but no input to replay
        rewind.request_resimulation(8, Some(handle));
        assert_eq!(rewind.resim_frame(), Some(5));

        rewind.remove_input_history(&inputs, Some(handle));
        rewind.request_resimulation(8, Some(handle));
        assert_eq!(rewind.resim_frame(), Some(7));
    }

    #[test]
    fn test_apply_targets_only_to_flagged_particles() {
        let (mut rewind, mut world, flagged) = setup(RewindConfig::default().with_num_frames(8));
        let other = world.spawn_particle(Particle::rigid().with_velocity(Vec3::X));
        rewind.mark_dirty_from_pt(&mut world, other).unwrap();
        record_frames(&mut rewind, &mut world, flagged, 4);

        let target = TargetState {
            linear_velocity: Vec3::Z,
            ..target_at(-1.0)
        };
        for handle in [flagged, other] {
            rewind
                .set_target_state_at_frame(&world, handle, 2, Phase::PrePushData, &target)
                .unwrap();
        }
        let asleep = TargetState {
            should_sleep: true,
            ..target_at(-2.0)
        };
        rewind
            .set_target_state_at_frame(&world, flagged, 2, Phase::PostCallbacks, &asleep)
            .unwrap();
        rewind.request_resimulation(2, Some(flagged));

        rewind.apply_targets(&mut world, 2, false);
        let particle = world.particle(flagged).unwrap();
        assert_eq!(particle.xr.x, Vec3::new(-2.0, 0.0, 0.0));
        assert!(particle.is_sleeping());
        assert_eq!(world.particle(other).unwrap().velocities.v, Vec3::X);

        rewind.apply_targets(&mut world, 2, true);
        assert_eq!(world.particle(other).unwrap().velocities.v, Vec3::Z);
    }

    #[test]
    fn test_followers_replay_history() {
        let config = RewindConfig::default()
            .with_num_frames(8)
            .with_rewind_data_optimization(true);
        let (mut rewind, mut world, follower) = setup(config);
        let resimmed = world.spawn_particle(Particle::rigid());
        rewind.mark_dirty_from_pt(&mut world, resimmed).unwrap();
        record_frames(&mut rewind, &mut world, follower, 5);

        rewind.request_resimulation(1, Some(resimmed));
        rewind.rewind_to_frame(&mut world, 1).unwrap();
        assert_eq!(world.particle(follower).unwrap().sync_state, SyncState::InSync);
        assert_eq!(world.particle(resimmed).unwrap().sync_state, SyncState::HardDesync);
        assert!(rewind.dirty_particle(follower).unwrap().resim_as_follower);

        world.particle_mut(follower).unwrap().xr.x = Vec3::splat(100.0);
        rewind.step_non_resim_particles(&mut world, 3);
        assert_eq!(world.particle(follower).unwrap().xr.x, Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn test_late_spawn_is_disabled_until_its_step() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        record_frames(&mut rewind, &mut world, handle, 3);
        let spawned = world.spawn_particle(Particle::rigid());
        rewind.spawn_proxy_if_needed(&world, spawned, 3).unwrap();
        record_frames(&mut rewind, &mut world, handle, 2);

        rewind.rewind_to_frame(&mut world, 1).unwrap();
        assert!(world.particle(spawned).unwrap().disabled);
        rewind.step_non_resim_particles(&mut world, 2);
        assert!(world.particle(spawned).unwrap().disabled);
        rewind.step_non_resim_particles(&mut world, 3);
        assert!(!world.particle(spawned).unwrap().disabled);
    }

    #[test]
    fn test_final_resim_accumulates_correction() {
        let (mut rewind, mut world, handle) = setup(RewindConfig::default().with_num_frames(8));
        record_frames(&mut rewind, &mut world, handle, 4);
        rewind.rewind_to_frame(&mut world, 2).unwrap();
        while rewind.is_resim() {
            rewind.advance_frame(0.1, no_cache);
            rewind.cache_current_dirty_data(&mut world, Phase::PostPushData).unwrap();
            rewind.finish_frame(&mut world);
        }
        assert_eq!(world.particle(handle).unwrap().sync_state, SyncState::InSync);

        let mut errors = HashMap::new();
        errors.insert(
            handle,
            ParticleReplicationError {
                error_x: Vec3::Y,
                error_r: Quat::IDENTITY,
            },
        );
        rewind.buffer_physics_results(&mut errors);
        // the resim left the particle at x = 2 while it was at x = 3 before
        assert_eq!(errors[&handle].error_x, Vec3::new(1.0, 1.0, 0.0));

        let mut drained = HashMap::new();
        rewind.buffer_physics_results(&mut drained);
        assert!(drained.is_empty());
        rewind.remove_particle(handle, AllowShrinking::No);
    }
}
