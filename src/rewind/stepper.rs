//! Fixed-step driver that runs `RewindData` through whole frames.
//!
//! Every tick goes through the same stages, live or resimulated:
//! advance -> capture pre-push -> push game data -> inputs -> capture post-push ->
//! callbacks -> capture post-callbacks -> solve -> finish.
//! After a live tick the stepper checks targets and the callback, and replays history
//! from the requested frame up to the latest one.
use std::{collections::BTreeMap, time::Instant};

use bytemuck::Zeroable;
use glam::{Quat, Vec3};
use tracing::{debug, warn};

use crate::{
    history::{CircularBuffer, Phase},
    state::{KinematicTargetMode, ParticleDynamics, ParticleVelocities},
    world::{
        DirtyJointData, DirtyParticleData, JointHandle, Particle, ParticleHandle, ParticleKind,
        SyncState, World,
    },
    RewindError,
};

use super::{ResimCache, ResimDebugInfo, RewindCallback, RewindConfig, RewindData};

/// Advances the world by one step.
pub trait Simulate {
    fn simulate(&mut self, world: &mut World, dt: f32);
}

/// Semi-implicit Euler integration without collisions.
///
/// Rigid particles pick up their per-step forces, drag and speed limits, then move.
/// Kinematic particles follow their target. Forces are cleared on every particle after
/// the step.
#[derive(Copy, Clone, Debug, Default)]
pub struct EulerIntegrator;

impl Simulate for EulerIntegrator {
    fn simulate(&mut self, world: &mut World, dt: f32) {
        for (_, particle) in world.particles_mut() {
            if particle.disabled {
                continue;
            }
            match particle.kind {
                ParticleKind::Static => {}
                ParticleKind::Kinematic => integrate_kinematic(particle, dt),
                ParticleKind::Rigid if particle.is_sleeping() => {}
                ParticleKind::Rigid => integrate_rigid(particle, dt),
            }
            particle.dynamics = ParticleDynamics::zeroed();
        }
    }
}

/// Rotates `orientation` by angular velocity `w` over `dt`.
pub fn integrate_orientation(orientation: Quat, w: Vec3, dt: f32) -> Quat {
    (Quat::from_scaled_axis(w * dt) * orientation).normalize()
}

fn integrate_rigid(particle: &mut Particle, dt: f32) {
    let dynamics = particle.dynamics;
    let misc = particle.misc;
    let mut v = particle.velocities.v + dynamics.acceleration * dt + dynamics.linear_impulse_velocity;
    let mut w = particle.velocities.w
        + dynamics.angular_acceleration * dt
        + dynamics.angular_impulse_velocity;

    v *= (1.0 - misc.linear_ether_drag * dt).max(0.0);
    w *= (1.0 - misc.angular_ether_drag * dt).max(0.0);
    if misc.max_linear_speed_sq > 0.0 {
        v = v.clamp_length_max(misc.max_linear_speed_sq.sqrt());
    }
    if misc.max_angular_speed_sq > 0.0 {
        w = w.clamp_length_max(misc.max_angular_speed_sq.sqrt());
    }

    particle.velocities = ParticleVelocities { v, w };
    particle.xr.x += v * dt;
    particle.xr.r = integrate_orientation(particle.xr.r, w, dt);
}

fn integrate_kinematic(particle: &mut Particle, dt: f32) {
    let target = particle.kinematic_target;
    match target.mode {
        KinematicTargetMode::Position => {
            if dt > 0.0 {
                particle.velocities.v = (target.position - particle.xr.x) / dt;
            }
            particle.xr.x = target.position;
            particle.xr.r = target.rotation;
        }
        KinematicTargetMode::Reset => {
            particle.velocities = ParticleVelocities::zeroed();
            particle.kinematic_target.mode = KinematicTargetMode::None;
        }
        KinematicTargetMode::Velocity | KinematicTargetMode::None => {
            let w = particle.velocities.w;
            particle.xr.x += particle.velocities.v * dt;
            particle.xr.r = integrate_orientation(particle.xr.r, w, dt);
        }
    }
}

type CacheFactory = Box<dyn FnMut() -> Box<dyn ResimCache>>;

/// Game data pushed on one frame, replayed when a resim passes that frame again.
#[derive(Clone, Debug, Default)]
struct PushedGameData {
    frame: Option<i32>,
    particles: Vec<(ParticleHandle, DirtyParticleData)>,
    joints: Vec<(JointHandle, DirtyJointData)>,
}

/// Owns a world and its rewind history and steps them together.
pub struct RewindStepper<S, C> {
    world: World,
    rewind: RewindData,
    simulator: S,
    callback: C,
    pending_particles: BTreeMap<ParticleHandle, DirtyParticleData>,
    pending_joints: BTreeMap<JointHandle, DirtyJointData>,
    pushed: CircularBuffer<PushedGameData>,
    cache_factory: Option<CacheFactory>,
    last_delta_time: f32,
    last_resim: Option<ResimDebugInfo>,
}

impl<S: Simulate, C: RewindCallback> RewindStepper<S, C> {
    pub fn new(
        world: World,
        config: RewindConfig,
        start_frame: i32,
        simulator: S,
        callback: C,
    ) -> Result<Self, RewindError> {
        let rewind = RewindData::new(config, start_frame)?;
        let pushed = CircularBuffer::new(rewind.capacity())?;
        Ok(Self {
            world,
            rewind,
            simulator,
            callback,
            pending_particles: BTreeMap::new(),
            pending_joints: BTreeMap::new(),
            pushed,
            cache_factory: None,
            last_delta_time: 0.0,
            last_resim: None,
        })
    }

    /// Sets how per-frame resim caches are created when collision resim caching is on.
    pub fn with_cache_factory<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> Box<dyn ResimCache> + 'static,
    {
        self.cache_factory = Some(Box::new(factory));
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn rewind(&self) -> &RewindData {
        &self.rewind
    }

    pub fn rewind_mut(&mut self) -> &mut RewindData {
        &mut self.rewind
    }

    /// World and history together, for calls that need both.
    pub fn parts_mut(&mut self) -> (&mut World, &mut RewindData) {
        (&mut self.world, &mut self.rewind)
    }

    pub fn callback(&self) -> &C {
        &self.callback
    }

    pub fn callback_mut(&mut self) -> &mut C {
        &mut self.callback
    }

    /// Summary of the most recent resim, if one ran.
    pub fn last_resim(&self) -> Option<&ResimDebugInfo> {
        self.last_resim.as_ref()
    }

    /// Queues game data for a particle, applied at the start of the next live step.
    /// Queuing twice for the same particle before a step keeps the newer data. A resim
    /// pushes the data again on the same frame.
    pub fn queue_particle_data(&mut self, handle: ParticleHandle, data: DirtyParticleData) {
        self.pending_particles.insert(handle, data);
    }

    pub fn queue_joint_data(&mut self, handle: JointHandle, data: DirtyJointData) {
        self.pending_joints.insert(handle, data);
    }

    /// Runs one live step, then resimulates if targets or the callback ask for it.
    pub fn step(&mut self, dt: f32) -> Result<(), RewindError> {
        if self.rewind.is_resim() {
            warn!(frame = self.rewind.current_frame(), "step called while a resim is pending");
            return Err(RewindError::ResimInProgress);
        }
        self.last_delta_time = dt;
        self.tick(dt)?;

        let latest_completed = self.rewind.latest_frame() - 1;
        let desynced = self.rewind.compare_targets_to_last_frame(&self.world);
        let triggered = self.callback.trigger_rewind_if_needed(latest_completed);
        if let Some(frame) = desynced.into_iter().chain(triggered).min() {
            self.rewind.request_resimulation(frame, None);
        }

        if let Some(frame) = self.rewind.resim_frame() {
            if self.rewind.is_frame_within_rewind_history(frame) {
                self.resimulate(frame)?;
            } else {
                warn!(frame, earliest = self.rewind.earliest_frame(), "resim frame is not in history, dropped");
                self.rewind.set_resim_frame(None);
            }
        }
        Ok(())
    }

    /// Rewinds to `frame` and replays every step up to the latest one.
    pub fn resimulate(&mut self, frame: i32) -> Result<(), RewindError> {
        let start = Instant::now();
        let latest = self.rewind.latest_frame();
        self.rewind.rewind_to_frame(&mut self.world, frame)?;

        let mut first_step = true;
        while self.rewind.is_resim() {
            let step = self.rewind.current_frame();
            let dt = self
                .rewind
                .delta_time_for_frame(step)
                .unwrap_or(self.last_delta_time);
            self.callback.pre_resim_step(step, first_step);
            self.tick(dt)?;
            self.callback.post_resim_step(step);
            first_step = false;
        }

        let info = ResimDebugInfo {
            resim_time: start.elapsed(),
            resim_frame: frame,
            num_resim_frames: latest - frame,
        };
        debug!(frame, frames = info.num_resim_frames, elapsed = ?info.resim_time, "resim complete");
        self.callback.set_resim_debug_info(&info);
        self.last_resim = Some(info);
        Ok(())
    }

    fn tick(&mut self, dt: f32) -> Result<(), RewindError> {
        let frame = self.rewind.current_frame();
        let resim = self.rewind.is_resim();

        let factory = &mut self.cache_factory;
        self.rewind
            .advance_frame(dt, || factory.as_mut().map(|make| make()));
        self.rewind
            .cache_current_dirty_data(&mut self.world, Phase::PrePushData)?;

        self.push_game_data(frame, resim)?;
        self.callback.process_inputs(frame, &mut self.world);
        if resim {
            self.rewind.step_non_resim_particles(&mut self.world, frame);
            self.rewind.apply_targets(&mut self.world, frame, false);
        }
        self.rewind
            .cache_current_dirty_data(&mut self.world, Phase::PostPushData)?;

        self.callback.apply_callbacks(frame, &mut self.world);
        self.rewind
            .cache_current_dirty_data(&mut self.world, Phase::PostCallbacks)?;

        let moving: Vec<ParticleHandle> = self
            .world
            .particles()
            .filter(|(_, particle)| is_moving(particle))
            .map(|(handle, _)| handle)
            .collect();
        for handle in moving {
            self.rewind.push_pt_dirty_data(&mut self.world, handle)?;
        }

        self.simulator.simulate(&mut self.world, dt);
        self.rewind.finish_frame(&mut self.world);
        Ok(())
    }

    /// Pushes the game data of `frame`: the queued data on a live step, the data recorded
    /// for that frame during a resim. Followers keep replaying history instead.
    fn push_game_data(&mut self, frame: i32, resim: bool) -> Result<(), RewindError> {
        let pushed = if resim {
            let recorded = std::mem::take(&mut self.pushed[frame]);
            if recorded.frame != Some(frame) {
                return Ok(());
            }
            recorded
        } else {
            PushedGameData {
                frame: Some(frame),
                particles: std::mem::take(&mut self.pending_particles).into_iter().collect(),
                joints: std::mem::take(&mut self.pending_joints).into_iter().collect(),
            }
        };

        for (handle, data) in &pushed.particles {
            let Some(particle) = self.world.particle(*handle) else {
                if !resim {
                    warn!(particle = %handle, "game data queued for a removed particle");
                }
                continue;
            };
            if particle.disabled || (resim && particle.sync_state == SyncState::InSync) {
                continue;
            }
            self.rewind.push_gt_dirty_data(&self.world, *handle, data)?;
            if let Some(particle) = self.world.particle_mut(*handle) {
                data.push_to_particle(particle);
            }
        }
        for (handle, data) in &pushed.joints {
            let Some(joint) = self.world.joint(*handle) else {
                if !resim {
                    warn!(joint = %handle, "game data queued for a removed joint");
                }
                continue;
            };
            if resim && joint.sync_state == SyncState::InSync {
                continue;
            }
            self.rewind.push_gt_dirty_joint_data(&self.world, *handle, data)?;
            if let Some(joint) = self.world.joint_mut(*handle) {
                data.push_to_joint(joint);
            }
        }
        if resim && !pushed.particles.is_empty() {
            debug!(frame, particles = pushed.particles.len(), "replayed game data");
        }
        self.pushed[frame] = pushed;
        Ok(())
    }
}

fn is_moving(particle: &Particle) -> bool {
    particle.is_rigid()
        && !particle.disabled
        && !particle.is_sleeping()
        && (particle.velocities.v != Vec3::ZERO
            || particle.velocities.w != Vec3::ZERO
            || !particle.dynamics.is_zero())
}
