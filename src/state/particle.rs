//! Per-particle history and the read-only view over it.
use std::fmt::Display;

use bytemuck::Zeroable;
use glam::{Quat, Vec3};

use crate::{
    history::{BufferState, DirtyPropertiesPool, FrameAndPhase, PropertyBuffer, NUM_PHASES},
    state::{
        HistoryProperty, KinematicTarget, ObjectState, ParticleDynamicMisc, ParticleDynamics,
        ParticleMassProps, ParticleNonFrequentData, ParticlePositionRotation, ParticleVelocities,
    },
    world::{Particle, ParticleHandle},
};

/// Ring size for per-phase history of `num_frames` frames.
pub fn circular_size(num_frames: usize, cache_one_phase: bool) -> usize {
    if cache_one_phase {
        num_frames
    } else {
        num_frames * NUM_PHASES
    }
}

/// Cursor snapshot of the buffers `extract_history_state` covers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticleHistoryState {
    pub position: BufferState,
    pub velocity: BufferState,
}

/// All recorded property streams of one particle.
///
/// The `target_*` buffers hold authoritative state received for a frame. They are keyed
/// per frame and are left alone by `clear_entry_and_future`.
#[derive(Debug)]
pub struct GeometryParticleStateBase {
    pub particle_position_rotation: PropertyBuffer<ParticlePositionRotation>,
    pub non_frequent_data: PropertyBuffer<ParticleNonFrequentData>,
    pub velocities: PropertyBuffer<ParticleVelocities>,
    pub dynamics: PropertyBuffer<ParticleDynamics, false>,
    pub dynamics_misc: PropertyBuffer<ParticleDynamicMisc>,
    pub mass_props: PropertyBuffer<ParticleMassProps>,
    pub kinematic_target: PropertyBuffer<KinematicTarget>,

    pub target_positions: PropertyBuffer<ParticlePositionRotation, false>,
    pub target_velocities: PropertyBuffer<ParticleVelocities, false>,
    pub target_states: PropertyBuffer<ParticleDynamicMisc, false>,
}

impl GeometryParticleStateBase {
    pub fn new(num_frames: usize, cache_one_phase: bool) -> Self {
        let size = circular_size(num_frames, cache_one_phase);
        Self {
            particle_position_rotation: PropertyBuffer::new(size),
            non_frequent_data: PropertyBuffer::new(size),
            velocities: PropertyBuffer::new(size),
            dynamics: PropertyBuffer::new(size),
            dynamics_misc: PropertyBuffer::new(size),
            mass_props: PropertyBuffer::new(size),
            kinematic_target: PropertyBuffer::new(size),
            target_positions: PropertyBuffer::new(num_frames),
            target_velocities: PropertyBuffer::new(num_frames),
            target_states: PropertyBuffer::new(num_frames),
        }
    }

    pub fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        self.particle_position_rotation.release(pool);
        self.non_frequent_data.release(pool);
        self.velocities.release(pool);
        self.dynamics.release(pool);
        self.dynamics_misc.release(pool);
        self.mass_props.release(pool);
        self.kinematic_target.release(pool);
        self.target_positions.release(pool);
        self.target_velocities.release(pool);
        self.target_states.release(pool);
    }

    pub fn reset(&mut self) {
        self.particle_position_rotation.reset();
        self.non_frequent_data.reset();
        self.velocities.reset();
        self.dynamics.reset();
        self.dynamics_misc.reset();
        self.mass_props.reset();
        self.kinematic_target.reset();
        self.target_positions.reset();
        self.target_velocities.reset();
        self.target_states.reset();
    }

    pub fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        self.particle_position_rotation
            .clear_entry_and_future(frame_and_phase);
        self.non_frequent_data.clear_entry_and_future(frame_and_phase);
        self.velocities.clear_entry_and_future(frame_and_phase);
        self.dynamics.clear_entry_and_future(frame_and_phase);
        self.dynamics_misc.clear_entry_and_future(frame_and_phase);
        self.mass_props.clear_entry_and_future(frame_and_phase);
        self.kinematic_target.clear_entry_and_future(frame_and_phase);
    }

    pub fn extract_history_state(&self) -> ParticleHistoryState {
        ParticleHistoryState {
            position: self.particle_position_rotation.extract_buffer_state(),
            velocity: self.velocities.extract_buffer_state(),
        }
    }

    pub fn restore_history_state(&mut self, state: ParticleHistoryState) {
        self.particle_position_rotation
            .restore_buffer_state(state.position);
        self.velocities.restore_buffer_state(state.velocity);
    }

    pub fn is_clean(&self, frame_and_phase: FrameAndPhase) -> bool {
        self.is_clean_excluding_dynamics(frame_and_phase) && self.dynamics.is_clean(frame_and_phase)
    }

    pub fn is_clean_excluding_dynamics(&self, frame_and_phase: FrameAndPhase) -> bool {
        self.particle_position_rotation.is_clean(frame_and_phase)
            && self.non_frequent_data.is_clean(frame_and_phase)
            && self.velocities.is_clean(frame_and_phase)
            && self.dynamics_misc.is_clean(frame_and_phase)
            && self.mass_props.is_clean(frame_and_phase)
            && self.kinematic_target.is_clean(frame_and_phase)
    }

    /// True when every recorded group at `frame_and_phase` matches the live particle.
    ///
    /// `SKIP_DYNAMICS` leaves the per-step forces out of the comparison.
    pub fn is_in_sync<const SKIP_DYNAMICS: bool>(
        &self,
        particle: &Particle,
        frame_and_phase: FrameAndPhase,
        pool: &DirtyPropertiesPool,
    ) -> bool {
        self.particle_position_rotation
            .is_in_sync(particle, frame_and_phase, pool)
            && self
                .non_frequent_data
                .is_in_sync(particle, frame_and_phase, pool)
            && self.velocities.is_in_sync(particle, frame_and_phase, pool)
            && (SKIP_DYNAMICS || self.dynamics.is_in_sync(particle, frame_and_phase, pool))
            && self
                .dynamics_misc
                .is_in_sync(particle, frame_and_phase, pool)
            && self.mass_props.is_in_sync(particle, frame_and_phase, pool)
            && self
                .kinematic_target
                .is_in_sync(particle, frame_and_phase, pool)
    }

    pub fn has_data_in_history(&self) -> bool {
        !(self.particle_position_rotation.is_empty()
            && self.non_frequent_data.is_empty()
            && self.velocities.is_empty()
            && self.dynamics.is_empty()
            && self.dynamics_misc.is_empty()
            && self.mass_props.is_empty()
            && self.kinematic_target.is_empty()
            && self.target_positions.is_empty()
            && self.target_velocities.is_empty()
            && self.target_states.is_empty())
    }

    /// Writes every recorded group at `frame_and_phase` back onto the live particle.
    ///
    /// Groups without a covering entry keep their live value. Dynamics are exact: without an
    /// entry they are reset to zero.
    pub fn restore_to(
        &self,
        particle: &mut Particle,
        frame_and_phase: FrameAndPhase,
        pool: &DirtyPropertiesPool,
    ) {
        if let Some(xr) = self.particle_position_rotation.read(frame_and_phase, pool) {
            xr.apply_to(particle);
        }
        if let Some(non_frequent) = self.non_frequent_data.read(frame_and_phase, pool) {
            non_frequent.apply_to(particle);
        }
        if let Some(velocities) = self.velocities.read(frame_and_phase, pool) {
            velocities.apply_to(particle);
        }
        if let Some(misc) = self.dynamics_misc.read(frame_and_phase, pool) {
            misc.apply_to(particle);
        }
        if let Some(mass) = self.mass_props.read(frame_and_phase, pool) {
            mass.apply_to(particle);
        }
        if let Some(target) = self.kinematic_target.read(frame_and_phase, pool) {
            target.apply_to(particle);
        }
        match self.dynamics.read(frame_and_phase, pool) {
            Some(dynamics) => dynamics.apply_to(particle),
            None => particle.dynamics = ParticleDynamics::zeroed(),
        }
    }
}

/// Particle state at one `FrameAndPhase`, resolved lazily.
///
/// Each getter reads the covering history entry when there is one and falls back to the
/// live particle, since untouched properties have not changed since.
pub struct GeometryParticleState<'a> {
    handle: ParticleHandle,
    particle: &'a Particle,
    pool: &'a DirtyPropertiesPool,
    state: Option<&'a GeometryParticleStateBase>,
    frame_and_phase: FrameAndPhase,
}

impl<'a> GeometryParticleState<'a> {
    pub fn new(
        handle: ParticleHandle,
        particle: &'a Particle,
        pool: &'a DirtyPropertiesPool,
        state: Option<&'a GeometryParticleStateBase>,
        frame_and_phase: FrameAndPhase,
    ) -> Self {
        Self {
            handle,
            particle,
            pool,
            state,
            frame_and_phase,
        }
    }

    pub fn handle(&self) -> ParticleHandle {
        self.handle
    }

    pub fn frame_and_phase(&self) -> FrameAndPhase {
        self.frame_and_phase
    }

    /// True when some property of the particle is resolved from history.
    pub fn has_history(&self) -> bool {
        self.state.is_some_and(|state| !state.is_clean(self.frame_and_phase))
    }

    fn resolve<T, const N: bool>(
        &self,
        buffer: impl Fn(&'a GeometryParticleStateBase) -> &'a PropertyBuffer<T, N>,
    ) -> T
    where
        T: HistoryProperty<Particle> + 'a,
    {
        self.state
            .and_then(|state| buffer(state).read(self.frame_and_phase, self.pool))
            .copied()
            .unwrap_or_else(|| T::copy_from(self.particle))
    }

    pub fn position_rotation(&self) -> ParticlePositionRotation {
        self.resolve(|state| &state.particle_position_rotation)
    }

    pub fn x(&self) -> Vec3 {
        self.position_rotation().x
    }

    pub fn r(&self) -> Quat {
        self.position_rotation().r
    }

    pub fn velocities(&self) -> ParticleVelocities {
        self.resolve(|state| &state.velocities)
    }

    pub fn v(&self) -> Vec3 {
        self.velocities().v
    }

    pub fn w(&self) -> Vec3 {
        self.velocities().w
    }

    pub fn dynamics_misc(&self) -> ParticleDynamicMisc {
        self.resolve(|state| &state.dynamics_misc)
    }

    pub fn object_state(&self) -> ObjectState {
        self.dynamics_misc().object_state
    }

    pub fn mass_props(&self) -> ParticleMassProps {
        self.resolve(|state| &state.mass_props)
    }

    pub fn mass(&self) -> f32 {
        self.mass_props().mass
    }

    pub fn inv_mass(&self) -> f32 {
        self.mass_props().inv_mass
    }

    pub fn kinematic_target(&self) -> KinematicTarget {
        self.resolve(|state| &state.kinematic_target)
    }

    pub fn non_frequent_data(&self) -> ParticleNonFrequentData {
        self.resolve(|state| &state.non_frequent_data)
    }

    /// Forces are only meaningful where recorded; a tracked particle without an entry had none.
    pub fn dynamics(&self) -> ParticleDynamics {
        match self.state {
            Some(state) => state
                .dynamics
                .read(self.frame_and_phase, self.pool)
                .copied()
                .unwrap_or_else(ParticleDynamics::zeroed),
            None => self.particle.dynamics,
        }
    }

    pub fn acceleration(&self) -> Vec3 {
        self.dynamics().acceleration
    }

    pub fn linear_impulse_velocity(&self) -> Vec3 {
        self.dynamics().linear_impulse_velocity
    }
}

impl Display for GeometryParticleState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} [unique {}] at {}",
            self.handle,
            self.non_frequent_data().unique_idx,
            self.frame_and_phase
        )?;
        writeln!(f, "x: {}", self.x())?;
        writeln!(f, "r: {}", self.r())?;
        if self.particle.is_kinematic() {
            writeln!(f, "v: {}", self.v())?;
            writeln!(f, "w: {}", self.w())?;
        }
        if self.particle.is_rigid() {
            let misc = self.dynamics_misc();
            writeln!(f, "linear_ether_drag: {}", misc.linear_ether_drag)?;
            writeln!(f, "angular_ether_drag: {}", misc.angular_ether_drag)?;
            writeln!(f, "max_linear_speed_sq: {}", misc.max_linear_speed_sq)?;
            writeln!(f, "max_angular_speed_sq: {}", misc.max_angular_speed_sq)?;
            writeln!(
                f,
                "initial_overlap_depenetration_velocity: {}",
                misc.initial_overlap_depenetration_velocity
            )?;
            writeln!(f, "sleep_threshold_multiplier: {}", misc.sleep_threshold_multiplier)?;
            writeln!(f, "object_state: {:?}", misc.object_state)?;
            writeln!(f, "collision_group: {}", misc.collision_group)?;
            writeln!(f, "control_flags: {}", misc.control_flags)?;

            let mass = self.mass_props();
            writeln!(f, "center_of_mass: {}", mass.center_of_mass)?;
            writeln!(f, "rotation_of_mass: {}", mass.rotation_of_mass)?;
            writeln!(f, "inertia: {}", mass.inertia)?;
            writeln!(f, "mass: {}", mass.mass)?;
            writeln!(f, "inv_mass: {}", mass.inv_mass)?;

            let dynamics = self.dynamics();
            writeln!(f, "acceleration: {}", dynamics.acceleration)?;
            writeln!(f, "angular_acceleration: {}", dynamics.angular_acceleration)?;
            writeln!(f, "linear_impulse_velocity: {}", dynamics.linear_impulse_velocity)?;
            writeln!(f, "angular_impulse_velocity: {}", dynamics.angular_impulse_velocity)?;
        }
        Ok(())
    }
}
