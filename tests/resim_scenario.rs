use glam::Vec3;
use rewind::{
    history::FrameAndPhase,
    state::ParticleVelocities,
    world::{DirtyParticleData, Particle},
    EulerIntegrator, Phase, RewindCallback, RewindConfig, RewindData, RewindError, RewindStepper,
    TargetState, World,
};

fn no_cache() -> Option<Box<dyn rewind::rewind::ResimCache>> {
    None
}

#[test]
fn test_rewind_after_target_mismatch() {
    let mut rewind = RewindData::new(RewindConfig::default().with_num_frames(8), 96).unwrap();
    let mut world = World::new();
    let ball = world.spawn_particle(Particle::rigid());

    for frame in 96..100 {
        rewind.advance_frame(1.0 / 30.0, no_cache);
        world.particle_mut(ball).unwrap().xr.x = Vec3::new((frame - 96) as f32, 0.0, 0.0);
        rewind.mark_dirty_from_pt(&mut world, ball).unwrap();
        rewind
            .cache_current_dirty_data(&mut world, Phase::PostPushData)
            .unwrap();
        rewind.finish_frame(&mut world);
    }
    rewind.advance_frame(1.0 / 30.0, no_cache);
    rewind
        .cache_current_dirty_data(&mut world, Phase::PostPushData)
        .unwrap();
    assert_eq!(rewind.current_frame(), 100);
    assert_eq!(rewind.earliest_frame(), 96);

    let target = TargetState {
        position: Vec3::new(5.0, 0.0, 0.0),
        ..TargetState::default()
    };
    rewind
        .set_target_state_at_frame(&world, ball, 98, Phase::PostPushData, &target)
        .unwrap();
    assert_eq!(rewind.compare_targets_to_last_frame(&world), Some(98));

    rewind.rewind_to_frame(&mut world, 98).unwrap();
    assert!(rewind.is_resim());
    assert_eq!(world.particle(ball).unwrap().xr.x, Vec3::new(2.0, 0.0, 0.0));
    let history = rewind.dirty_particle(ball).unwrap().history();
    for frame in [98, 99, 100] {
        let key = FrameAndPhase::new(frame, Phase::PostPushData);
        assert!(history
            .particle_position_rotation
            .read(key, rewind.properties_pool())
            .is_none());
    }
    assert!(matches!(
        rewind.get_past_state_at_frame(&world, ball, 97, Phase::PostPushData),
        Err(RewindError::ResimInProgress)
    ));

    while rewind.is_resim() {
        let frame = rewind.current_frame();
        assert!(rewind.delta_time_for_frame(frame).is_some());
        rewind.advance_frame(1.0 / 30.0, no_cache);
        rewind.apply_targets(&mut world, frame, false);
        rewind
            .cache_current_dirty_data(&mut world, Phase::PostPushData)
            .unwrap();
        rewind.finish_frame(&mut world);
    }
    let corrected = rewind
        .get_past_state_at_frame(&world, ball, 98, Phase::PostPushData)
        .unwrap();
    assert_eq!(corrected.x(), Vec3::new(5.0, 0.0, 0.0));
    assert_eq!(rewind.compare_targets_to_last_frame(&world), None);
}

/// Pushes the ball on one step, the same way live and during a resim.
struct Kick {
    ball: rewind::ParticleHandle,
    on_step: i32,
    kicks: u32,
}

impl RewindCallback for Kick {
    fn process_inputs(&mut self, step: i32, world: &mut World) {
        if step == self.on_step {
            if let Some(ball) = world.particle_mut(self.ball) {
                ball.dynamics.linear_impulse_velocity = Vec3::X;
                self.kicks += 1;
            }
        }
    }
}

#[test]
fn test_inputs_are_replayed_during_resim() {
    let mut world = World::new();
    let ball = world.spawn_particle(Particle::rigid());
    let kick = Kick {
        ball,
        on_step: 5,
        kicks: 0,
    };
    let mut stepper = RewindStepper::new(
        world,
        RewindConfig::default().with_num_frames(16),
        0,
        EulerIntegrator,
        kick,
    )
    .unwrap();
    for _ in 0..8 {
        stepper.step(1.0).unwrap();
    }
    assert_eq!(stepper.world().particle(ball).unwrap().xr.x.x, 3.0);

    let target = TargetState {
        position: Vec3::new(2.0, 0.0, 0.0),
        ..TargetState::default()
    };
    let (world, rewind) = stepper.parts_mut();
    rewind
        .set_target_state_at_frame(world, ball, 3, Phase::PostPushData, &target)
        .unwrap();
    stepper.step(1.0).unwrap();

    assert_eq!(stepper.last_resim().unwrap().resim_frame, 3);
    assert_eq!(stepper.callback().kicks, 2);
    let particle = stepper.world().particle(ball).unwrap();
    assert_eq!(particle.xr.x, Vec3::new(6.0, 0.0, 0.0));
    assert_eq!(particle.velocities.v, Vec3::X);
}

/// Asks for one rewind once a given step has completed.
struct RewindAfter {
    step: i32,
    to: i32,
}

impl RewindCallback for RewindAfter {
    fn trigger_rewind_if_needed(&mut self, latest_step_completed: i32) -> Option<i32> {
        (latest_step_completed == self.step).then_some(self.to)
    }
}

#[test]
fn test_game_data_is_pushed_again_during_resim() {
    let mut world = World::new();
    let ball = world.spawn_particle(Particle::rigid());
    let mut stepper = RewindStepper::new(
        world,
        RewindConfig::default().with_num_frames(16),
        0,
        EulerIntegrator,
        RewindAfter { step: 8, to: 3 },
    )
    .unwrap();
    for _ in 0..5 {
        stepper.step(1.0).unwrap();
    }
    stepper.queue_particle_data(
        ball,
        DirtyParticleData {
            velocities: Some(ParticleVelocities {
                v: Vec3::X,
                w: Vec3::ZERO,
            }),
            ..Default::default()
        },
    );
    for _ in 0..3 {
        stepper.step(1.0).unwrap();
    }
    assert_eq!(stepper.rewind().current_frame(), 8);
    assert_eq!(stepper.world().particle(ball).unwrap().xr.x, Vec3::new(3.0, 0.0, 0.0));

    // nothing was corrected, the replay lands where the live run would have
    stepper.step(1.0).unwrap();
    let info = *stepper.last_resim().unwrap();
    assert_eq!(info.resim_frame, 3);
    assert_eq!(info.num_resim_frames, 6);
    let particle = stepper.world().particle(ball).unwrap();
    assert_eq!(particle.xr.x, Vec3::new(4.0, 0.0, 0.0));
    assert_eq!(particle.velocities.v, Vec3::X);

    let rewind = stepper.rewind();
    let before = rewind
        .get_past_state_at_frame(stepper.world(), ball, 5, Phase::PrePushData)
        .unwrap();
    assert_eq!(before.v(), Vec3::ZERO);
    let after = rewind
        .get_past_state_at_frame(stepper.world(), ball, 6, Phase::PostPushData)
        .unwrap();
    assert_eq!(after.x(), Vec3::new(1.0, 0.0, 0.0));
    assert_eq!(after.v(), Vec3::X);
}

#[test]
fn test_followers_keep_their_trajectory() {
    let mut world = World::new();
    let corrected = world.spawn_particle(Particle::rigid().with_velocity(Vec3::X));
    let follower = world.spawn_particle(Particle::rigid().with_velocity(Vec3::Y));
    let config = RewindConfig::default()
        .with_num_frames(16)
        .with_rewind_data_optimization(true);
    let mut stepper = RewindStepper::new(
        world,
        config,
        0,
        EulerIntegrator,
        rewind::NoRewindCallback,
    )
    .unwrap();
    for _ in 0..6 {
        stepper.step(0.5).unwrap();
    }

    let target = TargetState {
        position: Vec3::new(0.0, 0.0, 4.0),
        linear_velocity: Vec3::X,
        ..TargetState::default()
    };
    let (world, rewind) = stepper.parts_mut();
    rewind
        .set_target_state_at_frame(world, corrected, 2, Phase::PostPushData, &target)
        .unwrap();
    stepper.step(0.5).unwrap();

    assert_eq!(stepper.last_resim().unwrap().resim_frame, 2);
    assert_eq!(
        stepper.world().particle(follower).unwrap().xr.x,
        Vec3::new(0.0, 3.5, 0.0)
    );
    assert_eq!(
        stepper.world().particle(corrected).unwrap().xr.x,
        Vec3::new(2.5, 0.0, 4.0)
    );

    let mut errors = std::collections::HashMap::new();
    stepper.rewind_mut().buffer_physics_results(&mut errors);
    assert_eq!(errors[&follower].error_x, Vec3::ZERO);
    assert_eq!(errors[&corrected].error_x, Vec3::new(1.0, 0.0, -4.0));
}

#[test]
fn test_requests_stay_inside_history() {
    let mut world = World::new();
    world.spawn_particle(Particle::rigid().with_velocity(Vec3::Z));
    let mut stepper = RewindStepper::new(
        world,
        RewindConfig::default().with_num_frames(4),
        0,
        EulerIntegrator,
        rewind::NoRewindCallback,
    )
    .unwrap();
    for _ in 0..10 {
        stepper.step(0.25).unwrap();
    }
    let rewind = stepper.rewind_mut();
    assert_eq!(rewind.earliest_frame(), 5);
    rewind.request_resimulation(-20, None);
    assert_eq!(rewind.resim_frame(), Some(5));

    stepper.resimulate(5).unwrap();
    let info = *stepper.last_resim().unwrap();
    assert_eq!(info.resim_frame, 5);
    assert_eq!(info.num_resim_frames, 5);
    assert!(!stepper.rewind().is_resim());

    // frame 5 leaves the window on the next step, the stale request is dropped
    stepper.rewind_mut().set_resim_frame(Some(5));
    stepper.step(0.25).unwrap();
    assert_eq!(stepper.rewind().resim_frame(), None);
    assert_eq!(stepper.last_resim(), Some(&info));

    let (world, rewind) = stepper.parts_mut();
    assert!(matches!(
        rewind.rewind_to_frame(world, 2),
        Err(RewindError::FrameOutOfHistory { frame: 2, .. })
    ));
}
