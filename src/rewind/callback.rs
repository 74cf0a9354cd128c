//! Hooks user code implements to take part in rollback.
use std::time::Duration;

use crate::world::World;

/// Per-frame cache the solver keeps to speed up a resim, for example recorded contacts.
pub trait ResimCache: Send {
    fn set_resimming(&mut self, resimming: bool);
    fn is_resimming(&self) -> bool;
    /// Clears cached data before the slot is reused for a new frame.
    fn reset_cache(&mut self) {}
}

/// Summary handed to `RewindCallback::set_resim_debug_info` once a resim completes.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ResimDebugInfo {
    pub resim_time: Duration,
    pub resim_frame: i32,
    pub num_resim_frames: i32,
}

/// Decides when to rewind and replays anything that ran in lock step with physics.
///
/// Every method defaults to doing nothing.
pub trait RewindCallback {
    /// Called once per step after game data reached the simulation and before callbacks run.
    /// During a resim this is where recorded inputs for `step` are reapplied.
    fn process_inputs(&mut self, _step: i32, _world: &mut World) {}

    /// Called after inputs are processed, before the post-callback state is captured.
    fn apply_callbacks(&mut self, _step: i32, _world: &mut World) {}

    /// Polled after every live step. Returning a frame requests a resim from it up to the
    /// latest simulated step.
    fn trigger_rewind_if_needed(&mut self, _latest_step_completed: i32) -> Option<i32> {
        None
    }

    fn pre_resim_step(&mut self, _step: i32, _first_step: bool) {}

    fn post_resim_step(&mut self, _step: i32) {}

    fn set_resim_debug_info(&mut self, _info: &ResimDebugInfo) {}
}

/// Callback for stepping without any user hooks.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoRewindCallback;

impl RewindCallback for NoRewindCallback {}
