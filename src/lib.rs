use thiserror::Error;

use crate::history::FrameAndPhase;

pub mod history;
pub mod registry;
pub mod rewind;
pub mod state;
pub mod world;

pub use history::{DirtyPropertiesPool, Phase, PropertyBuffer};
pub use registry::{AllowShrinking, DirtyObjects};
pub use rewind::{
    EulerIntegrator, NoRewindCallback, RewindCallback, RewindConfig, RewindData, RewindStepper,
    Simulate, TargetState,
};
pub use world::{JointHandle, ParticleHandle, World};

/// Error type for all rewind primitives
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewindError {
    #[error("Ordering error occured, time travel! latest {latest:?}, requested {requested:?}")]
    TimeTravel {
        latest: FrameAndPhase,
        requested: FrameAndPhase,
    },
    #[error("Frame {frame} is outside of the rewind history [{earliest}, {current})")]
    FrameOutOfHistory {
        frame: i32,
        earliest: i32,
        current: i32,
    },
    #[error("History cannot be queried while a resimulation is in progress")]
    ResimInProgress,
    #[error("Invalid rewind configuration: {0}")]
    InvalidConfig(String),
    #[error("Particle handle does not resolve to a live particle")]
    UnknownParticle,
    #[error("Joint handle does not resolve to a live joint")]
    UnknownJoint,
    #[error("History buffers must be initialized with a non-zero capacity")]
    ZeroCapacity,
}
