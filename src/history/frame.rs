//! Frame and phase keys for history entries.
//!
//! A `FrameAndPhase` identifies a point inside one simulation frame's lifecycle.
//! Keys are ordered lexicographically, first by frame and then by phase, which is
//! the order every history buffer expects its entries to be written in.
use std::fmt::Display;

/// Points within a frame at which particle state is captured.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// State before PushData, server state updates or any sim callbacks are processed.
    /// This is the result of the previous frame before any external modifications of this frame.
    PrePushData = 0,
    /// State after PushData is applied, but before any server state is applied.
    /// Server state is compared against this phase, and rewinds restore to it.
    PostPushData = 1,
    /// State after sim callbacks are applied, used to detect desyncs introduced
    /// before the simulation itself runs.
    PostCallbacks = 2,
}

/// Number of phases captured per frame.
pub const NUM_PHASES: usize = 3;

impl Phase {
    pub const ALL: [Phase; NUM_PHASES] = [Phase::PrePushData, Phase::PostPushData, Phase::PostCallbacks];

    pub fn from_index(idx: usize) -> Option<Phase> {
        Self::ALL.get(idx).copied()
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::PrePushData => write!(f, "PrePushData"),
            Phase::PostPushData => write!(f, "PostPushData"),
            Phase::PostCallbacks => write!(f, "PostCallbacks"),
        }
    }
}

/// Composite `(frame, phase)` key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameAndPhase {
    pub frame: i32,
    pub phase: Phase,
}

impl FrameAndPhase {
    pub const fn new(frame: i32, phase: Phase) -> Self {
        Self { frame, phase }
    }

    /// Every key of `frame`, in write order.
    pub fn phases_of(frame: i32) -> [FrameAndPhase; NUM_PHASES] {
        array_init::array_init(|idx| FrameAndPhase::new(frame, Phase::ALL[idx]))
    }

    /// The smallest key strictly greater than this one.
    pub fn next(self) -> FrameAndPhase {
        match self.phase {
            Phase::PrePushData => FrameAndPhase::new(self.frame, Phase::PostPushData),
            Phase::PostPushData => FrameAndPhase::new(self.frame, Phase::PostCallbacks),
            Phase::PostCallbacks => FrameAndPhase::new(self.frame + 1, Phase::PrePushData),
        }
    }
}

impl Display for FrameAndPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.frame, self.phase)
    }
}
