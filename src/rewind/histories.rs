//! Input and state histories registered by the game, consulted when picking a resim frame.
use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use tracing::{debug, trace};

use crate::{history::RewindHistory, world::ParticleHandle, RewindError};

use super::RewindData;

/// A history shared between its owner and `RewindData`.
pub type SharedHistory = Rc<RefCell<dyn RewindHistory>>;

/// Weak registrations, optionally keyed by the particle the history belongs to.
///
/// The owner keeps the history alive; dropped histories are pruned lazily.
#[derive(Debug, Default)]
pub(crate) struct RegisteredHistories {
    all: Vec<Weak<RefCell<dyn RewindHistory>>>,
    by_particle: HashMap<ParticleHandle, Weak<RefCell<dyn RewindHistory>>>,
}

impl RegisteredHistories {
    fn add(&mut self, history: &SharedHistory, particle: Option<ParticleHandle>) {
        let weak = Rc::downgrade(history);
        if !self.all.iter().any(|known| known.ptr_eq(&weak)) {
            self.all.push(weak.clone());
        }
        if let Some(particle) = particle {
            self.by_particle.insert(particle, weak);
        }
    }

    fn remove(&mut self, history: &SharedHistory, particle: Option<ParticleHandle>) {
        let weak = Rc::downgrade(history);
        self.all.retain(|known| !known.ptr_eq(&weak));
        if let Some(particle) = particle {
            self.by_particle.remove(&particle);
        }
    }

    pub(crate) fn forget_particle(&mut self, particle: ParticleHandle) {
        self.by_particle.remove(&particle);
    }

    pub(crate) fn for_particle(&self, particle: ParticleHandle) -> Option<SharedHistory> {
        self.by_particle.get(&particle).and_then(Weak::upgrade)
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = SharedHistory> + '_ {
        self.all.iter().filter_map(Weak::upgrade)
    }

    /// Drops registrations whose history no longer exists. Returns how many were dropped.
    pub(crate) fn prune(&mut self) -> usize {
        let before = self.all.len() + self.by_particle.len();
        self.all.retain(|known| known.strong_count() > 0);
        self.by_particle.retain(|_, known| known.strong_count() > 0);
        before - self.all.len() - self.by_particle.len()
    }

    fn len(&self) -> usize {
        self.all.iter().filter(|known| known.strong_count() > 0).count()
    }
}

/// Grows `history` so it covers every frame `RewindData` can rewind to.
fn fit_history(history: &SharedHistory, frames: usize) -> Result<(), RewindError> {
    let mut history = history.borrow_mut();
    if history.history_size() < frames {
        trace!(from = history.history_size(), to = frames, "growing registered history");
        history.resize(frames)?;
    }
    Ok(())
}

impl RewindData {
    /// Registers an input history replayed by the game during resims.
    ///
    /// With a `particle`, resim frames chosen for that particle must have an input
    /// recorded. The history is resized to the rewind capacity when it is smaller.
    pub fn add_input_history(
        &mut self,
        history: &SharedHistory,
        particle: Option<ParticleHandle>,
    ) -> Result<(), RewindError> {
        fit_history(history, self.capacity())?;
        self.input_histories.add(history, particle);
        debug!(particle = ?particle, "input history registered");
        Ok(())
    }

    pub fn remove_input_history(&mut self, history: &SharedHistory, particle: Option<ParticleHandle>) {
        self.input_histories.remove(history, particle);
    }

    /// Registers a state history the game restores from during resims.
    pub fn add_state_history(
        &mut self,
        history: &SharedHistory,
        particle: Option<ParticleHandle>,
    ) -> Result<(), RewindError> {
        fit_history(history, self.capacity())?;
        self.state_histories.add(history, particle);
        debug!(particle = ?particle, "state history registered");
        Ok(())
    }

    pub fn remove_state_history(&mut self, history: &SharedHistory, particle: Option<ParticleHandle>) {
        self.state_histories.remove(history, particle);
    }

    pub fn num_input_histories(&self) -> usize {
        self.input_histories.len()
    }

    pub fn num_state_histories(&self) -> usize {
        self.state_histories.len()
    }

    pub fn input_history_for(&self, particle: ParticleHandle) -> Option<SharedHistory> {
        self.input_histories.for_particle(particle)
    }

    pub fn state_history_for(&self, particle: ParticleHandle) -> Option<SharedHistory> {
        self.state_histories.for_particle(particle)
    }

    /// True when the input history of `particle`, if it has one, holds data for `frame`.
    pub(crate) fn has_input_for(&self, particle: ParticleHandle, frame: i32) -> bool {
        self.input_histories
            .for_particle(particle)
            .map_or(true, |history| history.borrow().has_valid_data(frame))
    }

    /// Number of frames in `from..to` that some registered input history is missing.
    pub fn missing_input_frames(&self, from: i32, to: i32) -> usize {
        if to <= from {
            return 0;
        }
        let expected = (to - from) as usize;
        self.input_histories
            .live()
            .map(|history| expected.saturating_sub(history.borrow().count_valid_data(from, to - 1)))
            .max()
            .unwrap_or(0)
    }
}
