//! Fixed-capacity ring of property history keyed by `FrameAndPhase`.
//!
//! `PropertyBuffer` stores `(PropertyIdx, FrameAndPhase)` pairs in a circular array
//! and resolves values through the `DirtyPropertiesPool`. Entries are kept in
//! ascending key order when walked from oldest to newest; writing into a full ring
//! silently evicts the oldest entry.
//!
//! Two lookup modes are selected by `NO_ENTRY_IS_HEAD`:
//! - `true`: an entry covers the whole interval up to its key, so a lookup resolves to
//!   the earliest entry at or after the query, and no entry means the live head holds.
//! - `false`: each entry only describes the key it was written at, lookups need an exact
//!   match, and no entry means the zero value.
use std::marker::PhantomData;

use tracing::error;

use crate::{
    history::{pool::PoolProperty, DirtyPropertiesPool, FrameAndPhase, PropertyIdx},
    state::HistoryProperty,
    RewindError,
};

/// One ring entry: a pool reference and the key it was written at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PropertyInterval {
    pub reference: PropertyIdx,
    pub frame_and_phase: FrameAndPhase,
}

/// Cursor snapshot used to temporarily rewrite history and put it back.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferState {
    pub num_valid: usize,
    pub next: usize,
}

#[derive(Debug)]
pub struct PropertyBuffer<T, const NO_ENTRY_IS_HEAD: bool = true> {
    next: usize,
    num_valid: usize,
    capacity: usize,
    buffer: Vec<PropertyInterval>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PoolProperty, const NO_ENTRY_IS_HEAD: bool> PropertyBuffer<T, NO_ENTRY_IS_HEAD> {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            num_valid: 0,
            capacity: capacity.max(1),
            buffer: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Gets write access in strictly increasing key order: x_{n+1} > x_n.
    ///
    /// A key that does not grow is refused: the write is ignored and `TimeTravel` returned.
    pub fn write_access_monotonic<'a>(
        &mut self,
        frame_and_phase: FrameAndPhase,
        pool: &'a mut DirtyPropertiesPool,
    ) -> Result<&'a mut T, RewindError> {
        if let Some(latest) = self.head_frame_and_phase() {
            if latest >= frame_and_phase {
                error!(
                    %latest,
                    requested = %frame_and_phase,
                    "monotonic history write to an already written key"
                );
                return Err(RewindError::TimeTravel {
                    latest,
                    requested: frame_and_phase,
                });
            }
        }
        Ok(self.claim_next(frame_and_phase, pool))
    }

    /// Gets write access in non-decreasing key order: x_{n+1} >= x_n.
    ///
    /// Writing the latest key again returns `None` so one phase can see several writers
    /// while only the first is recorded.
    pub fn write_access_non_decreasing<'a>(
        &mut self,
        frame_and_phase: FrameAndPhase,
        pool: &'a mut DirtyPropertiesPool,
    ) -> Result<Option<&'a mut T>, RewindError> {
        if let Some(latest) = self.head_frame_and_phase() {
            if latest > frame_and_phase {
                error!(
                    %latest,
                    requested = %frame_and_phase,
                    "non-decreasing history write went backwards"
                );
                return Err(RewindError::TimeTravel {
                    latest,
                    requested: frame_and_phase,
                });
            }
            if latest == frame_and_phase {
                return Ok(None);
            }
        }
        Ok(Some(self.claim_next(frame_and_phase, pool)))
    }

    /// Searches newest to oldest for the entry covering `frame_and_phase`.
    pub fn read<'a>(
        &self,
        frame_and_phase: FrameAndPhase,
        pool: &'a DirtyPropertiesPool,
    ) -> Option<&'a T> {
        self.find_idx(frame_and_phase)
            .map(|idx| T::pool(pool).get(self.buffer[idx].reference))
    }

    /// Key of the most recent entry.
    pub fn head_frame_and_phase(&self) -> Option<FrameAndPhase> {
        if self.num_valid == 0 {
            return None;
        }
        Some(self.buffer[self.prev_index(self.next)].frame_and_phase)
    }

    /// Finds or creates the entry for exactly `frame_and_phase`, keeping the ring sorted.
    ///
    /// Unlike the write accessors this accepts keys older than the head, shifting newer
    /// entries forward to open a slot.
    pub fn insert<'a>(
        &mut self,
        frame_and_phase: FrameAndPhase,
        pool: &'a mut DirtyPropertiesPool,
    ) -> &'a mut T {
        let pool = T::pool_mut(pool);
        if let Some(idx) = self.find_exact(frame_and_phase) {
            return pool.get_mut(self.buffer[idx].reference);
        }

        // the slot at `next` is either unused or holds the oldest entry about to be evicted
        let shiftable = if self.num_valid == self.capacity {
            self.num_valid - 1
        } else {
            self.num_valid
        };
        let reference = if self.next < self.buffer.len() {
            self.buffer[self.next].reference
        } else {
            let (idx, _) = pool.add_element();
            self.buffer.push(PropertyInterval {
                reference: idx,
                frame_and_phase,
            });
            idx
        };

        let mut hole = self.next;
        for _ in 0..shiftable {
            let prev = self.prev_index(hole);
            if self.buffer[prev].frame_and_phase < frame_and_phase {
                break;
            }
            self.buffer[hole] = self.buffer[prev];
            hole = prev;
        }
        self.buffer[hole] = PropertyInterval {
            reference,
            frame_and_phase,
        };
        self.advance_cursor();

        let slot = pool.get_mut(reference);
        *slot = T::zeroed();
        slot
    }

    /// Releases every claimed slot back into the pool. Calling it again is a no-op.
    pub fn release(&mut self, pool: &mut DirtyPropertiesPool) {
        let pool = T::pool_mut(pool);
        for interval in self.buffer.drain(..) {
            pool.remove_element(interval.reference);
        }
        self.num_valid = 0;
        self.next = 0;
    }

    /// Forgets all entries but keeps pool slots for reuse.
    pub fn reset(&mut self) {
        self.num_valid = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.num_valid == 0
    }

    pub fn len(&self) -> usize {
        self.num_valid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves `next` backwards until `frame_and_phase` and everything after it is gone.
    pub fn clear_entry_and_future(&mut self, frame_and_phase: FrameAndPhase) {
        while self.num_valid > 0 {
            let potential_next = self.prev_index(self.next);
            if self.buffer[potential_next].frame_and_phase < frame_and_phase {
                break;
            }
            self.next = potential_next;
            self.num_valid -= 1;
        }
    }

    pub fn extract_buffer_state(&self) -> BufferState {
        BufferState {
            num_valid: self.num_valid,
            next: self.next,
        }
    }

    pub fn restore_buffer_state(&mut self, state: BufferState) {
        self.num_valid = state.num_valid.min(self.buffer.len());
        self.next = state.next.min(self.buffer.len());
    }

    /// True when no entry covers `frame_and_phase`.
    pub fn is_clean(&self, frame_and_phase: FrameAndPhase) -> bool {
        self.find_idx(frame_and_phase).is_none()
    }

    /// Compares the recorded value against the live head.
    ///
    /// Without a recorded value the buffer's mode decides: the head is trusted, or the head
    /// must equal the zero value.
    pub fn is_in_sync<H>(
        &self,
        head: &H,
        frame_and_phase: FrameAndPhase,
        pool: &DirtyPropertiesPool,
    ) -> bool
    where
        T: HistoryProperty<H>,
    {
        match self.read(frame_and_phase, pool) {
            Some(val) => *val == T::copy_from(head),
            None if NO_ENTRY_IS_HEAD => true,
            None => T::copy_from(head) == T::zeroed(),
        }
    }

    /// Keys of valid entries, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = FrameAndPhase> + '_ {
        (0..self.num_valid).map(move |i| self.buffer[self.ordered_index(i)].frame_and_phase)
    }

    /// Valid entries with their values, oldest first.
    pub fn iter<'a>(
        &'a self,
        pool: &'a DirtyPropertiesPool,
    ) -> impl Iterator<Item = (FrameAndPhase, &'a T)> + 'a {
        let values = T::pool(pool);
        (0..self.num_valid).map(move |i| {
            let interval = self.buffer[self.ordered_index(i)];
            (interval.frame_and_phase, values.get(interval.reference))
        })
    }

    fn ordered_index(&self, i: usize) -> usize {
        let len = self.buffer.len();
        (self.next + len - self.num_valid + i) % len
    }

    fn prev_index(&self, idx: usize) -> usize {
        if idx == 0 {
            self.buffer.len() - 1
        } else {
            idx - 1
        }
    }

    fn advance_cursor(&mut self) {
        self.next += 1;
        if self.next == self.capacity {
            self.next = 0;
        }
        self.num_valid = (self.num_valid + 1).min(self.capacity);
    }

    fn claim_next<'a>(
        &mut self,
        frame_and_phase: FrameAndPhase,
        pool: &'a mut DirtyPropertiesPool,
    ) -> &'a mut T {
        let pool = T::pool_mut(pool);
        let reference = if self.next < self.buffer.len() {
            let interval = &mut self.buffer[self.next];
            interval.frame_and_phase = frame_and_phase;
            interval.reference
        } else {
            let (idx, _) = pool.add_element();
            self.buffer.push(PropertyInterval {
                reference: idx,
                frame_and_phase,
            });
            idx
        };
        self.advance_cursor();
        pool.get_mut(reference)
    }

    fn find_idx(&self, frame_and_phase: FrameAndPhase) -> Option<usize> {
        // reverse order, rewinds rarely reach far back
        let mut cur = self.next;
        let mut result = None;
        for _ in 0..self.num_valid {
            cur = self.prev_index(cur);
            if self.buffer[cur].frame_and_phase < frame_and_phase {
                // everything older is smaller too
                break;
            }
            result = Some(cur);
        }

        if NO_ENTRY_IS_HEAD {
            result
        } else {
            result.filter(|&idx| self.buffer[idx].frame_and_phase == frame_and_phase)
        }
    }

    fn find_exact(&self, frame_and_phase: FrameAndPhase) -> Option<usize> {
        self.find_idx(frame_and_phase)
            .filter(|&idx| self.buffer[idx].frame_and_phase == frame_and_phase)
    }
}
