use std::ops::{Index, IndexMut};

use crate::RewindError;

/// Fixed ring of slots addressed by frame number modulo capacity.
///
/// Any `i32` frame maps to a slot, negative frames included, so callers never need to
/// normalize before indexing.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Vec<T>,
}

impl<T: Default> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, RewindError> {
        if capacity == 0 {
            return Err(RewindError::ZeroCapacity);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        Ok(Self { slots })
    }

    /// Changes the number of slots. Slots past the new capacity are dropped, new ones are default.
    pub fn resize(&mut self, capacity: usize) -> Result<(), RewindError> {
        if capacity == 0 {
            return Err(RewindError::ZeroCapacity);
        }
        self.slots.resize_with(capacity, T::default);
        Ok(())
    }
}

impl<T> CircularBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self, frame: i32) -> usize {
        frame.rem_euclid(self.slots.len() as i32) as usize
    }

    pub fn get(&self, frame: i32) -> &T {
        &self.slots[self.slot_index(frame)]
    }

    pub fn get_mut(&mut self, frame: i32) -> &mut T {
        let idx = self.slot_index(frame);
        &mut self.slots[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

impl<T> Index<i32> for CircularBuffer<T> {
    type Output = T;

    fn index(&self, frame: i32) -> &Self::Output {
        self.get(frame)
    }
}

impl<T> IndexMut<i32> for CircularBuffer<T> {
    fn index_mut(&mut self, frame: i32) -> &mut Self::Output {
        self.get_mut(frame)
    }
}
