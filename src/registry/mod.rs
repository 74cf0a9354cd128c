//! Dense registry of tracked objects keyed by handle.
//!
//! Values live contiguously for bulk passes over everything dirty, and a side map gives
//! O(1) lookup by key. Removal swaps the last value into the hole and repoints its key
//! in the same call, so the map never refers to a stale slot.
use std::{collections::HashMap, hash::Hash};

use tracing::warn;

/// A registry value that knows which key it was registered under.
pub trait DirtyEntry {
    type Key: Copy + Eq + Hash + std::fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// Whether `remove` may give back spare capacity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllowShrinking {
    Yes,
    No,
}

#[derive(Debug)]
pub struct DirtyObjects<V: DirtyEntry> {
    key_to_idx: HashMap<V::Key, usize>,
    dense: Vec<V>,
}

impl<V: DirtyEntry> Default for DirtyObjects<V> {
    fn default() -> Self {
        Self {
            key_to_idx: HashMap::new(),
            dense: Vec::new(),
        }
    }
}

impl<V: DirtyEntry> DirtyObjects<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `val` under its own key.
    ///
    /// Adding a key twice is a caller bug: it is logged, `val` is dropped, and the existing
    /// value is returned.
    pub fn add(&mut self, val: V) -> &mut V {
        let key = val.key();
        if let Some(&idx) = self.key_to_idx.get(&key) {
            warn!(?key, "object is already registered");
            return &mut self.dense[idx];
        }
        self.dense.push(val);
        let idx = self.dense.len() - 1;
        self.key_to_idx.insert(key, idx);
        &mut self.dense[idx]
    }

    pub fn find(&self, key: V::Key) -> Option<&V> {
        self.key_to_idx.get(&key).map(|&idx| &self.dense[idx])
    }

    pub fn find_mut(&mut self, key: V::Key) -> Option<&mut V> {
        self.key_to_idx.get(&key).map(|&idx| &mut self.dense[idx])
    }

    /// Lookup that requires `key` to be registered. Panics otherwise.
    pub fn find_checked(&self, key: V::Key) -> &V {
        &self.dense[self.key_to_idx[&key]]
    }

    /// Mutable lookup that requires `key` to be registered. Panics otherwise.
    pub fn find_checked_mut(&mut self, key: V::Key) -> &mut V {
        let idx = self.key_to_idx[&key];
        &mut self.dense[idx]
    }

    pub fn contains(&self, key: V::Key) -> bool {
        self.key_to_idx.contains_key(&key)
    }

    /// Swap-removes the value registered under `key`.
    #[must_use = "the removed value may own resources its caller has to release"]
    pub fn remove(&mut self, key: V::Key, allow_shrinking: AllowShrinking) -> Option<V> {
        let idx = self.key_to_idx.remove(&key)?;
        let removed = self.dense.swap_remove(idx);
        if let Some(swapped) = self.dense.get(idx) {
            self.key_to_idx.insert(swapped.key(), idx);
        }
        if allow_shrinking == AllowShrinking::Yes {
            self.dense.shrink_to_fit();
        }
        Some(removed)
    }

    /// Swap-removes the value at dense position `idx`.
    #[must_use = "the removed value may own resources its caller has to release"]
    pub fn remove_at(&mut self, idx: usize, allow_shrinking: AllowShrinking) -> Option<V> {
        let key = self.dense.get(idx)?.key();
        self.remove(key, allow_shrinking)
    }

    pub fn shrink(&mut self) {
        self.dense.shrink_to_fit();
        self.key_to_idx.shrink_to_fit();
    }

    pub fn reset(&mut self) {
        self.dense.clear();
        self.key_to_idx.clear();
    }

    /// Unregisters every value and hands them out in dense order.
    pub fn drain(&mut self) -> std::vec::Drain<'_, V> {
        self.key_to_idx.clear();
        self.dense.drain(..)
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    pub fn dense_at(&self, idx: usize) -> &V {
        &self.dense[idx]
    }

    pub fn dense_at_mut(&mut self, idx: usize) -> &mut V {
        &mut self.dense[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.dense.iter()
    }

    /// Values must keep their key; changing what `key()` returns breaks lookup.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.dense.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = V::Key> + '_ {
        self.dense.iter().map(DirtyEntry::key)
    }
}
