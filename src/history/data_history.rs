//! Frame-indexed history of user records such as network inputs or replicated state.
//!
//! Unlike `PropertyBuffer`, which tracks physics properties for dirty objects, a
//! `DataHistory` holds one record per frame slot and can reconstruct a missing frame
//! from its recorded neighbours.
use tracing::trace;

use crate::{history::CircularBuffer, RewindError};

/// Payload stored in a `DataHistory`.
pub trait HistoryData: Clone + Default {
    /// Blends `from` and `to` into `self`. `alpha` is 0 at `from` and 1 at `to`.
    fn interpolate(&mut self, _from: &Self, _to: &Self, _alpha: f32) {}

    /// Folds an older record into `self`.
    fn merge(&mut self, _older: &Self) {}
}

/// One recorded frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryRecord<T> {
    /// Frame the record was captured on locally.
    pub local_frame: i32,
    /// Frame the record corresponds to on the authority.
    pub server_frame: i32,
    /// Set when the record no longer matches what was received.
    pub altered: bool,
    pub data: T,
}

impl<T> HistoryRecord<T> {
    pub fn new(local_frame: i32, server_frame: i32, data: T) -> Self {
        Self {
            local_frame,
            server_frame,
            altered: false,
            data,
        }
    }
}

/// Type-erased surface of a data history, for owners that hold many payload types.
pub trait RewindHistory {
    fn has_valid_data(&self, frame: i32) -> bool;
    /// Counts frames in `start..=end` holding a record.
    fn count_valid_data(&self, start: i32, end: i32) -> usize;
    fn latest_frame(&self) -> Option<i32>;
    fn earliest_frame(&self) -> Option<i32>;
    fn history_size(&self) -> usize;
    fn has_data_in_history(&self) -> bool;
    fn resize(&mut self, num_frames: usize) -> Result<(), RewindError>;
    fn reset_fast(&mut self);
}

#[derive(Debug, Clone)]
pub struct DataHistory<T> {
    records: CircularBuffer<Option<HistoryRecord<T>>>,
    latest_frame: Option<i32>,
    incremental: bool,
}

impl<T: HistoryData> DataHistory<T> {
    pub fn new(num_frames: usize) -> Result<Self, RewindError> {
        Ok(Self {
            records: CircularBuffer::new(num_frames)?,
            latest_frame: None,
            incremental: false,
        })
    }

    /// In incremental mode a slot is only overwritten by a record with a newer local frame.
    pub fn set_record_data_incremental(&mut self, incremental: bool) {
        self.incremental = incremental;
    }

    /// Stores `record` in the slot of its local frame. Returns false when refused.
    pub fn record_data(&mut self, record: HistoryRecord<T>) -> bool {
        let slot = &mut self.records[record.local_frame];
        if self.incremental {
            if let Some(existing) = slot {
                if existing.local_frame >= record.local_frame {
                    return false;
                }
            }
        }
        let frame = record.local_frame;
        *slot = Some(record);
        self.latest_frame = Some(self.latest_frame.map_or(frame, |latest| latest.max(frame)));
        true
    }

    pub fn record(&self, frame: i32) -> Option<&HistoryRecord<T>> {
        self.records[frame]
            .as_ref()
            .filter(|record| record.local_frame == frame)
    }

    pub fn record_mut(&mut self, frame: i32) -> Option<&mut HistoryRecord<T>> {
        self.records[frame]
            .as_mut()
            .filter(|record| record.local_frame == frame)
    }

    /// Returns the record of `frame`, or reconstructs one from the nearest recorded frames.
    ///
    /// With both neighbours available the payload is interpolated, with only an older one
    /// it is held. Reconstructed records keep the neighbour's `local_frame`, advance
    /// `server_frame` by the distance and are marked `altered`.
    pub fn extract_data(&self, frame: i32, exact_frame: bool) -> Option<HistoryRecord<T>> {
        let latest = self.latest_frame?;
        if frame - self.history_size() as i32 > latest {
            // too far past the newest record to hold it
            return None;
        }
        if let Some(record) = self.record(frame) {
            return Some(record.clone());
        }
        if exact_frame {
            return None;
        }

        let min = self.closest_data(frame, true)?;
        let mut extracted = min.clone();
        if let Some(max) = self.closest_data(frame, false) {
            let span = (max.local_frame - min.local_frame) as f32;
            let alpha = if span > 0.0 {
                (frame - min.local_frame) as f32 / span
            } else {
                0.0
            };
            extracted.data.interpolate(&min.data, &max.data, alpha);
            trace!(frame, from = min.local_frame, to = max.local_frame, "interpolated history record");
        } else {
            trace!(frame, from = min.local_frame, "held history record");
        }
        extracted.server_frame = min.server_frame + (frame - min.local_frame).abs();
        extracted.altered = true;
        Some(extracted)
    }

    /// Merges every record in `from_frame..into.local_frame` into `into`.
    pub fn merge_data(&self, from_frame: i32, into: &mut HistoryRecord<T>) {
        for frame in from_frame..into.local_frame {
            if let Some(record) = self.record(frame) {
                into.data.merge(&record.data);
                into.altered = true;
            }
        }
    }

    fn closest_data(&self, frame: i32, search_older: bool) -> Option<&HistoryRecord<T>> {
        (0..self.history_size() as i32)
            .map(|offset| if search_older { frame - offset } else { frame + offset })
            .find_map(|candidate| self.record(candidate))
    }
}

impl<T: HistoryData> RewindHistory for DataHistory<T> {
    fn has_valid_data(&self, frame: i32) -> bool {
        self.record(frame).is_some()
    }

    fn count_valid_data(&self, start: i32, end: i32) -> usize {
        (start..=end).filter(|&frame| self.has_valid_data(frame)).count()
    }

    fn latest_frame(&self) -> Option<i32> {
        self.latest_frame
    }

    fn earliest_frame(&self) -> Option<i32> {
        self.records.iter().flatten().map(|record| record.local_frame).min()
    }

    fn history_size(&self) -> usize {
        self.records.capacity()
    }

    fn has_data_in_history(&self) -> bool {
        self.latest_frame.is_some()
    }

    fn resize(&mut self, num_frames: usize) -> Result<(), RewindError> {
        if num_frames != self.history_size() {
            self.records.resize(num_frames)?;
        }
        Ok(())
    }

    /// Drops every record, keeping the allocated slots.
    fn reset_fast(&mut self) {
        self.latest_frame = None;
        for slot in self.records.iter_mut() {
            *slot = None;
        }
    }
}
