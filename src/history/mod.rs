//! History storage: frame keys, pooled property values, the property ring buffer and
//! frame-indexed rings.
pub mod buffer;
pub mod circular;
pub mod data_history;
pub mod frame;
pub mod pool;

pub use buffer::{BufferState, PropertyBuffer, PropertyInterval};
pub use circular::CircularBuffer;
pub use data_history::{DataHistory, HistoryData, HistoryRecord, RewindHistory};
pub use frame::{FrameAndPhase, Phase, NUM_PHASES};
pub use pool::{DirtyPropertiesPool, PoolProperty, PropertyIdx, PropertyPool};
