// Buffer pool: fixed frame cache over the disk manager with LRU-K
// replacement and pin-count safety.

pub mod eviction;
pub mod manager;

pub use eviction::{FrameId, LruKReplacer};
pub use manager::{BufferPoolManager, BufferPoolStats, PageRef};
