// VektorDB - Embedded vector-capable key-value database
// Storage core library module

pub mod buffer;
pub mod error;
pub mod lsm;
pub mod storage;
pub mod wal;

pub use error::{DbError, Result};

/// WAL durability mode.
///
/// `EveryWrite` issues a platform fsync after each appended record.
/// `Periodic` leaves draining to the log buffer and explicit
/// `force_flush` calls. `None` never syncs; a crash may lose recent
/// writes, but recovery still yields a consistent prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    EveryWrite,
    Periodic,
}

/// Storage core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for SSTable levels and the manifest.
    pub data_dir: String,
    /// Directory holding `wal.log`; defaults to `data_dir` when `None`.
    pub wal_dir: Option<String>,
    /// Buffer pool capacity in 4 KiB pages.
    pub buffer_pool_size: usize,
    /// MemTable byte size that triggers a flush to a new L0 SSTable.
    pub memtable_flush_threshold: usize,
    pub wal_sync_mode: SyncMode,
    /// Advisory block-cache budget in bytes; not enforced by the core.
    pub block_cache_size: usize,
    pub bloom_bits_per_key: usize,
    pub bloom_num_hashes: u32,
    /// Byte size of level 1; level n holds `level_size_multiplier^(n-1)` times this.
    pub level_base_size: u64,
    pub level_size_multiplier: u64,
    /// Try O_DIRECT on the data file, falling back to buffered I/O.
    pub direct_io: bool,
    /// Route batched page I/O through the submission queue.
    pub async_io: bool,
    /// Register a fixed page span with the submission queue.
    pub fixed_buffers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            wal_dir: None,
            buffer_pool_size: 1024,
            memtable_flush_threshold: 4 * 1024 * 1024,
            wal_sync_mode: SyncMode::EveryWrite,
            block_cache_size: 64 * 1024 * 1024,
            bloom_bits_per_key: 10,
            bloom_num_hashes: 3,
            level_base_size: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            direct_io: false,
            async_io: false,
            fixed_buffers: false,
        }
    }
}
