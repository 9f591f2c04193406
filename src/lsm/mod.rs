// LSM-tree write path: WAL, memtable, leveled SSTables, and the
// manifest, bound into the public Put/Get/Delete surface.

pub mod bloom;
pub mod level;
pub mod manifest;
pub mod memtable;
pub mod sstable;

pub use bloom::BloomFilter;
pub use level::{CompactionResult, Level, LeveledStore, L0_COMPACTION_TRIGGER, NUM_LEVELS};
pub use manifest::{Manifest, MANIFEST_FILENAME};
pub use memtable::MemTable;
pub use sstable::{SSTableReader, SSTableWriter};

use crate::error::{DbError, Result};
use crate::wal::{LogManager, LogPayload, Lsn, INVALID_LSN};
use crate::Config;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Sentinel value marking a deleted key, shared by the memtable, the
/// SSTable format, and the WAL. It shadows older versions of the key
/// until compaction reclaims it.
pub const TOMBSTONE: &[u8] = b"\x00__tombstone__\x00";

/// Name of the write-ahead log file within the WAL directory.
pub const WAL_FILENAME: &str = "wal.log";

#[derive(Debug, Clone, Default, Serialize)]
pub struct LsmStats {
    pub memtable_bytes: usize,
    pub memtable_entries: usize,
    pub sstable_count: usize,
    pub wal_bytes: u64,
    pub bloom_checks: u64,
    pub bloom_hits: u64,
    pub bloom_false_positives: u64,
    pub avg_get_us: f64,
    pub avg_put_us: f64,
    pub total_gets: u64,
    pub total_puts: u64,
}

#[derive(Default)]
struct LatencyAverages {
    avg_get_us: f64,
    avg_put_us: f64,
}

/// The storage engine's key-value surface.
///
/// Writes append to the WAL before touching the memtable; a failed
/// append leaves the memtable unchanged. Reads consult the memtable,
/// then every SSTable in search order, without taking the coordinator
/// lock — component locks and the leveled store's reader/writer lock
/// keep them consistent. Recovery on open replays the manifest for the
/// live table set and the WAL for the memtable.
pub struct LsmTree {
    config: Config,
    data_dir: PathBuf,
    wal: LogManager,
    mem: MemTable,
    store: RwLock<LeveledStore>,
    manifest: Mutex<Manifest>,
    next_sstable_id: AtomicU64,
    /// Serializes Put/Delete with flush and compaction.
    write_lock: Mutex<()>,
    is_open: AtomicBool,
    total_gets: AtomicU64,
    total_puts: AtomicU64,
    latencies: RwLock<LatencyAverages>,
}

impl LsmTree {
    /// Opens a database rooted at `config.data_dir`, creating the
    /// directory tree on first use and recovering state from the
    /// manifest and WAL otherwise. Recovery failures abort the open
    /// with no partial handle.
    pub fn open(config: Config) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let wal_dir = config
            .wal_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.clone());
        std::fs::create_dir_all(&wal_dir)?;
        for n in 0..NUM_LEVELS {
            std::fs::create_dir_all(data_dir.join(format!("level_{}", n)))?;
        }

        let manifest = Manifest::open(&data_dir.join(MANIFEST_FILENAME))?;
        let active = manifest.get_active_sstables()?;

        let mut store = LeveledStore::new(
            config.level_base_size,
            config.level_size_multiplier,
            config.bloom_bits_per_key,
            config.bloom_num_hashes,
        );
        let mut max_id = 0u64;
        // The manifest does not record levels, so every recovered table
        // lands in L0 and compaction redistributes from there. Ids are
        // ascending; inserting at the L0 front leaves the newest first.
        for id in &active {
            let path = locate_sstable(&data_dir, *id)?;
            let reader = SSTableReader::open(&path, *id)?;
            store.add_l0_sstable(reader);
            max_id = max_id.max(*id);
        }
        debug!(recovered = active.len(), "manifest replay complete");

        let wal = LogManager::open(&wal_dir.join(WAL_FILENAME), config.wal_sync_mode)?;
        let mem = MemTable::new();
        let mut replayed = 0u64;
        wal.scan_forward(1, |record| {
            if let LogPayload::Update {
                before_image,
                after_image,
                ..
            } = &record.payload
            {
                if after_image.as_slice() == TOMBSTONE {
                    mem.delete(before_image);
                } else {
                    mem.put(before_image, after_image);
                }
                replayed += 1;
            }
        })?;
        debug!(replayed, "write-ahead log replay complete");

        Ok(Self {
            config,
            data_dir,
            wal,
            mem,
            store: RwLock::new(store),
            manifest: Mutex::new(manifest),
            next_sstable_id: AtomicU64::new(max_id + 1),
            write_lock: Mutex::new(()),
            is_open: AtomicBool::new(true),
            total_gets: AtomicU64::new(0),
            total_puts: AtomicU64::new(0),
            latencies: RwLock::new(LatencyAverages::default()),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Internal("store is not open".to_string()))
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let start = Instant::now();
        {
            let _guard = self.write_lock.lock();
            self.wal
                .append_update(0, INVALID_LSN, 0, 0, key.to_vec(), value.to_vec())?;
            self.mem.put(key, value);
            if self.mem.approximate_size_bytes() >= self.config.memtable_flush_threshold {
                self.flush_memtable()?;
            }
        }
        let n = self.total_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_put_latency(start, n);
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let start = Instant::now();
        {
            let _guard = self.write_lock.lock();
            self.wal
                .append_update(0, INVALID_LSN, 0, 0, key.to_vec(), TOMBSTONE.to_vec())?;
            self.mem.delete(key);
            if self.mem.approximate_size_bytes() >= self.config.memtable_flush_threshold {
                self.flush_memtable()?;
            }
        }
        let n = self.total_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_put_latency(start, n);
        Ok(())
    }

    /// Point lookup. Absent keys and deleted keys read as `None`; a
    /// closed store reads as `None` as well, never an error.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if !self.is_open.load(Ordering::SeqCst) {
            return None;
        }
        let start = Instant::now();
        let result = self.lookup(key);
        let n = self.total_gets.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_get_latency(start, n);
        result
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(raw) = self.mem.entry(key) {
            return mask_tombstone_owned(raw);
        }
        let store = self.store.read();
        for table in store.get_all_sstables() {
            if let Some(raw) = table.lookup(key) {
                return if raw == TOMBSTONE {
                    None
                } else {
                    Some(raw.to_vec())
                };
            }
        }
        None
    }

    /// Forces the memtable out to a new L0 SSTable regardless of size.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.flush_memtable()
    }

    /// Flush procedure; the caller holds the coordinator lock. Ordering
    /// is load-bearing: the table file exists before the manifest ADD,
    /// and compacted source files are deleted only after their REMOVE
    /// records are durable.
    fn flush_memtable(&self) -> Result<()> {
        let entries = self.mem.get_all_sorted();
        if entries.is_empty() {
            return Ok(());
        }

        let id = self.next_sstable_id.fetch_add(1, Ordering::SeqCst);
        let path = self
            .data_dir
            .join("level_0")
            .join(format!("sstable_{}.sst", id));
        let mut writer = SSTableWriter::open(
            &path,
            self.config.bloom_bits_per_key,
            self.config.bloom_num_hashes,
        );
        for (key, value) in &entries {
            writer.add(key, value);
        }
        writer.finish()?;
        let reader = SSTableReader::open(&path, id)?;

        self.manifest.lock().add_sstable(id)?;
        self.store.write().add_l0_sstable(reader);
        self.mem.clear();
        debug!(id, entries = entries.len(), "flushed memtable to level 0");

        let result = self
            .store
            .write()
            .maybe_compact(&self.data_dir, &self.next_sstable_id)?;
        if result.performed {
            {
                let mut manifest = self.manifest.lock();
                manifest.remove_sstables(&result.removed_ids)?;
                for added in &result.added_ids {
                    manifest.add_sstable(*added)?;
                }
            }
            for path in &result.removed_paths {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to delete compacted sstable");
                }
            }
        }
        Ok(())
    }

    /// Merges every live source newest-wins and drops tombstones:
    /// the full enumeration helper.
    pub fn get_all_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let store = self.store.read();
            // Oldest first, so newer tables overwrite.
            for table in store.get_all_sstables().iter().rev() {
                for (key, value) in table.get_all_sorted() {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in self.mem.get_all_sorted() {
            merged.insert(key, value);
        }
        merged
            .into_iter()
            .filter(|(_, value)| value.as_slice() != TOMBSTONE)
            .collect()
    }

    /// Logs a checkpoint record and hardens the WAL.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let lsn = self.wal.append_checkpoint(Vec::new())?;
        self.wal.force_flush()?;
        Ok(lsn)
    }

    /// Hardens the WAL and marks the handle closed. Subsequent writes
    /// fail; subsequent reads return `None`.
    pub fn close(&self) -> Result<()> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.wal.force_flush()
    }

    pub fn stats(&self) -> LsmStats {
        let (sstable_count, bloom_checks, bloom_hits, bloom_false_positives) = {
            let store = self.store.read();
            let tables = store.get_all_sstables();
            (
                tables.len(),
                tables.iter().map(|t| t.bloom_checks()).sum(),
                tables.iter().map(|t| t.bloom_hits()).sum(),
                tables.iter().map(|t| t.bloom_false_positives()).sum(),
            )
        };
        let latencies = self.latencies.read();
        LsmStats {
            memtable_bytes: self.mem.approximate_size_bytes(),
            memtable_entries: self.mem.len(),
            sstable_count,
            wal_bytes: self.wal.wal_bytes(),
            bloom_checks,
            bloom_hits,
            bloom_false_positives,
            avg_get_us: latencies.avg_get_us,
            avg_put_us: latencies.avg_put_us,
            total_gets: self.total_gets.load(Ordering::SeqCst),
            total_puts: self.total_puts.load(Ordering::SeqCst),
        }
    }

    fn record_get_latency(&self, start: Instant, n: u64) {
        let us = start.elapsed().as_micros() as f64;
        let mut latencies = self.latencies.write();
        latencies.avg_get_us = (latencies.avg_get_us * (n - 1) as f64 + us) / n as f64;
    }

    fn record_put_latency(&self, start: Instant, n: u64) {
        let us = start.elapsed().as_micros() as f64;
        let mut latencies = self.latencies.write();
        latencies.avg_put_us = (latencies.avg_put_us * (n - 1) as f64 + us) / n as f64;
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // The WAL still holds everything needed for recovery; syncing
        // here is best effort.
        let _ = self.close();
    }
}

fn mask_tombstone_owned(raw: Vec<u8>) -> Option<Vec<u8>> {
    if raw.as_slice() == TOMBSTONE {
        None
    } else {
        Some(raw)
    }
}

/// Finds the file backing a live manifest id, searching the level
/// directories first and the legacy flat layout as a fallback.
fn locate_sstable(data_dir: &Path, id: u64) -> Result<PathBuf> {
    for n in 0..NUM_LEVELS {
        let path = data_dir
            .join(format!("level_{}", n))
            .join(format!("sstable_{}.sst", id));
        if path.exists() {
            return Ok(path);
        }
    }
    let legacy = data_dir.join(format!("sstable_{}.sst", id));
    if legacy.exists() {
        warn!(id, "sstable found in legacy flat layout");
        return Ok(legacy);
    }
    Err(DbError::Corruption(format!(
        "manifest references sstable {} but no file exists",
        id
    )))
}
