// Write-ahead log: durable, totally ordered append stream with
// monotonic LSNs assigned at append time.

pub mod record;

pub use record::{LogPayload, LogRecord, Lsn, TxnId, INVALID_LSN};

use crate::error::{DbError, Result};
use crate::SyncMode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalStats {
    pub records: u64,
    pub bytes: u64,
    pub fsyncs: u64,
}

struct LogInner {
    writer: BufWriter<File>,
    next_lsn: Lsn,
}

/// Append-only serialized log of [`LogRecord`]s.
///
/// Framing: each record is a u32 little-endian length prefix followed
/// by the encoded body. A single mutex serializes appends, flushes, and
/// LSN assignment. A data-page change with log record LSN `L` may only
/// reach the data file after every record with LSN ≤ `L` has been
/// flushed here.
pub struct LogManager {
    path: PathBuf,
    sync_mode: SyncMode,
    inner: Mutex<LogInner>,
    stats: RwLock<WalStats>,
}

impl LogManager {
    /// Opens or creates the log at `path`. Existing records are scanned
    /// once so newly assigned LSNs continue past the highest on disk.
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut max_lsn = INVALID_LSN;
        if path.exists() {
            scan_file(path, INVALID_LSN, |record| {
                max_lsn = max_lsn.max(record.lsn);
            })?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), next_lsn = max_lsn + 1, "opened write-ahead log");

        Ok(Self {
            path: path.to_path_buf(),
            sync_mode,
            inner: Mutex::new(LogInner {
                writer: BufWriter::new(file),
                next_lsn: max_lsn + 1,
            }),
            stats: RwLock::new(WalStats::default()),
        })
    }

    fn append(&self, txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let record = LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        };
        let body = record.encode();

        inner.writer.write_u32::<LittleEndian>(body.len() as u32)?;
        inner.writer.write_all(&body)?;

        if self.sync_mode == SyncMode::EveryWrite {
            inner.writer.flush()?;
            inner.writer.get_mut().sync_data()?;
            self.stats.write().fsyncs += 1;
        }

        // The LSN is only consumed once the record is in the stream.
        inner.next_lsn += 1;
        drop(inner);

        let mut stats = self.stats.write();
        stats.records += 1;
        stats.bytes += 4 + body.len() as u64;
        Ok(lsn)
    }

    pub fn append_begin(&self, txn_id: TxnId) -> Result<Lsn> {
        self.append(txn_id, INVALID_LSN, LogPayload::Begin)
    }

    pub fn append_commit(&self, txn_id: TxnId, prev_lsn: Lsn) -> Result<Lsn> {
        self.append(txn_id, prev_lsn, LogPayload::Commit)
    }

    pub fn append_abort(&self, txn_id: TxnId, prev_lsn: Lsn) -> Result<Lsn> {
        self.append(txn_id, prev_lsn, LogPayload::Abort)
    }

    pub fn append_update(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        page_id: u64,
        offset: u32,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn> {
        self.append(
            txn_id,
            prev_lsn,
            LogPayload::Update {
                page_id,
                offset,
                before_image,
                after_image,
            },
        )
    }

    pub fn append_clr(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        page_id: u64,
        offset: u32,
        undo_image: Vec<u8>,
        undo_next_lsn: Lsn,
    ) -> Result<Lsn> {
        self.append(
            txn_id,
            prev_lsn,
            LogPayload::Clr {
                page_id,
                offset,
                undo_image,
                undo_next_lsn,
            },
        )
    }

    pub fn append_checkpoint(&self, active_txns: Vec<TxnId>) -> Result<Lsn> {
        self.append(0, INVALID_LSN, LogPayload::Checkpoint { active_txns })
    }

    /// Drains buffered records to the OS and issues a durability
    /// barrier, regardless of sync mode.
    pub fn force_flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_mut().sync_data()?;
        self.stats.write().fsyncs += 1;
        Ok(())
    }

    /// Replays every record with LSN ≥ `from_lsn` in file order. A
    /// partial record at the tail (torn final write) is discarded; a
    /// malformed record anywhere else is corruption.
    pub fn scan_forward<F: FnMut(&LogRecord)>(&self, from_lsn: Lsn, callback: F) -> Result<()> {
        // Make buffered appends visible to the read handle.
        self.inner.lock().writer.flush()?;
        scan_file(&self.path, from_lsn, callback)
    }

    /// Reserved. Backward iteration needs an offset index this log does
    /// not maintain yet.
    pub fn scan_backward<F: FnMut(&LogRecord)>(&self, _from_lsn: Lsn, _callback: F) -> Result<()> {
        Err(DbError::Unimplemented("backward log scan".to_string()))
    }

    /// Linear-scan lookup of a single record. O(file size).
    pub fn get_log_record(&self, lsn: Lsn) -> Result<Option<LogRecord>> {
        let mut found = None;
        self.scan_forward(lsn, |record| {
            if record.lsn == lsn && found.is_none() {
                found = Some(record.clone());
            }
        })?;
        Ok(found)
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn wal_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> WalStats {
        self.stats.read().clone()
    }
}

/// Sequentially decodes `path`, invoking `callback` for records with
/// LSN ≥ `from_lsn`. Shared by recovery, lookup, and LSN re-seeding.
fn scan_file<F: FnMut(&LogRecord)>(path: &Path, from_lsn: Lsn, mut callback: F) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    loop {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut body = vec![0u8; len as usize];
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Torn final append; everything before it is intact.
                warn!(path = %path.display(), "discarding partial record at log tail");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let record = LogRecord::decode(&body)?;
        if record.lsn >= from_lsn {
            callback(&record);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lsns_strictly_increase_and_scan_in_order() {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(&dir.path().join("wal.log"), SyncMode::EveryWrite).unwrap();

        let mut lsns = Vec::new();
        lsns.push(wal.append_begin(1).unwrap());
        lsns.push(
            wal.append_update(1, lsns[0], 5, 0, b"a".to_vec(), b"b".to_vec())
                .unwrap(),
        );
        lsns.push(wal.append_commit(1, lsns[1]).unwrap());

        for pair in lsns.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        let mut seen = Vec::new();
        wal.scan_forward(1, |record| seen.push(record.lsn)).unwrap();
        assert_eq!(seen, lsns);
    }

    #[test]
    fn test_scan_from_middle() {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(&dir.path().join("wal.log"), SyncMode::None).unwrap();
        for _ in 0..5 {
            wal.append_begin(1).unwrap();
        }

        let mut seen = Vec::new();
        wal.scan_forward(3, |record| seen.push(record.lsn)).unwrap();
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[test]
    fn test_reopen_continues_lsn_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = LogManager::open(&path, SyncMode::EveryWrite).unwrap();
            wal.append_begin(1).unwrap();
            wal.append_commit(1, 1).unwrap();
        }
        let wal = LogManager::open(&path, SyncMode::EveryWrite).unwrap();
        let lsn = wal.append_begin(2).unwrap();
        assert_eq!(lsn, 3);
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = LogManager::open(&path, SyncMode::EveryWrite).unwrap();
            wal.append_begin(1).unwrap();
            wal.append_begin(2).unwrap();
        }
        // Chop bytes off the last record.
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();

        let wal = LogManager::open(&path, SyncMode::EveryWrite).unwrap();
        let mut seen = Vec::new();
        wal.scan_forward(1, |record| seen.push(record.lsn)).unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_get_log_record_by_lsn() {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(&dir.path().join("wal.log"), SyncMode::None).unwrap();
        wal.append_begin(9).unwrap();
        wal.append_update(9, 1, 2, 4, b"x".to_vec(), b"y".to_vec())
            .unwrap();

        let record = wal.get_log_record(2).unwrap().unwrap();
        assert_eq!(record.txn_id, 9);
        assert!(matches!(record.payload, LogPayload::Update { .. }));
        assert!(wal.get_log_record(42).unwrap().is_none());
    }

    #[test]
    fn test_scan_backward_unimplemented() {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(&dir.path().join("wal.log"), SyncMode::None).unwrap();
        assert!(matches!(
            wal.scan_backward(1, |_| {}),
            Err(DbError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_wal_bytes_grow_with_appends() {
        let dir = tempdir().unwrap();
        let wal = LogManager::open(&dir.path().join("wal.log"), SyncMode::EveryWrite).unwrap();
        assert_eq!(wal.wal_bytes(), 0);
        wal.append_begin(1).unwrap();
        assert!(wal.wal_bytes() > 0);
        assert_eq!(wal.stats().records, 1);
    }
}
