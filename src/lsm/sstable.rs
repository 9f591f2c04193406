use crate::error::{DbError, Result};
use crate::lsm::bloom::BloomFilter;
use crate::lsm::TOMBSTONE;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// File magic: the first four bytes of every SSTable.
const SSTABLE_MAGIC: &[u8; 4] = b"SSTB";

/// Keys larger than this are assumed corrupt during reads.
const MAX_KEY_BYTES: usize = 64 * 1024;
/// Values larger than this are assumed corrupt during reads.
const MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;
/// Bloom sections larger than this are treated as absent (legacy or
/// corrupt header).
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// Builds an immutable sorted table.
///
/// Entries may be added in any order; `finish` stable-sorts them,
/// keeps the last write per duplicate key, embeds a Bloom filter over
/// the surviving keys, and publishes the file atomically (write to a
/// temp path, fsync, rename). A failed `finish` leaves no file at the
/// target path.
///
/// ## File layout
///
/// ```text
/// [magic "SSTB"][entry count: u32 LE][bloom len: u32 LE][bloom bytes]
/// repeated: [key len: u32 LE][value len: u32 LE][key][value]
/// ```
///
/// Records are sorted ascending by key; tombstones are stored with the
/// same sentinel value the memtable uses.
pub struct SSTableWriter {
    path: PathBuf,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    bloom_bits_per_key: usize,
    bloom_num_hashes: u32,
}

impl SSTableWriter {
    pub fn open(path: &Path, bloom_bits_per_key: usize, bloom_num_hashes: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: Vec::new(),
            bloom_bits_per_key,
            bloom_num_hashes,
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.entries.push((key.to_vec(), value.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Result<()> {
        let tmp_path = self.path.with_extension("sst.tmp");
        let result = Self::write_entries(
            &tmp_path,
            self.entries,
            self.bloom_bits_per_key,
            self.bloom_num_hashes,
        );
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
            return result;
        }
        rename(&tmp_path, &self.path)?;

        // Sync the parent directory so the rename itself is durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn write_entries(
        tmp_path: &Path,
        mut entries: Vec<(Vec<u8>, Vec<u8>)>,
        bloom_bits_per_key: usize,
        bloom_num_hashes: u32,
    ) -> Result<()> {
        // Stable sort keeps insertion order among duplicates, so the
        // last add for a key is the last of its run.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut deduped: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last_mut() {
                Some(last) if last.0 == entry.0 => *last = entry,
                _ => deduped.push(entry),
            }
        }

        let mut bloom = BloomFilter::new(deduped.len(), bloom_bits_per_key, bloom_num_hashes);
        for (key, _) in &deduped {
            bloom.add(key);
        }
        let bloom_bytes = bloom.serialize();

        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut file = BufWriter::new(raw);

        file.write_all(SSTABLE_MAGIC)?;
        file.write_u32::<LittleEndian>(deduped.len() as u32)?;
        file.write_u32::<LittleEndian>(bloom_bytes.len() as u32)?;
        file.write_all(&bloom_bytes)?;

        for (key, value) in &deduped {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_u32::<LittleEndian>(value.len() as u32)?;
            file.write_all(key)?;
            file.write_all(value)?;
        }

        file.flush()?;
        file.into_inner()
            .map_err(|e| DbError::Internal(format!("sstable buffer flush failed: {}", e)))?
            .sync_all()?;
        Ok(())
    }
}

/// Reads an immutable sorted table, holding all entries in memory.
///
/// Lookups consult the Bloom filter first (a negative skips the binary
/// search entirely) and treat tombstone values as absent. Files written
/// before the Bloom section was introduced — length zero or out of
/// sanity bounds — are served without a filter.
pub struct SSTableReader {
    id: u64,
    path: PathBuf,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    bloom: Option<BloomFilter>,
    file_size: u64,
    bloom_checks: AtomicU64,
    bloom_hits: AtomicU64,
    bloom_false_positives: AtomicU64,
}

impl SSTableReader {
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut buf = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut buf)?;

        if buf.len() < 12 || &buf[0..4] != SSTABLE_MAGIC {
            return Err(DbError::Corruption(format!(
                "{} is not an SSTable",
                path.display()
            )));
        }
        let count = LittleEndian::read_u32(&buf[4..8]) as usize;
        let bloom_len = LittleEndian::read_u32(&buf[8..12]) as usize;

        let (bloom, mut pos) = if bloom_len == 0 {
            (None, 12)
        } else if bloom_len > MAX_BLOOM_BYTES || 12 + bloom_len > buf.len() {
            // Out of sanity bounds: legacy layout with records starting
            // right after the count field.
            warn!(path = %path.display(), bloom_len, "implausible bloom length, reading without filter");
            (None, 8)
        } else {
            let bloom = BloomFilter::deserialize(&buf[12..12 + bloom_len]);
            if bloom.is_none() {
                warn!(path = %path.display(), "undecodable bloom section, reading without filter");
            }
            (bloom, 12 + bloom_len)
        };

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 8 > buf.len() {
                return Err(DbError::Corruption(format!(
                    "{} truncated mid-record",
                    path.display()
                )));
            }
            let key_len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
            let value_len = LittleEndian::read_u32(&buf[pos + 4..pos + 8]) as usize;
            pos += 8;
            if key_len > MAX_KEY_BYTES || value_len > MAX_VALUE_BYTES {
                return Err(DbError::Corruption(format!(
                    "{} record length out of bounds",
                    path.display()
                )));
            }
            if pos + key_len + value_len > buf.len() {
                return Err(DbError::Corruption(format!(
                    "{} truncated mid-record",
                    path.display()
                )));
            }
            let key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let value = buf[pos..pos + value_len].to_vec();
            pos += value_len;
            entries.push((key, value));
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            entries,
            bloom,
            file_size,
            bloom_checks: AtomicU64::new(0),
            bloom_hits: AtomicU64::new(0),
            bloom_false_positives: AtomicU64::new(0),
        })
    }

    /// Raw lookup preserving the tombstone sentinel, so callers walking
    /// multiple tables can stop at the first hit.
    pub(crate) fn lookup(&self, key: &[u8]) -> Option<&[u8]> {
        if let Some(bloom) = &self.bloom {
            self.bloom_checks.fetch_add(1, Ordering::Relaxed);
            if !bloom.may_contain(key) {
                self.bloom_hits.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        match self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(idx) => Some(&self.entries[idx].1),
            Err(_) => {
                if self.bloom.is_some() {
                    self.bloom_false_positives.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    /// Point lookup with tombstones masked.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.lookup(key) {
            Some(value) if value == TOMBSTONE => None,
            Some(value) => Some(value.to_vec()),
            None => None,
        }
    }

    /// All entries in key order, tombstones included.
    pub fn get_all_sorted(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// On-disk size, used for level byte accounting.
    pub fn size_bytes(&self) -> u64 {
        self.file_size
    }

    pub fn has_bloom(&self) -> bool {
        self.bloom.is_some()
    }

    pub fn bloom_checks(&self) -> u64 {
        self.bloom_checks.load(Ordering::Relaxed)
    }

    pub fn bloom_hits(&self) -> u64 {
        self.bloom_hits.load(Ordering::Relaxed)
    }

    pub fn bloom_false_positives(&self) -> u64 {
        self.bloom_false_positives.load(Ordering::Relaxed)
    }
}
