use crate::error::Result;
use crate::lsm::sstable::{SSTableReader, SSTableWriter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Number of levels the store maintains (`level_0` .. `level_5`).
pub const NUM_LEVELS: usize = 6;

/// L0 file count that triggers compaction into L1.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// What a compaction pass changed. The store never touches the
/// manifest; the coordinator owns the global serial order and applies
/// these as REMOVE-then-ADD records, then deletes the listed files.
#[derive(Debug, Default)]
pub struct CompactionResult {
    pub performed: bool,
    pub added_ids: Vec<u64>,
    pub removed_ids: Vec<u64>,
    /// Paths of compacted-away files, deletable only after the manifest
    /// records are durable.
    pub removed_paths: Vec<PathBuf>,
}

/// One level of the tree. L0 tables may overlap and are kept newest
/// first; levels ≥ 1 hold a single merged table at a time in this
/// design, so ranges never overlap.
pub struct Level {
    number: usize,
    sstables: Vec<SSTableReader>,
}

impl Level {
    fn new(number: usize) -> Self {
        Self {
            number,
            sstables: Vec::new(),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn sstables(&self) -> &[SSTableReader] {
        &self.sstables
    }

    pub fn len(&self) -> usize {
        self.sstables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sstables.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.sstables.iter().map(|s| s.size_bytes()).sum()
    }
}

/// Multi-level SSTable organization with size-triggered compaction.
///
/// Search order is all of L0 newest first, then L1, L2, … Compaction
/// merges whole levels: L0 + L1 into a new L1 table once L0 holds four
/// files, and level n into n+1 once level n's bytes reach
/// `level_base_size · multiplier^(n-1)`. Tombstones survive every
/// merge; dropping one is only safe with proof that no lower level
/// still holds the shadowed key, which this version does not attempt.
pub struct LeveledStore {
    levels: Vec<Level>,
    level_base_size: u64,
    level_size_multiplier: u64,
    bloom_bits_per_key: usize,
    bloom_num_hashes: u32,
}

impl LeveledStore {
    pub fn new(
        level_base_size: u64,
        level_size_multiplier: u64,
        bloom_bits_per_key: usize,
        bloom_num_hashes: u32,
    ) -> Self {
        Self {
            levels: (0..NUM_LEVELS).map(Level::new).collect(),
            level_base_size,
            level_size_multiplier,
            bloom_bits_per_key,
            bloom_num_hashes,
        }
    }

    /// Inserts a freshly flushed (or recovered) table at the front of
    /// L0, keeping newest-first search order.
    pub fn add_l0_sstable(&mut self, reader: SSTableReader) {
        self.levels[0].sstables.insert(0, reader);
    }

    pub fn level(&self, n: usize) -> Option<&Level> {
        self.levels.get(n)
    }

    /// Readers in search order: L0 newest first, then each deeper
    /// level. Borrowed references, valid for the caller's traversal.
    pub fn get_all_sstables(&self) -> Vec<&SSTableReader> {
        self.levels
            .iter()
            .flat_map(|level| level.sstables.iter())
            .collect()
    }

    pub fn sstable_count(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    /// Byte threshold at which level `n` (n ≥ 1) triggers compaction.
    fn level_threshold(&self, n: usize) -> u64 {
        self.level_base_size * self.level_size_multiplier.pow(n as u32 - 1)
    }

    fn next_trigger(&self) -> Option<usize> {
        if self.levels[0].len() >= L0_COMPACTION_TRIGGER {
            return Some(0);
        }
        // The last level has nowhere to spill into.
        for n in 1..NUM_LEVELS - 1 {
            if !self.levels[n].is_empty() && self.levels[n].size_bytes() >= self.level_threshold(n) {
                return Some(n);
            }
        }
        None
    }

    /// Runs every triggered compaction, cascading until no level is
    /// over its threshold. Fresh table ids come from `next_id`. The
    /// added/removed sets are reconciled so a table created and
    /// consumed within the same pass appears in neither.
    pub fn maybe_compact(
        &mut self,
        data_dir: &Path,
        next_id: &AtomicU64,
    ) -> Result<CompactionResult> {
        let mut result = CompactionResult::default();
        let mut added: Vec<u64> = Vec::new();
        let mut removed: Vec<(u64, PathBuf)> = Vec::new();

        while let Some(n) = self.next_trigger() {
            let (new_id, sources) = self.compact_level(n, data_dir, next_id)?;
            for (id, path) in sources {
                if let Some(pos) = added.iter().position(|&a| a == id) {
                    // Created and consumed within this pass: drop both
                    // sides and delete the intermediate file now.
                    added.remove(pos);
                    let _ = std::fs::remove_file(&path);
                } else {
                    removed.push((id, path));
                }
            }
            if let Some(id) = new_id {
                added.push(id);
            }
            result.performed = true;
        }

        result.added_ids = added;
        result.removed_ids = removed.iter().map(|(id, _)| *id).collect();
        result.removed_paths = removed.into_iter().map(|(_, path)| path).collect();
        Ok(result)
    }

    /// Merges all of level `n` with all of level `n+1` into one new
    /// table in `level_<n+1>/`. Returns the new table's id (if any
    /// entries survived) and the drained sources.
    fn compact_level(
        &mut self,
        n: usize,
        data_dir: &Path,
        next_id: &AtomicU64,
    ) -> Result<(Option<u64>, Vec<(u64, PathBuf)>)> {
        let target = n + 1;

        // Newest-wins merge: apply the target level first (oldest
        // data), then the source level oldest to newest so later
        // applications overwrite earlier ones. L0 is stored newest
        // first, hence the reversed iteration.
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for table in &self.levels[target].sstables {
            for (k, v) in table.get_all_sorted() {
                merged.insert(k.clone(), v.clone());
            }
        }
        for table in self.levels[n].sstables.iter().rev() {
            for (k, v) in table.get_all_sorted() {
                merged.insert(k.clone(), v.clone());
            }
        }

        let sources: Vec<(u64, PathBuf)> = self.levels[n]
            .sstables
            .iter()
            .chain(self.levels[target].sstables.iter())
            .map(|t| (t.id(), t.path().to_path_buf()))
            .collect();

        let new_reader = if merged.is_empty() {
            None
        } else {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            let level_dir = data_dir.join(format!("level_{}", target));
            std::fs::create_dir_all(&level_dir)?;
            let path = level_dir.join(format!("sstable_{}.sst", id));

            let mut writer =
                SSTableWriter::open(&path, self.bloom_bits_per_key, self.bloom_num_hashes);
            for (k, v) in &merged {
                writer.add(k, v);
            }
            writer.finish()?;
            Some(SSTableReader::open(&path, id)?)
        };

        debug!(
            source_level = n,
            target_level = target,
            sources = sources.len(),
            merged_entries = merged.len(),
            "compacted level"
        );

        self.levels[n].sstables.clear();
        self.levels[target].sstables.clear();
        let mut new_id = None;
        if let Some(reader) = new_reader {
            new_id = Some(reader.id());
            self.levels[target].sstables.push(reader);
        }
        Ok((new_id, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_l0_table(dir: &Path, id: u64, entries: &[(&[u8], &[u8])]) -> SSTableReader {
        let level_dir = dir.join("level_0");
        std::fs::create_dir_all(&level_dir).unwrap();
        let path = level_dir.join(format!("sstable_{}.sst", id));
        let mut writer = SSTableWriter::open(&path, 10, 3);
        for (k, v) in entries {
            writer.add(k, v);
        }
        writer.finish().unwrap();
        SSTableReader::open(&path, id).unwrap()
    }

    fn make_store() -> LeveledStore {
        LeveledStore::new(10 * 1024 * 1024, 10, 10, 3)
    }

    #[test]
    fn test_search_order_is_l0_newest_first() {
        let dir = tempdir().unwrap();
        let mut store = make_store();
        store.add_l0_sstable(write_l0_table(dir.path(), 1, &[(b"k", b"old")]));
        store.add_l0_sstable(write_l0_table(dir.path(), 2, &[(b"k", b"new")]));

        let order: Vec<u64> = store.get_all_sstables().iter().map(|t| t.id()).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_three_l0_tables_do_not_trigger() {
        let dir = tempdir().unwrap();
        let mut store = make_store();
        let next_id = AtomicU64::new(4);
        for id in 1..=3 {
            store.add_l0_sstable(write_l0_table(dir.path(), id, &[(b"k", b"v")]));
        }
        let result = store.maybe_compact(dir.path(), &next_id).unwrap();
        assert!(!result.performed);
        assert_eq!(store.level(0).unwrap().len(), 3);
    }

    #[test]
    fn test_four_l0_tables_compact_into_l1() {
        let dir = tempdir().unwrap();
        let mut store = make_store();
        let next_id = AtomicU64::new(5);
        for id in 1..=4u64 {
            let key = format!("k{}", id);
            store.add_l0_sstable(write_l0_table(
                dir.path(),
                id,
                &[(key.as_bytes(), b"v"), (b"shared", format!("from-{}", id).as_bytes())],
            ));
        }

        let result = store.maybe_compact(dir.path(), &next_id).unwrap();
        assert!(result.performed);
        assert_eq!(result.added_ids, vec![5]);
        assert_eq!(result.removed_ids.len(), 4);
        assert_eq!(store.level(0).unwrap().len(), 0);
        assert_eq!(store.level(1).unwrap().len(), 1);

        // Newest L0 table (highest id, added last) wins the shared key.
        let merged = &store.level(1).unwrap().sstables()[0];
        assert_eq!(merged.get(b"shared"), Some(b"from-4".to_vec()));
        for id in 1..=4u64 {
            assert_eq!(merged.get(format!("k{}", id).as_bytes()), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn test_compaction_preserves_tombstones() {
        let dir = tempdir().unwrap();
        let mut store = make_store();
        let next_id = AtomicU64::new(10);
        store.add_l0_sstable(write_l0_table(dir.path(), 1, &[(b"gone", b"v")]));
        store.add_l0_sstable(write_l0_table(
            dir.path(),
            2,
            &[(b"gone", crate::lsm::TOMBSTONE)],
        ));
        store.add_l0_sstable(write_l0_table(dir.path(), 3, &[(b"a", b"1")]));
        store.add_l0_sstable(write_l0_table(dir.path(), 4, &[(b"b", b"2")]));

        store.maybe_compact(dir.path(), &next_id).unwrap();
        let merged = &store.level(1).unwrap().sstables()[0];
        assert_eq!(merged.lookup(b"gone"), Some(crate::lsm::TOMBSTONE));
        assert_eq!(merged.get(b"gone"), None);
    }

    #[test]
    fn test_level_thresholds_scale_by_multiplier() {
        let store = LeveledStore::new(10, 10, 10, 3);
        assert_eq!(store.level_threshold(1), 10);
        assert_eq!(store.level_threshold(2), 100);
        assert_eq!(store.level_threshold(3), 1000);
    }

    #[test]
    fn test_cascading_compaction_reconciles_ids() {
        let dir = tempdir().unwrap();
        // L1 threshold small enough that the L0→L1 output immediately
        // triggers L1→L2, but large enough that the cascade stops there.
        let mut store = LeveledStore::new(50, 10, 10, 3);
        let next_id = AtomicU64::new(100);
        for id in 1..=4u64 {
            store.add_l0_sstable(write_l0_table(
                dir.path(),
                id,
                &[(format!("k{}", id).as_bytes(), b"v")],
            ));
        }

        let result = store.maybe_compact(dir.path(), &next_id).unwrap();
        assert!(result.performed);
        // The intermediate L1 table must not appear on either side.
        assert_eq!(result.added_ids, vec![101]);
        assert_eq!(result.removed_ids.len(), 4);
        assert_eq!(store.level(1).unwrap().len(), 0);
        assert_eq!(store.level(2).unwrap().len(), 1);
    }
}
