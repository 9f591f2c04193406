use crate::lsm::TOMBSTONE;
use parking_lot::Mutex;
use std::collections::BTreeMap;

struct MemTableInner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    approx_bytes: usize,
}

/// In-memory sorted write buffer. Newest write wins; deletes store the
/// tombstone sentinel so they shadow older on-disk versions until
/// compaction reclaims them.
///
/// Every method holds the single mutex for its duration, so each call
/// is atomic. The approximate byte size is Σ(len(key) + len(value)),
/// maintained incrementally: an overwrite only contributes the change
/// in value size.
pub struct MemTable {
    inner: Mutex<MemTableInner>,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemTableInner {
                map: BTreeMap::new(),
                approx_bytes: 0,
            }),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock();
        match inner.map.insert(key.to_vec(), value.to_vec()) {
            Some(old) => {
                inner.approx_bytes = inner.approx_bytes + value.len() - old.len();
            }
            None => {
                inner.approx_bytes += key.len() + value.len();
            }
        }
    }

    /// Records a delete as a tombstone entry.
    pub fn delete(&self, key: &[u8]) {
        self.put(key, TOMBSTONE);
    }

    /// Point lookup with tombstones masked: a deleted key reads as
    /// absent.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        match inner.map.get(key) {
            Some(value) if value == TOMBSTONE => None,
            Some(value) => Some(value.clone()),
            None => None,
        }
    }

    /// Raw lookup preserving the tombstone sentinel. The read path
    /// needs to distinguish "deleted here" from "never seen" so it can
    /// stop searching older tables.
    pub(crate) fn entry(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().map.get(key).cloned()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn approximate_size_bytes(&self) -> usize {
        self.inner.lock().approx_bytes
    }

    /// Sorted snapshot of all entries, tombstones included.
    pub fn get_all_sorted(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.approx_bytes = 0;
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let mem = MemTable::new();
        mem.put(b"k", b"v1");
        assert_eq!(mem.get(b"k"), Some(b"v1".to_vec()));
        mem.put(b"k", b"v2");
        assert_eq!(mem.get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_delete_masks_value_but_keeps_entry() {
        let mem = MemTable::new();
        mem.put(b"k", b"v");
        mem.delete(b"k");
        assert_eq!(mem.get(b"k"), None);
        assert_eq!(mem.entry(b"k"), Some(TOMBSTONE.to_vec()));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_size_accounting() {
        let mem = MemTable::new();
        mem.put(b"abc", b"12345");
        assert_eq!(mem.approximate_size_bytes(), 8);

        // Overwrite counts only the value delta.
        mem.put(b"abc", b"12");
        assert_eq!(mem.approximate_size_bytes(), 5);

        mem.put(b"x", b"y");
        assert_eq!(mem.approximate_size_bytes(), 7);

        mem.clear();
        assert_eq!(mem.approximate_size_bytes(), 0);
        assert_eq!(mem.len(), 0);
    }

    #[test]
    fn test_get_all_sorted_is_ordered() {
        let mem = MemTable::new();
        mem.put(b"charlie", b"3");
        mem.put(b"alpha", b"1");
        mem.put(b"bravo", b"2");

        let all = mem.get_all_sorted();
        let keys: Vec<&[u8]> = all.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"alpha".as_slice(), b"bravo", b"charlie"]);
    }
}
