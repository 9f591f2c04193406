use parking_lot::Mutex;
use std::collections::VecDeque;

pub type FrameId = usize;

struct FrameEntry {
    /// The k most recent access timestamps, oldest first.
    history: VecDeque<u64>,
    /// Total accesses recorded, which may exceed the retained history.
    accesses: u64,
    evictable: bool,
}

impl FrameEntry {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            accesses: 0,
            evictable: false,
        }
    }
}

struct ReplacerInner {
    clock: u64,
    entries: Vec<FrameEntry>,
}

/// LRU-K replacement policy over a fixed set of frames.
///
/// Victim selection maximizes backward k-distance: the elapsed time
/// between now and the k-th most recent access. Frames with fewer than
/// k recorded accesses have infinite distance and are evicted first,
/// oldest first access winning among them; remaining ties fall to the
/// lowest frame index, so selection is deterministic.
///
/// The replacer knows nothing about page ids — only frame indices.
/// `record_access` is O(1); `evict` is O(frames), acceptable because
/// the frame count is the pool size.
pub struct LruKReplacer {
    k: usize,
    inner: Mutex<ReplacerInner>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be at least 1");
        let entries = (0..num_frames).map(|_| FrameEntry::new(k)).collect();
        Self {
            k,
            inner: Mutex::new(ReplacerInner { clock: 0, entries }),
        }
    }

    pub fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let ts = inner.clock;
        inner.clock += 1;
        let entry = &mut inner.entries[frame_id];
        entry.accesses += 1;
        entry.history.push_back(ts);
        if entry.history.len() > self.k {
            entry.history.pop_front();
        }
    }

    /// Marks the frame non-evictable (its pin count went above zero).
    pub fn pin(&self, frame_id: FrameId) {
        self.inner.lock().entries[frame_id].evictable = false;
    }

    /// Marks the frame evictable (its pin count reached zero).
    pub fn unpin(&self, frame_id: FrameId) {
        self.inner.lock().entries[frame_id].evictable = true;
    }

    /// Selects and claims a victim. The chosen frame is marked
    /// non-evictable and its history is cleared before returning.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        let mut victim: Option<FrameId> = None;
        let mut victim_infinite = false;
        // For infinite-distance frames this is the earliest access
        // timestamp; for finite ones, the k-th most recent timestamp.
        // Lower wins in both regimes.
        let mut victim_key = u64::MAX;

        for (idx, entry) in inner.entries.iter().enumerate() {
            if !entry.evictable {
                continue;
            }
            let infinite = entry.accesses < self.k as u64;
            let key = if infinite {
                entry.history.front().copied().unwrap_or(0)
            } else {
                entry.history[entry.history.len() - self.k]
            };
            let better = match victim {
                None => true,
                Some(_) => {
                    if infinite != victim_infinite {
                        infinite
                    } else {
                        key < victim_key
                    }
                }
            };
            if better {
                victim = Some(idx);
                victim_infinite = infinite;
                victim_key = key;
            }
        }

        if let Some(idx) = victim {
            let entry = &mut inner.entries[idx];
            entry.evictable = false;
            entry.history.clear();
            entry.accesses = 0;
        }
        victim
    }

    /// Forgets a frame's history entirely (the frame went back to the
    /// free list).
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame_id];
        entry.evictable = false;
        entry.history.clear();
        entry.accesses = 0;
    }

    /// Number of frames currently eligible for eviction.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.evictable).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fewer_than_k_accesses_evicted_first() {
        let replacer = LruKReplacer::new(4, 2);

        // Frame 0 gets two accesses (finite distance), frame 1 one.
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.unpin(0);
        replacer.unpin(1);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_backward_k_distance_ordering() {
        let replacer = LruKReplacer::new(3, 2);

        // Access pattern: 0,0 then 1,1 then 2,2. Frame 0 has the
        // oldest second-most-recent access and must go first.
        for frame in 0..3 {
            replacer.record_access(frame);
            replacer.record_access(frame);
            replacer.unpin(frame);
        }

        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let replacer = LruKReplacer::new(2, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.unpin(0);
        replacer.unpin(1);
        replacer.pin(0);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.unpin(0);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_size_counts_evictable_frames() {
        let replacer = LruKReplacer::new(5, 2);
        assert_eq!(replacer.size(), 0);
        replacer.unpin(1);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
        replacer.pin(1);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_untouched_frames_tie_break_by_index() {
        let replacer = LruKReplacer::new(3, 2);
        replacer.unpin(2);
        replacer.unpin(1);
        assert_eq!(replacer.evict(), Some(1));
    }
}
