use crate::buffer::eviction::{FrameId, LruKReplacer};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageId, INVALID_PAGE_ID};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Shared handle to a cached page. Callers mutate the payload through
/// the lock and must pair every fetch with an
/// [`unpin_page`](BufferPoolManager::unpin_page).
pub type PageRef = Arc<RwLock<Page>>;

/// Number of access timestamps the replacer retains per frame.
const REPLACER_K: usize = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

impl BufferPoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
}

/// Fixed pool of page frames caching disk pages with pin-count safety.
///
/// One reader/writer lock guards the page table and free list; the miss
/// path of [`fetch_page`](Self::fetch_page) and
/// [`new_page`](Self::new_page) takes it exclusively, while unpin and
/// flush only read it because they mutate per-frame state already
/// selected by id. Pin count and dirty flag live in the page header
/// behind each frame's own lock.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PageRef>,
    state: RwLock<PoolState>,
    replacer: LruKReplacer,
    disk: DiskManager,
    stats: RwLock<BufferPoolStats>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: DiskManager) -> Self {
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))))
            .collect();
        // Hand out low frame indices first.
        let free_list: Vec<FrameId> = (0..pool_size).rev().collect();

        Self {
            pool_size,
            frames,
            state: RwLock::new(PoolState {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruKReplacer::new(pool_size, REPLACER_K),
            disk,
            stats: RwLock::new(BufferPoolStats::default()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetches a page, loading it from disk on a miss. Returns `None`
    /// when every frame is pinned, when the disk read fails, or when
    /// the loaded page fails checksum verification (in which case the
    /// frame goes back to the free list and the on-disk page is left
    /// untouched).
    pub fn fetch_page(&self, page_id: PageId) -> Option<PageRef> {
        // Hit path under the shared lock.
        {
            let state = self.state.read();
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                let frame = &self.frames[frame_id];
                frame.write().increment_pin_count();
                self.replacer.record_access(frame_id);
                self.replacer.pin(frame_id);
                self.stats.write().hits += 1;
                return Some(Arc::clone(frame));
            }
        }

        let mut state = self.state.write();
        // Re-check: another thread may have loaded it meanwhile.
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            frame.write().increment_pin_count();
            self.replacer.record_access(frame_id);
            self.replacer.pin(frame_id);
            self.stats.write().hits += 1;
            return Some(Arc::clone(frame));
        }

        let frame_id = self.acquire_frame(&mut state)?;

        let loaded = match self.disk.read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                warn!(page_id, error = %e, "page load failed");
                state.free_list.push(frame_id);
                return None;
            }
        };

        {
            let mut frame = self.frames[frame_id].write();
            *frame = loaded;
            frame.reset_pin_count();
            frame.clear_dirty();
            frame.increment_pin_count();
        }
        state.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.pin(frame_id);
        self.stats.write().misses += 1;

        Some(Arc::clone(&self.frames[frame_id]))
    }

    /// Allocates a fresh page on disk and caches it pinned and dirty.
    /// The caller must unpin with `is_dirty = true` for the contents to
    /// be persisted eventually.
    pub fn new_page(&self) -> Option<(PageId, PageRef)> {
        let mut state = self.state.write();
        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = match self.disk.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "page allocation failed");
                state.free_list.push(frame_id);
                return None;
            }
        };

        {
            let mut frame = self.frames[frame_id].write();
            frame.reset(page_id);
            frame.mark_dirty();
            frame.update_checksum();
            frame.increment_pin_count();
        }
        state.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.pin(frame_id);

        Some((page_id, Arc::clone(&self.frames[frame_id])))
    }

    /// Picks a frame from the free list, or evicts one, writing back
    /// dirty contents first. Must run under the exclusive state lock.
    fn acquire_frame(&self, state: &mut PoolState) -> Option<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Some(frame_id);
        }

        let frame_id = self.replacer.evict()?;
        let old_page_id = {
            let mut frame = self.frames[frame_id].write();
            let old_id = frame.id();
            if frame.is_dirty() {
                frame.update_checksum();
                if let Err(e) = self.disk.write_page(old_id, &frame) {
                    warn!(page_id = old_id, error = %e, "eviction writeback failed");
                    // Keep the mapping; the frame still holds the only
                    // up-to-date copy of the page.
                    self.replacer.unpin(frame_id);
                    return None;
                }
                frame.clear_dirty();
            }
            old_id
        };
        state.page_table.remove(&old_page_id);
        self.stats.write().evictions += 1;
        Some(frame_id)
    }

    /// Releases one pin and merges the dirty bit. Returns `false` when
    /// the page is not resident or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.read();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let mut frame = self.frames[frame_id].write();
        if frame.pin_count() == 0 {
            return false;
        }
        frame.decrement_pin_count();
        if is_dirty {
            frame.mark_dirty();
        }
        if frame.pin_count() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Writes a resident dirty page back to disk; a clean page is a
    /// no-op. Returns `false` on a miss or disk failure.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let state = self.state.read();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let mut frame = self.frames[frame_id].write();
        if !frame.is_dirty() {
            return true;
        }
        frame.update_checksum();
        if let Err(e) = self.disk.write_page(page_id, &frame) {
            warn!(page_id, error = %e, "flush failed");
            return false;
        }
        frame.clear_dirty();
        self.stats.write().flushes += 1;
        true
    }

    /// Flushes every resident dirty page, then issues a durability
    /// barrier. Used by checkpoint and clean shutdown.
    pub fn flush_all_pages(&self) -> bool {
        let resident: Vec<PageId> = {
            let state = self.state.read();
            state.page_table.keys().copied().collect()
        };
        let mut ok = true;
        for page_id in resident {
            ok &= self.flush_page(page_id);
        }
        ok &= self.disk.sync().is_ok();
        ok
    }

    /// Drops a non-pinned page from the pool. Disk space is not
    /// reclaimed; the file grows append-only.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.write();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return true;
        };
        {
            let mut frame = self.frames[frame_id].write();
            if frame.pin_count() > 0 {
                return false;
            }
            frame.reset(INVALID_PAGE_ID);
        }
        state.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        state.free_list.push(frame_id);
        true
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.stats.read().clone()
    }
}
