use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Page id 0 is the superblock and never handed out by allocation.
pub const SUPERBLOCK_PAGE_ID: PageId = 0;

/// Heap buffer aligned to the page size, as required for direct I/O
/// and the contiguous multi-page operations.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Allocates a zeroed buffer spanning `num_pages` pages.
    ///
    /// # Panics
    ///
    /// Panics if `num_pages` is zero.
    pub fn new(num_pages: usize) -> Self {
        assert!(num_pages > 0, "AlignedBuf must span at least one page");
        let len = num_pages * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("page-aligned layout");
        // SAFETY: layout has nonzero size; alloc failure aborts via handle_alloc_error.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        };
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE).expect("page-aligned layout");
        // SAFETY: allocated in new() with the identical layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// SAFETY: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Queued I/O operation kind for the submission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedOpKind {
    Read,
    Write,
}

#[derive(Debug)]
struct QueuedOp {
    kind: QueuedOpKind,
    page_id: PageId,
    /// Page payload for writes; reads carry no data until completion.
    page: Option<Page>,
    /// Whether the op falls inside the registered fixed-buffer span.
    fixed: bool,
}

/// In-process submission/completion queue backing the batched I/O path.
///
/// Operations are enqueued up to `depth` and drained in submission order
/// when a batch completes. A contiguous page span may be registered as a
/// fixed buffer; queued operations within the span are flagged so the
/// executor can take the pre-registered path, while pages outside it
/// transparently use the dynamic path.
struct SubmissionQueue {
    depth: usize,
    ops: VecDeque<QueuedOp>,
    fixed_span: Option<(PageId, u64)>,
}

impl SubmissionQueue {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            ops: VecDeque::with_capacity(depth),
            fixed_span: None,
        }
    }

    fn submit(&mut self, kind: QueuedOpKind, page_id: PageId, page: Option<Page>) -> Result<()> {
        if self.ops.len() >= self.depth {
            return Err(DbError::Internal("submission queue full".to_string()));
        }
        let fixed = self.contains_fixed(page_id);
        self.ops.push_back(QueuedOp {
            kind,
            page_id,
            page,
            fixed,
        });
        Ok(())
    }

    fn drain(&mut self) -> Vec<QueuedOp> {
        self.ops.drain(..).collect()
    }

    fn contains_fixed(&self, page_id: PageId) -> bool {
        match self.fixed_span {
            Some((start, count)) => page_id >= start && page_id < start + count,
            None => false,
        }
    }

    fn register_fixed(&mut self, start: PageId, count: u64) -> Result<()> {
        if self.fixed_span.is_some() {
            return Err(DbError::AlreadyExists(
                "fixed buffers already registered".to_string(),
            ));
        }
        self.fixed_span = Some((start, count));
        Ok(())
    }

    fn unregister_fixed(&mut self) {
        self.fixed_span = None;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskStats {
    pub reads: u64,
    pub writes: u64,
    pub allocations: u64,
    pub checksum_failures: u64,
    pub batch_reads: u64,
    pub batch_writes: u64,
}

struct DiskInner {
    file: File,
    num_pages: u64,
    /// True when the file is actually open with O_DIRECT; requests must
    /// then be page-aligned in offset, size, and buffer address.
    direct_io: bool,
    submission: Option<SubmissionQueue>,
}

impl DiskInner {
    fn validate_page_id(&self, page_id: PageId) -> Result<()> {
        if page_id == SUPERBLOCK_PAGE_ID {
            return Err(DbError::InvalidArgument(
                "page 0 is the reserved superblock".to_string(),
            ));
        }
        if page_id == INVALID_PAGE_ID || page_id >= self.num_pages {
            return Err(DbError::InvalidArgument(format!(
                "page id {} out of range (num_pages = {})",
                page_id, self.num_pages
            )));
        }
        Ok(())
    }

    fn check_alignment(&self, buf: &[u8]) -> Result<()> {
        if self.direct_io && (buf.as_ptr() as usize) % PAGE_SIZE != 0 {
            return Err(DbError::InvalidArgument(
                "direct I/O requires a page-aligned buffer".to_string(),
            ));
        }
        Ok(())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.direct_io && (buf.as_ptr() as usize) % PAGE_SIZE != 0 {
            // Bounce through an aligned buffer so O_DIRECT constraints hold.
            let mut bounce = AlignedBuf::new(buf.len() / PAGE_SIZE);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(bounce.as_mut_slice())?;
            buf.copy_from_slice(bounce.as_slice());
        } else {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(buf)?;
        }
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.direct_io && (buf.as_ptr() as usize) % PAGE_SIZE != 0 {
            let mut bounce = AlignedBuf::new(buf.len() / PAGE_SIZE);
            bounce.as_mut_slice().copy_from_slice(buf);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(bounce.as_slice())?;
        } else {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(buf)?;
        }
        if self.direct_io {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Single-file, page-granular block device: allocation, point and
/// batched reads/writes, contiguous multi-page transfers, and an
/// explicit durability barrier.
///
/// All public operations are safe under concurrent callers; internal
/// state sits behind one mutex. Cloning shares the same underlying file.
#[derive(Clone)]
pub struct DiskManager {
    inner: Arc<Mutex<DiskInner>>,
    path: Arc<PathBuf>,
    stats: Arc<RwLock<DiskStats>>,
}

#[cfg(target_os = "linux")]
fn open_page_file(path: &Path, direct: bool) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_page_file(path: &Path, _direct: bool) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

impl DiskManager {
    /// Opens (or creates) the page file at `path`.
    ///
    /// An empty file is initialized with the superblock: page 0 carrying
    /// the invalid-id sentinel, a zero payload, and a valid CRC. A file
    /// whose length is not a multiple of the page size is rejected as
    /// corrupt. When `direct_io` is requested the file is first opened
    /// unbuffered; on failure the manager falls back to buffered mode
    /// and records the downgrade.
    pub fn open(path: &Path, direct_io: bool, async_io: bool) -> Result<Self> {
        if path.is_dir() {
            return Err(DbError::AlreadyExists(format!(
                "{} exists and is a directory",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut direct_active = false;
        let file = if direct_io {
            match open_page_file(path, true) {
                Ok(f) => {
                    // Only Linux honors the unbuffered flag; elsewhere the
                    // open succeeds in buffered mode.
                    direct_active = cfg!(target_os = "linux");
                    if !direct_active {
                        warn!("direct I/O unsupported on this platform, using buffered mode");
                    }
                    f
                }
                Err(e) => {
                    warn!(error = %e, "direct I/O unavailable, falling back to buffered mode");
                    open_page_file(path, false)?
                }
            }
        } else {
            open_page_file(path, false)?
        };

        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(DbError::Corruption(format!(
                "page file length {} is not a multiple of {}",
                len, PAGE_SIZE
            )));
        }

        let mut inner = DiskInner {
            file,
            num_pages: len / PAGE_SIZE as u64,
            direct_io: direct_active,
            submission: if async_io {
                Some(SubmissionQueue::new(256))
            } else {
                None
            },
        };

        if inner.num_pages == 0 {
            let mut superblock = Page::new(INVALID_PAGE_ID);
            superblock.update_checksum();
            inner.write_all_at(0, superblock.as_bytes())?;
            inner.file.sync_all()?;
            inner.num_pages = 1;
            debug!(path = %path.display(), "initialized page file with superblock");
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            path: Arc::new(path.to_path_buf()),
            stats: Arc::new(RwLock::new(DiskStats::default())),
        })
    }

    /// Appends a zeroed page stamped with the new id and a valid CRC,
    /// and returns that id. The superblock id is never returned.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let page_id = inner.num_pages;
        let mut page = Page::new(page_id);
        page.update_checksum();
        inner.write_all_at(page_id * PAGE_SIZE as u64, page.as_bytes())?;
        inner.num_pages += 1;
        self.stats.write().allocations += 1;
        Ok(page_id)
    }

    /// Reads one page. The returned page has a verified checksum; a
    /// mismatch bumps the failure counter and surfaces as `Corruption`
    /// without touching the file.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut buf = [0u8; PAGE_SIZE];
        {
            let mut inner = self.inner.lock();
            inner.validate_page_id(page_id)?;
            inner.read_exact_at(page_id * PAGE_SIZE as u64, &mut buf)?;
        }
        let page = Page::from_bytes(&buf);
        if !page.verify_checksum() {
            self.stats.write().checksum_failures += 1;
            return Err(DbError::Corruption(format!(
                "checksum mismatch on page {}",
                page_id
            )));
        }
        self.stats.write().reads += 1;
        Ok(page)
    }

    /// Writes one page. The page must carry a valid CRC (stamped via
    /// `update_checksum`); handing over a stale page is a programmer
    /// error and is rejected before any byte reaches the file.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> Result<()> {
        if !page.verify_checksum() {
            return Err(DbError::InvalidArgument(format!(
                "page {} written without a valid checksum",
                page_id
            )));
        }
        let mut inner = self.inner.lock();
        inner.validate_page_id(page_id)?;
        inner.write_all_at(page_id * PAGE_SIZE as u64, page.as_bytes())?;
        if !inner.direct_io {
            inner.file.flush()?;
        }
        drop(inner);
        self.stats.write().writes += 1;
        Ok(())
    }

    /// Reads a batch of pages, equivalent to N single reads. With the
    /// submission queue enabled the requests are enqueued and drained as
    /// one batch. Partial completions are never exposed: the first
    /// failure aborts the batch.
    pub fn read_pages_batch(&self, page_ids: &[PageId]) -> Result<Vec<Page>> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let queued = {
            let mut inner = self.inner.lock();
            match inner.submission.as_mut() {
                Some(queue) => {
                    for &id in page_ids {
                        queue.submit(QueuedOpKind::Read, id, None)?;
                    }
                    // Completion is synchronous in-process; draining
                    // yields the ops back in submission order.
                    Some(queue.drain())
                }
                None => None,
            }
        };

        let mut pages = Vec::with_capacity(page_ids.len());
        match queued {
            Some(ops) => {
                let fixed = ops.iter().filter(|op| op.fixed).count();
                debug!(total = ops.len(), fixed, "draining read batch");
                for op in ops {
                    if op.kind == QueuedOpKind::Read {
                        pages.push(self.read_page(op.page_id)?);
                    }
                }
            }
            None => {
                for &id in page_ids {
                    pages.push(self.read_page(id)?);
                }
            }
        }
        self.stats.write().batch_reads += 1;
        Ok(pages)
    }

    /// Writes a batch of pages; ids come from the page headers.
    /// All-or-first-error semantics, like the read batch.
    pub fn write_pages_batch(&self, pages: &[Page]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        for page in pages {
            if !page.verify_checksum() {
                return Err(DbError::InvalidArgument(format!(
                    "page {} written without a valid checksum",
                    page.id()
                )));
            }
        }
        let queued = {
            let mut inner = self.inner.lock();
            match inner.submission.as_mut() {
                Some(queue) => {
                    for page in pages {
                        queue.submit(QueuedOpKind::Write, page.id(), Some(page.clone()))?;
                    }
                    Some(queue.drain())
                }
                None => None,
            }
        };

        match queued {
            Some(ops) => {
                let fixed = ops.iter().filter(|op| op.fixed).count();
                debug!(total = ops.len(), fixed, "draining write batch");
                for op in ops {
                    if op.kind != QueuedOpKind::Write {
                        continue;
                    }
                    if let Some(page) = op.page {
                        self.write_page(op.page_id, &page)?;
                    }
                }
            }
            None => {
                for page in pages {
                    self.write_page(page.id(), page)?;
                }
            }
        }
        self.stats.write().batch_writes += 1;
        Ok(())
    }

    /// Reads `count` adjacent pages starting at `first_id` into `buf`
    /// with a single syscall. `buf` must span exactly `count` pages and,
    /// in direct mode, be page-aligned.
    pub fn read_contiguous(&self, first_id: PageId, count: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 != count * PAGE_SIZE as u64 {
            return Err(DbError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold {} pages",
                buf.len(),
                count
            )));
        }
        let mut inner = self.inner.lock();
        inner.check_alignment(buf)?;
        inner.validate_page_id(first_id)?;
        if count == 0 || first_id + count > inner.num_pages {
            return Err(DbError::InvalidArgument(format!(
                "contiguous range [{}, {}) out of bounds",
                first_id,
                first_id + count
            )));
        }
        inner.read_exact_at(first_id * PAGE_SIZE as u64, buf)?;
        drop(inner);
        self.stats.write().reads += count;
        Ok(())
    }

    /// Writes adjacent pages from `buf` starting at `first_id` with a
    /// single syscall; `buf` must be a whole number of pages.
    pub fn write_contiguous(&self, first_id: PageId, buf: &[u8]) -> Result<()> {
        if buf.is_empty() || buf.len() % PAGE_SIZE != 0 {
            return Err(DbError::InvalidArgument(format!(
                "contiguous buffer of {} bytes is not a whole number of pages",
                buf.len()
            )));
        }
        let count = (buf.len() / PAGE_SIZE) as u64;
        let mut inner = self.inner.lock();
        inner.check_alignment(buf)?;
        inner.validate_page_id(first_id)?;
        if first_id + count > inner.num_pages {
            return Err(DbError::InvalidArgument(format!(
                "contiguous range [{}, {}) out of bounds",
                first_id,
                first_id + count
            )));
        }
        inner.write_all_at(first_id * PAGE_SIZE as u64, buf)?;
        drop(inner);
        self.stats.write().writes += count;
        Ok(())
    }

    /// Registers `[start, start + count)` as the fixed-buffer span for
    /// the submission queue. All-or-nothing; must be undone with
    /// [`unregister_fixed_buffers`](Self::unregister_fixed_buffers)
    /// before shutdown.
    pub fn register_fixed_buffers(&self, start: PageId, count: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.submission.as_mut() {
            Some(queue) => queue.register_fixed(start, count),
            None => Err(DbError::InvalidArgument(
                "fixed buffers require the async submission path".to_string(),
            )),
        }
    }

    pub fn unregister_fixed_buffers(&self) {
        if let Some(queue) = self.inner.lock().submission.as_mut() {
            queue.unregister_fixed();
        }
    }

    /// Platform durability barrier; required before declaring a set of
    /// prior writes durable.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    pub fn num_pages(&self) -> u64 {
        self.inner.lock().num_pages
    }

    pub fn is_direct(&self) -> bool {
        self.inner.lock().direct_io
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> DiskStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_manager(dir: &Path) -> DiskManager {
        DiskManager::open(&dir.join("data.db"), false, false).unwrap()
    }

    #[test]
    fn test_open_initializes_superblock() {
        let dir = tempdir().unwrap();
        let dm = open_manager(dir.path());
        assert_eq!(dm.num_pages(), 1);

        let len = std::fs::metadata(dir.path().join("data.db")).unwrap().len();
        assert_eq!(len, PAGE_SIZE as u64);
    }

    #[test]
    fn test_allocate_read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let dm = open_manager(dir.path());

        let id = dm.allocate_page().unwrap();
        assert_eq!(id, 1);

        let mut page = dm.read_page(id).unwrap();
        assert!(page.verify_checksum());
        assert_eq!(page.id(), id);

        page.payload_mut()[0] = 42;
        page.update_checksum();
        dm.write_page(id, &page).unwrap();
        dm.sync().unwrap();

        let loaded = dm.read_page(id).unwrap();
        assert_eq!(loaded.payload()[0], 42);
        assert!(loaded.verify_checksum());
    }

    #[test]
    fn test_rejects_superblock_and_out_of_range_ids() {
        let dir = tempdir().unwrap();
        let dm = open_manager(dir.path());
        dm.allocate_page().unwrap();

        let page = dm.read_page(1).unwrap();
        assert!(matches!(
            dm.read_page(0),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(
            dm.write_page(0, &page),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(
            dm.read_page(100),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_stale_checksum_on_write() {
        let dir = tempdir().unwrap();
        let dm = open_manager(dir.path());
        let id = dm.allocate_page().unwrap();

        let mut page = dm.read_page(id).unwrap();
        page.payload_mut()[0] = 9; // no update_checksum
        assert!(matches!(
            dm.write_page(id, &page),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_detects_out_of_band_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let dm = DiskManager::open(&path, false, false).unwrap();
        let id = dm.allocate_page().unwrap();

        // Scribble over the page behind the manager's back.
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(id * PAGE_SIZE as u64)).unwrap();
            f.write_all(&[0xDE; PAGE_SIZE]).unwrap();
            f.sync_all().unwrap();
        }

        assert!(matches!(dm.read_page(id), Err(DbError::Corruption(_))));
        assert_eq!(dm.stats().checksum_failures, 1);
    }

    #[test]
    fn test_rejects_misaligned_file_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 100]).unwrap();

        assert!(matches!(
            DiskManager::open(&path, false, false),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_reopen_preserves_page_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let dm = DiskManager::open(&path, false, false).unwrap();
            dm.allocate_page().unwrap();
            dm.allocate_page().unwrap();
            dm.sync().unwrap();
        }
        let dm = DiskManager::open(&path, false, false).unwrap();
        assert_eq!(dm.num_pages(), 3);
    }

    #[test]
    fn test_contiguous_roundtrip() {
        let dir = tempdir().unwrap();
        let dm = open_manager(dir.path());
        let first = dm.allocate_page().unwrap();
        for _ in 0..3 {
            dm.allocate_page().unwrap();
        }

        let mut out = AlignedBuf::new(4);
        for (i, chunk) in out.as_mut_slice().chunks_mut(PAGE_SIZE).enumerate() {
            let mut page = Page::new(first + i as u64);
            page.payload_mut()[0] = i as u8 + 1;
            page.update_checksum();
            chunk.copy_from_slice(page.as_bytes());
        }
        dm.write_contiguous(first, out.as_slice()).unwrap();

        let mut back = AlignedBuf::new(4);
        dm.read_contiguous(first, 4, back.as_mut_slice()).unwrap();
        assert_eq!(back.as_slice(), out.as_slice());
    }

    #[test]
    fn test_batch_roundtrip_through_submission_queue() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(&dir.path().join("data.db"), false, true).unwrap();

        let mut pages = Vec::new();
        for i in 0..8u8 {
            let id = dm.allocate_page().unwrap();
            let mut page = Page::new(id);
            page.payload_mut()[0] = i;
            page.update_checksum();
            pages.push(page);
        }

        dm.register_fixed_buffers(1, 4).unwrap();
        dm.write_pages_batch(&pages).unwrap();

        let ids: Vec<PageId> = pages.iter().map(|p| p.id()).collect();
        let loaded = dm.read_pages_batch(&ids).unwrap();
        for (i, page) in loaded.iter().enumerate() {
            assert_eq!(page.payload()[0], i as u8);
        }
        dm.unregister_fixed_buffers();

        let stats = dm.stats();
        assert_eq!(stats.batch_reads, 1);
        assert_eq!(stats.batch_writes, 1);
    }
}
