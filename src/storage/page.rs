use crc32fast::Hasher as Crc32;

pub type PageId = u64;

/// Reserved id stamped into pages that do not belong to any caller:
/// the superblock and freshly reset frames.
pub const INVALID_PAGE_ID: PageId = u64::MAX;

/// Total size of one page on disk and in memory.
pub const PAGE_SIZE: usize = 4096;
/// Size of the fixed page header; the payload occupies the remainder.
pub const PAGE_HEADER_SIZE: usize = 64;
/// Usable payload bytes per page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

// Header field offsets. The layout is part of the on-disk format; any
// change here is a format-breaking migration.
const OFFSET_PAGE_ID: usize = 0;
const OFFSET_LSN: usize = 8;
const OFFSET_PIN_COUNT: usize = 16;
const OFFSET_DIRTY: usize = 20;
const OFFSET_CRC: usize = 24;

/// A self-describing 4 KiB frame: 64-byte header followed by 4032
/// payload bytes.
///
/// The CRC32 covers bytes `[8, 4096)` with the CRC field itself hashed
/// as zeros, so re-stamping the page id never invalidates content.
/// [`verify_checksum`](Page::verify_checksum) is the only trusted
/// integrity test after a read, and a page may only be written to disk
/// after [`update_checksum`](Page::update_checksum).
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        let mut page = Self {
            data: Box::new([0u8; PAGE_SIZE]),
        };
        page.set_id(id);
        page
    }

    /// Builds a page from raw bytes read off disk. No validation is
    /// performed here; callers must `verify_checksum` afterwards.
    pub fn from_bytes(data: &[u8]) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut boxed = Box::new([0u8; PAGE_SIZE]);
        boxed.copy_from_slice(data);
        Self { data: boxed }
    }

    /// Zeroes the payload and bookkeeping fields and stamps `id`.
    pub fn reset(&mut self, id: PageId) {
        self.data.fill(0);
        self.set_id(id);
    }

    pub fn id(&self) -> PageId {
        u64::from_le_bytes(self.data[OFFSET_PAGE_ID..OFFSET_PAGE_ID + 8].try_into().unwrap())
    }

    pub fn set_id(&mut self, id: PageId) {
        self.data[OFFSET_PAGE_ID..OFFSET_PAGE_ID + 8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.data[OFFSET_LSN..OFFSET_LSN + 8].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[OFFSET_LSN..OFFSET_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn pin_count(&self) -> u32 {
        u32::from_le_bytes(self.data[OFFSET_PIN_COUNT..OFFSET_PIN_COUNT + 4].try_into().unwrap())
    }

    fn set_pin_count(&mut self, count: u32) {
        self.data[OFFSET_PIN_COUNT..OFFSET_PIN_COUNT + 4].copy_from_slice(&count.to_le_bytes());
    }

    pub fn increment_pin_count(&mut self) {
        self.set_pin_count(self.pin_count() + 1);
    }

    /// Saturates at zero; pin count never goes negative at rest.
    pub fn decrement_pin_count(&mut self) {
        self.set_pin_count(self.pin_count().saturating_sub(1));
    }

    /// Drops any persisted pin count after a load from disk; a freshly
    /// cached page starts unpinned.
    pub(crate) fn reset_pin_count(&mut self) {
        self.set_pin_count(0);
    }

    pub fn is_dirty(&self) -> bool {
        self.data[OFFSET_DIRTY] != 0
    }

    pub fn mark_dirty(&mut self) {
        self.data[OFFSET_DIRTY] = 1;
    }

    pub fn clear_dirty(&mut self) {
        self.data[OFFSET_DIRTY] = 0;
    }

    fn stored_crc(&self) -> u32 {
        u32::from_le_bytes(self.data[OFFSET_CRC..OFFSET_CRC + 4].try_into().unwrap())
    }

    /// CRC over `[8, PAGE_SIZE)` with the CRC field hashed as zeros.
    fn compute_crc(&self) -> u32 {
        let mut hasher = Crc32::new();
        hasher.update(&self.data[OFFSET_LSN..OFFSET_CRC]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[OFFSET_CRC + 4..]);
        hasher.finalize()
    }

    pub fn update_checksum(&mut self) {
        let crc = self.compute_crc();
        self.data[OFFSET_CRC..OFFSET_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn verify_checksum(&self) -> bool {
        self.stored_crc() == self.compute_crc()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Raw page bytes, header included, as laid out on disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("lsn", &self.lsn())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(1);
        assert_eq!(page.id(), 1);
        assert_eq!(page.payload().len(), PAGE_PAYLOAD_SIZE);
        assert!(!page.is_dirty());
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut page = Page::new(7);
        page.payload_mut()[0..5].copy_from_slice(b"hello");
        page.update_checksum();
        assert!(page.verify_checksum());

        // Flipping a payload byte must break verification.
        page.payload_mut()[0] ^= 0xFF;
        assert!(!page.verify_checksum());
    }

    #[test]
    fn test_id_restamp_keeps_checksum_valid() {
        let mut page = Page::new(3);
        page.payload_mut()[0] = 42;
        page.update_checksum();

        page.set_id(99);
        assert!(page.verify_checksum());
        assert_eq!(page.id(), 99);
    }

    #[test]
    fn test_pin_count_floor() {
        let mut page = Page::new(1);
        page.decrement_pin_count();
        assert_eq!(page.pin_count(), 0);
        page.increment_pin_count();
        page.increment_pin_count();
        assert_eq!(page.pin_count(), 2);
    }

    #[test]
    fn test_reset_clears_payload_and_flags() {
        let mut page = Page::new(5);
        page.payload_mut()[10] = 0xAB;
        page.mark_dirty();
        page.set_lsn(77);

        page.reset(6);
        assert_eq!(page.id(), 6);
        assert_eq!(page.lsn(), 0);
        assert!(!page.is_dirty());
        assert!(page.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_bytes_preserves_contents() {
        let mut page = Page::new(11);
        page.payload_mut()[0..4].copy_from_slice(b"vekt");
        page.update_checksum();

        let copy = Page::from_bytes(page.as_bytes());
        assert!(copy.verify_checksum());
        assert_eq!(copy.id(), 11);
        assert_eq!(&copy.payload()[0..4], b"vekt");
    }
}
