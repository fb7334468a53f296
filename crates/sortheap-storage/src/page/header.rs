//! Page header format.
//!
//! Every formatted block starts with a 48-byte header.
//!
//! # Header Layout (48 bytes, little endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   magic (0x5348 = "SH")
//!   2       1   block_type
//!   3       1   format version
//!   4       8   block_id
//!  12       8   lsn of the last applied log record
//!  20       4   checksum (CRC32 of the page, excluding this field)
//!  24       2   flags (reserved, zero)
//!  26       2   slot_count
//!  28       2   free_offset (end of the slot array)
//!  30       2   free_end (start of record data)
//!  32       8   next block in the page's chain
//!  40       8   previous block in the page's chain
//! ```

use bytes::{Buf, BufMut};
use sortheap_common::constants::{PAGE_FORMAT_VERSION, PAGE_HEADER_SIZE, PAGE_MAGIC};
use sortheap_common::types::{BlockId, BlockType, Lsn};

pub(crate) const MAGIC_OFFSET: usize = 0;
pub(crate) const BLOCK_TYPE_OFFSET: usize = 2;
pub(crate) const VERSION_OFFSET: usize = 3;
pub(crate) const BLOCK_ID_OFFSET: usize = 4;
pub(crate) const LSN_OFFSET: usize = 12;
pub(crate) const CHECKSUM_OFFSET: usize = 20;
pub(crate) const FLAGS_OFFSET: usize = 24;
pub(crate) const SLOT_COUNT_OFFSET: usize = 26;
pub(crate) const FREE_OFFSET_OFFSET: usize = 28;
pub(crate) const FREE_END_OFFSET: usize = 30;
pub(crate) const NEXT_OFFSET: usize = 32;
pub(crate) const PREV_OFFSET: usize = 40;

/// View over the header of a page buffer.
///
/// Getters work on any `AsRef<[u8]>` buffer; setters need `AsMut<[u8]>`.
///
/// # Example
///
/// ```rust
/// use sortheap_common::types::{BlockId, BlockType};
/// use sortheap_storage::page::PageHeader;
///
/// let mut buffer = vec![0u8; 4096];
/// PageHeader::new(&mut buffer[..]).initialize(BlockId::new(7), BlockType::Data);
///
/// let header = PageHeader::new(&buffer[..]);
/// assert_eq!(header.block_id(), BlockId::new(7));
/// assert_eq!(header.block_type(), Some(BlockType::Data));
/// ```
#[derive(Debug)]
pub struct PageHeader<B> {
    data: B,
}

impl<B: AsRef<[u8]>> PageHeader<B> {
    /// Creates a header view.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than the header.
    #[inline]
    pub fn new(data: B) -> Self {
        assert!(
            data.as_ref().len() >= PAGE_HEADER_SIZE,
            "buffer too small for page header"
        );
        Self { data }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Size of the underlying page.
    #[inline]
    pub fn page_len(&self) -> usize {
        self.bytes().len()
    }

    // =========================================================================
    // Magic / type / version (offsets 0..4)
    // =========================================================================

    /// Returns the magic bytes.
    #[inline]
    pub fn magic(&self) -> u16 {
        (&self.bytes()[MAGIC_OFFSET..]).get_u16_le()
    }

    /// Returns true if the magic bytes match.
    #[inline]
    pub fn is_valid_magic(&self) -> bool {
        self.magic() == PAGE_MAGIC
    }

    /// Returns the block type, or `None` for an unknown tag.
    #[inline]
    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u8(self.bytes()[BLOCK_TYPE_OFFSET])
    }

    /// Returns the page format version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.bytes()[VERSION_OFFSET]
    }

    // =========================================================================
    // Block ID (offset 4, 8 bytes)
    // =========================================================================

    /// Returns the block id written at format time.
    #[inline]
    pub fn block_id(&self) -> BlockId {
        BlockId::new((&self.bytes()[BLOCK_ID_OFFSET..]).get_u64_le())
    }

    // =========================================================================
    // LSN (offset 12, 8 bytes)
    // =========================================================================

    /// Returns the LSN of the last log record applied to this page.
    #[inline]
    pub fn lsn(&self) -> Lsn {
        Lsn::new((&self.bytes()[LSN_OFFSET..]).get_u64_le())
    }

    // =========================================================================
    // Checksum (offset 20, 4 bytes)
    // =========================================================================

    /// Returns the stored checksum.
    #[inline]
    pub fn checksum(&self) -> u32 {
        (&self.bytes()[CHECKSUM_OFFSET..]).get_u32_le()
    }

    // =========================================================================
    // Flags (offset 24, 2 bytes)
    // =========================================================================

    /// Returns the raw flags field.
    #[inline]
    pub fn flags(&self) -> u16 {
        (&self.bytes()[FLAGS_OFFSET..]).get_u16_le()
    }

    // =========================================================================
    // Slot area (offsets 26..32)
    // =========================================================================

    /// Returns the number of slots.
    #[inline]
    pub fn slot_count(&self) -> u16 {
        (&self.bytes()[SLOT_COUNT_OFFSET..]).get_u16_le()
    }

    /// Returns the offset where the slot array ends.
    #[inline]
    pub fn free_offset(&self) -> u16 {
        (&self.bytes()[FREE_OFFSET_OFFSET..]).get_u16_le()
    }

    /// Returns the offset where record data begins.
    #[inline]
    pub fn free_end(&self) -> u16 {
        (&self.bytes()[FREE_END_OFFSET..]).get_u16_le()
    }

    /// Bytes available between the slot array and record data.
    #[inline]
    pub fn free_space(&self) -> usize {
        usize::from(self.free_end()).saturating_sub(usize::from(self.free_offset()))
    }

    // =========================================================================
    // Chain pointers (offsets 32..48)
    // =========================================================================

    /// Returns the next block in this page's chain.
    #[inline]
    pub fn next(&self) -> BlockId {
        BlockId::new((&self.bytes()[NEXT_OFFSET..]).get_u64_le())
    }

    /// Returns the previous block in this page's chain.
    #[inline]
    pub fn prev(&self) -> BlockId {
        BlockId::new((&self.bytes()[PREV_OFFSET..]).get_u64_le())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PageHeader<B> {
    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Zeroes the whole page and writes a fresh header.
    pub fn initialize(&mut self, block: BlockId, block_type: BlockType) {
        let len = self.page_len();
        self.bytes_mut().fill(0);
        (&mut self.bytes_mut()[MAGIC_OFFSET..]).put_u16_le(PAGE_MAGIC);
        self.bytes_mut()[BLOCK_TYPE_OFFSET] = block_type.as_u8();
        self.bytes_mut()[VERSION_OFFSET] = PAGE_FORMAT_VERSION;
        (&mut self.bytes_mut()[BLOCK_ID_OFFSET..]).put_u64_le(block.as_u64());
        self.set_slot_count(0);
        self.set_free_offset(PAGE_HEADER_SIZE as u16);
        // Block sizes are capped at 32 KiB, which fits in u16.
        self.set_free_end(len as u16);
        self.set_next(BlockId::INVALID);
        self.set_prev(BlockId::INVALID);
    }

    /// Sets the page LSN.
    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        (&mut self.bytes_mut()[LSN_OFFSET..]).put_u64_le(lsn.as_u64());
    }

    /// Sets the stored checksum.
    #[inline]
    pub fn set_checksum(&mut self, checksum: u32) {
        (&mut self.bytes_mut()[CHECKSUM_OFFSET..]).put_u32_le(checksum);
    }

    /// Sets the slot count.
    #[inline]
    pub fn set_slot_count(&mut self, count: u16) {
        (&mut self.bytes_mut()[SLOT_COUNT_OFFSET..]).put_u16_le(count);
    }

    /// Sets the end of the slot array.
    #[inline]
    pub fn set_free_offset(&mut self, offset: u16) {
        (&mut self.bytes_mut()[FREE_OFFSET_OFFSET..]).put_u16_le(offset);
    }

    /// Sets the start of record data.
    #[inline]
    pub fn set_free_end(&mut self, offset: u16) {
        (&mut self.bytes_mut()[FREE_END_OFFSET..]).put_u16_le(offset);
    }

    /// Sets the next block.
    #[inline]
    pub fn set_next(&mut self, next: BlockId) {
        (&mut self.bytes_mut()[NEXT_OFFSET..]).put_u64_le(next.as_u64());
    }

    /// Sets the previous block.
    #[inline]
    pub fn set_prev(&mut self, prev: BlockId) {
        (&mut self.bytes_mut()[PREV_OFFSET..]).put_u64_le(prev.as_u64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize() {
        let mut page = vec![0xAAu8; 8192];
        PageHeader::new(&mut page[..]).initialize(BlockId::new(12), BlockType::RunIndex);

        let header = PageHeader::new(&page[..]);
        assert!(header.is_valid_magic());
        assert_eq!(header.block_type(), Some(BlockType::RunIndex));
        assert_eq!(header.version(), PAGE_FORMAT_VERSION);
        assert_eq!(header.block_id(), BlockId::new(12));
        assert_eq!(header.lsn(), Lsn::INVALID);
        assert_eq!(header.slot_count(), 0);
        assert_eq!(header.free_offset() as usize, PAGE_HEADER_SIZE);
        assert_eq!(header.free_end() as usize, 8192);
        assert_eq!(header.free_space(), 8192 - PAGE_HEADER_SIZE);
        assert_eq!(header.next(), BlockId::INVALID);
        assert_eq!(header.prev(), BlockId::INVALID);
        assert!(page[PAGE_HEADER_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_field_offsets() {
        let mut page = vec![0u8; 4096];
        let mut header = PageHeader::new(&mut page[..]);
        header.initialize(BlockId::new(1), BlockType::Data);
        header.set_lsn(Lsn::new(0x0102_0304_0506_0708));
        header.set_next(BlockId::new(99));
        header.set_prev(BlockId::new(98));

        assert_eq!(page[LSN_OFFSET], 0x08);
        assert_eq!(page[NEXT_OFFSET], 99);
        assert_eq!(page[PREV_OFFSET], 98);
        assert_eq!(page[BLOCK_TYPE_OFFSET], BlockType::Data.as_u8());
    }
}
