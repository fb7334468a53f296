//! Slotted page format for variable-length records.
//!
//! # Page Layout
//!
//! ```text
//! +----------------------+
//! |    Page Header       |  48 bytes (see header.rs)
//! +----------------------+
//! |    Slot Array        |  4 bytes per slot, grows toward the end
//! |      [slot 0]        |  offset: 2 bytes, length: 2 bytes
//! |      [slot 1]        |
//! |        ...           |
//! +----------------------+
//! |    Free Space        |
//! +----------------------+
//! |    Record Data       |  grows toward the header
//! |     [record 1]       |
//! |     [record 0]       |
//! +----------------------+
//! ```
//!
//! Records are only ever appended, overwritten in place with the same
//! length, or truncated from the tail. Because records are appended in slot
//! order, the lowest record offset always belongs to the last slot, so
//! truncation can return the tail space without compaction.

use bytes::{Buf, BufMut};
use sortheap_common::constants::{PAGE_HEADER_SIZE, SLOT_SIZE};
use sortheap_common::types::BlockId;

use super::header::PageHeader;
use crate::error::{StorageError, StorageResult};

/// Largest record a slotted page of `block_size` bytes can hold.
#[inline]
pub const fn max_record_size(block_size: usize) -> usize {
    block_size - PAGE_HEADER_SIZE - SLOT_SIZE
}

/// A view over a slotted page.
#[derive(Debug)]
pub struct SlottedPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Creates a view over a formatted page.
    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn header(&self) -> PageHeader<&[u8]> {
        PageHeader::new(self.data.as_ref())
    }

    /// Block id from the header.
    pub fn block_id(&self) -> BlockId {
        self.header().block_id()
    }

    /// Number of records.
    pub fn slot_count(&self) -> u16 {
        self.header().slot_count()
    }

    /// Bytes available for new records, slot overhead excluded.
    pub fn free_space(&self) -> usize {
        self.header().free_space().saturating_sub(SLOT_SIZE)
    }

    /// Returns true if a record of `len` bytes fits.
    pub fn fits(&self, len: usize) -> bool {
        len <= self.free_space()
    }

    fn slot(&self, slot: u16) -> (usize, usize) {
        let at = PAGE_HEADER_SIZE + usize::from(slot) * SLOT_SIZE;
        let mut buf = &self.data.as_ref()[at..at + SLOT_SIZE];
        let offset = buf.get_u16_le();
        let len = buf.get_u16_le();
        (usize::from(offset), usize::from(len))
    }

    /// Returns the record in `slot`, or `None` past the end.
    pub fn get(&self, slot: u16) -> Option<&[u8]> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, len) = self.slot(slot);
        self.data.as_ref().get(offset..offset + len)
    }

    /// Returns the record in `slot` or a corruption error.
    pub fn record(&self, slot: u16) -> StorageResult<&[u8]> {
        self.get(slot).ok_or(StorageError::SlotOutOfRange {
            block: self.block_id(),
            slot,
        })
    }

    /// Iterates over all records in slot order.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.slot_count()).filter_map(move |slot| self.get(slot))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    fn header_mut(&mut self) -> PageHeader<&mut [u8]> {
        PageHeader::new(self.data.as_mut())
    }

    /// Appends a record and returns its slot.
    pub fn append(&mut self, record: &[u8]) -> StorageResult<u16> {
        let block = self.block_id();
        let page_len = self.data.as_ref().len();
        if record.len() > max_record_size(page_len) {
            return Err(StorageError::RowTooLarge {
                size: record.len(),
                max_size: max_record_size(page_len),
            });
        }
        if !self.fits(record.len()) {
            return Err(StorageError::PageFull {
                block,
                needed: record.len() + SLOT_SIZE,
            });
        }

        let slot = self.slot_count();
        let free_offset = usize::from(self.header().free_offset());
        let free_end = usize::from(self.header().free_end());
        let offset = free_end - record.len();

        let data = self.data.as_mut();
        data[offset..free_end].copy_from_slice(record);
        let mut entry = &mut data[free_offset..free_offset + SLOT_SIZE];
        entry.put_u16_le(offset as u16);
        entry.put_u16_le(record.len() as u16);

        let mut header = self.header_mut();
        header.set_slot_count(slot + 1);
        header.set_free_offset((free_offset + SLOT_SIZE) as u16);
        header.set_free_end(offset as u16);
        Ok(slot)
    }

    /// Replaces a record with one of the same length.
    pub fn overwrite(&mut self, slot: u16, record: &[u8]) -> StorageResult<()> {
        let block = self.block_id();
        if slot >= self.slot_count() {
            return Err(StorageError::SlotOutOfRange { block, slot });
        }
        let (offset, len) = self.slot(slot);
        if len != record.len() {
            return Err(StorageError::corrupted(
                block,
                format!(
                    "overwrite of slot {slot} with {} bytes, record has {len}",
                    record.len()
                ),
            ));
        }
        self.data.as_mut()[offset..offset + len].copy_from_slice(record);
        Ok(())
    }

    /// Drops every slot at or after `keep`.
    pub fn truncate(&mut self, keep: u16) -> StorageResult<()> {
        let count = self.slot_count();
        if keep >= count {
            return Ok(());
        }
        let page_len = self.data.as_ref().len();
        let free_end = if keep == 0 {
            page_len
        } else {
            self.slot(keep - 1).0
        };

        let start = PAGE_HEADER_SIZE + usize::from(keep) * SLOT_SIZE;
        let old_free_end = usize::from(self.header().free_end());
        let data = self.data.as_mut();
        data[start..PAGE_HEADER_SIZE + usize::from(count) * SLOT_SIZE].fill(0);
        data[old_free_end..free_end].fill(0);

        let mut header = self.header_mut();
        header.set_slot_count(keep);
        header.set_free_offset(start as u16);
        header.set_free_end(free_end as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortheap_common::types::BlockType;

    fn page(size: usize) -> Vec<u8> {
        let mut page = vec![0u8; size];
        PageHeader::new(&mut page[..]).initialize(BlockId::new(5), BlockType::Data);
        page
    }

    #[test]
    fn test_append_and_get() {
        let mut buf = page(4096);
        let mut page = SlottedPage::new(&mut buf[..]);
        assert_eq!(page.append(b"hello").unwrap(), 0);
        assert_eq!(page.append(b"world!").unwrap(), 1);
        assert_eq!(page.slot_count(), 2);
        assert_eq!(page.get(0), Some(&b"hello"[..]));
        assert_eq!(page.get(1), Some(&b"world!"[..]));
        assert_eq!(page.get(2), None);

        let all: Vec<&[u8]> = page.records().collect();
        assert_eq!(all, vec![&b"hello"[..], &b"world!"[..]]);
    }

    #[test]
    fn test_page_full_and_too_large() {
        let mut buf = page(4096);
        let mut page = SlottedPage::new(&mut buf[..]);
        let max = max_record_size(4096);
        assert!(matches!(
            page.append(&vec![1u8; max + 1]),
            Err(StorageError::RowTooLarge { .. })
        ));
        page.append(&vec![1u8; max]).unwrap();
        assert_eq!(page.free_space(), 0);
        assert!(matches!(
            page.append(b"x"),
            Err(StorageError::PageFull { .. })
        ));
    }

    #[test]
    fn test_overwrite() {
        let mut buf = page(4096);
        let mut page = SlottedPage::new(&mut buf[..]);
        page.append(b"aaaa").unwrap();
        page.overwrite(0, b"bbbb").unwrap();
        assert_eq!(page.get(0), Some(&b"bbbb"[..]));
        assert!(page.overwrite(0, b"b").is_err());
        assert!(page.overwrite(3, b"bbbb").is_err());
    }

    #[test]
    fn test_truncate_reclaims_tail() {
        let mut buf = page(4096);
        let mut page = SlottedPage::new(&mut buf[..]);
        let initial = page.free_space();
        page.append(b"one").unwrap();
        let after_one = page.free_space();
        page.append(b"two").unwrap();
        page.append(b"three").unwrap();

        page.truncate(1).unwrap();
        assert_eq!(page.slot_count(), 1);
        assert_eq!(page.free_space(), after_one);
        assert_eq!(page.get(0), Some(&b"one"[..]));

        assert_eq!(page.append(b"again").unwrap(), 1);
        assert_eq!(page.get(1), Some(&b"again"[..]));

        page.truncate(0).unwrap();
        assert_eq!(page.free_space(), initial);
    }

    #[test]
    fn test_truncate_matches_fresh_layout() {
        let mut a = page(4096);
        let mut b = page(4096);
        {
            let mut pa = SlottedPage::new(&mut a[..]);
            pa.append(b"keep").unwrap();
            pa.append(b"drop me").unwrap();
            pa.truncate(1).unwrap();
        }
        SlottedPage::new(&mut b[..]).append(b"keep").unwrap();
        assert_eq!(a, b);
    }
}
