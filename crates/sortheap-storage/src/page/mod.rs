//! Page layout and on-disk format.
//!
//! Every block of a relation is a fixed-size page with a 48-byte header
//! followed by one of three body layouts:
//!
//! - **Slotted**: variable-length records (tape aux lists, run index, data,
//!   B-tree, range summary and overflow pages)
//! - **Structured**: one length-prefixed body replaced whole (metadata,
//!   TapeSet, tape header)
//! - **Allocator**: fixed arrays mutated entry by entry (see `crate::alloc`)
//!
//! # Page Format
//!
//! ```text
//! +------------------+
//! |   Page Header    |  48 bytes
//! +------------------+
//! |   Slot Array     |  grows downward (4 bytes per slot)
//! |        ↓         |
//! +------------------+
//! |   Free Space     |
//! +------------------+
//! |        ↑         |
//! |   Record Data    |  grows upward
//! +------------------+
//! ```

mod body;
mod checksum;
mod header;
mod slotted;

pub use body::{max_body_size, read_body, write_body};
pub use checksum::{compute_page_checksum, is_zero_page, stamp_checksum, verify_page};
pub use header::PageHeader;
pub use slotted::{max_record_size, SlottedPage};

use sortheap_common::types::{BlockId, BlockType};

use crate::error::{StorageError, StorageResult};

/// Checks that a page has the expected block type.
pub fn expect_type(page: &[u8], block: BlockId, expected: BlockType) -> StorageResult<()> {
    let header = PageHeader::new(page);
    let actual = header.block_type().unwrap_or(BlockType::Free);
    if !header.is_valid_magic() || actual != expected {
        return Err(StorageError::InvalidBlockType {
            block,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_type() {
        let mut page = vec![0u8; 4096];
        assert!(expect_type(&page, BlockId::new(3), BlockType::Data).is_err());

        PageHeader::new(&mut page[..]).initialize(BlockId::new(3), BlockType::Data);
        assert!(expect_type(&page, BlockId::new(3), BlockType::Data).is_ok());

        let err = expect_type(&page, BlockId::new(3), BlockType::TapeHeader).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "block 3 has type Data, expected TapeHeader"
        );
    }
}
