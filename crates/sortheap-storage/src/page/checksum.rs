//! Page checksum utilities.
//!
//! The checksum covers the whole page except the 4-byte checksum field. It is
//! stamped when a page is written back to the store and verified when it is
//! loaded. An all-zero page is a block that was never written and carries no
//! checksum.

use sortheap_common::constants::PAGE_FORMAT_VERSION;
use sortheap_common::types::BlockId;

use super::header::{PageHeader, CHECKSUM_OFFSET};
use crate::error::{StorageError, StorageResult};

/// Computes the checksum of a page, skipping the checksum field.
///
/// # Example
///
/// ```rust
/// use sortheap_storage::page::compute_page_checksum;
///
/// let page = vec![1u8; 4096];
/// let checksum = compute_page_checksum(&page);
/// assert_ne!(checksum, 0);
/// ```
pub fn compute_page_checksum(page: &[u8]) -> u32 {
    debug_assert!(CHECKSUM_OFFSET + 4 <= page.len());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Writes the checksum of a page into its header.
pub fn stamp_checksum(page: &mut [u8]) {
    let checksum = compute_page_checksum(page);
    PageHeader::new(page).set_checksum(checksum);
}

/// Returns true for a block that was never written.
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Verifies a page loaded from the store.
///
/// A zero page is accepted. Anything else must carry the page magic, the
/// current format version, the block id it was loaded from, and a matching
/// checksum.
pub fn verify_page(page: &[u8], block: BlockId) -> StorageResult<()> {
    if is_zero_page(page) {
        return Ok(());
    }

    let header = PageHeader::new(page);
    if !header.is_valid_magic() {
        return Err(StorageError::corrupted(
            block,
            format!("bad page magic {:#06x}", header.magic()),
        ));
    }
    if header.version() != PAGE_FORMAT_VERSION {
        return Err(StorageError::corrupted(
            block,
            format!("unsupported page version {}", header.version()),
        ));
    }

    let expected = header.checksum();
    let actual = compute_page_checksum(page);
    if expected != actual {
        return Err(StorageError::ChecksumMismatch {
            block,
            expected,
            actual,
        });
    }

    if header.block_id() != block {
        return Err(StorageError::corrupted(
            block,
            format!("page claims to be block {}", header.block_id()),
        ));
    }
    Ok(())
}
