//! Structured bodies of fixed-layout pages.
//!
//! Metadata, TapeSet and tape-header pages hold one length-prefixed body
//! right after the page header. The body is always replaced whole.

use bytes::{Buf, BufMut};
use sortheap_common::constants::PAGE_HEADER_SIZE;

use super::header::PageHeader;
use crate::error::{StorageError, StorageResult};

const BODY_LEN_SIZE: usize = 4;

/// Largest body a page of `block_size` bytes can hold.
#[inline]
pub const fn max_body_size(block_size: usize) -> usize {
    block_size - PAGE_HEADER_SIZE - BODY_LEN_SIZE
}

/// Returns the body of a structured page.
pub fn read_body(page: &[u8]) -> StorageResult<&[u8]> {
    let len = (&page[PAGE_HEADER_SIZE..]).get_u32_le() as usize;
    let start = PAGE_HEADER_SIZE + BODY_LEN_SIZE;
    page.get(start..start + len).ok_or_else(|| {
        StorageError::corrupted(
            PageHeader::new(page).block_id(),
            format!("body length {len} exceeds page"),
        )
    })
}

/// Replaces the body of a structured page.
pub fn write_body(page: &mut [u8], body: &[u8]) -> StorageResult<()> {
    let max = max_body_size(page.len());
    if body.len() > max {
        return Err(StorageError::RowTooLarge {
            size: body.len(),
            max_size: max,
        });
    }
    let start = PAGE_HEADER_SIZE + BODY_LEN_SIZE;
    (&mut page[PAGE_HEADER_SIZE..]).put_u32_le(body.len() as u32);
    page[start..start + body.len()].copy_from_slice(body);
    page[start + body.len()..].fill(0);
    Ok(())
}
