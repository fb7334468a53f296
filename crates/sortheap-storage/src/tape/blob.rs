//! Out-of-line values stored in overflow page chains.

use sortheap_common::types::{BlockId, BlockType};

use crate::buffer::BufferPool;
use crate::error::{StorageError, StorageResult};
use crate::page::{PageHeader, SlottedPage};

/// Destination for out-of-line data.
pub trait BlobSink {
    /// Stores `data` and returns the first block of its chain.
    fn write_blob(&mut self, data: &[u8]) -> StorageResult<BlockId>;
}

/// Source of out-of-line data.
pub trait BlobSource {
    /// Reads `len` bytes stored from `first` on.
    fn read_blob(&self, first: BlockId, len: usize) -> StorageResult<Vec<u8>>;
}

/// Follows an overflow chain from `first`, collecting `len` bytes.
pub fn read_blob(pool: &BufferPool, first: BlockId, len: usize) -> StorageResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut block = first;
    while out.len() < len {
        if !block.is_valid() {
            return Err(StorageError::corrupted(
                first,
                format!("overflow chain ends after {} of {len} bytes", out.len()),
            ));
        }
        let page = pool.read_typed(block, BlockType::Overflow)?;
        let slotted = SlottedPage::new(&page[..]);
        let piece = slotted.record(0)?;
        let take = piece.len().min(len - out.len());
        out.extend_from_slice(&piece[..take]);
        block = PageHeader::new(&page[..]).next();
    }
    Ok(out)
}

impl BlobSource for BufferPool {
    fn read_blob(&self, first: BlockId, len: usize) -> StorageResult<Vec<u8>> {
        read_blob(self, first, len)
    }
}
