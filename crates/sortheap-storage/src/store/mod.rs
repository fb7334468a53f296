//! Block stores.
//!
//! A [`BlockStore`] is a flat array of fixed-size blocks addressed by
//! [`BlockId`]. Reads past the end return a zero page; writes past the end
//! extend the store.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::fmt;

use sortheap_common::types::BlockId;

use crate::error::StorageResult;

/// Durable block storage underneath the buffer pool.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Number of blocks the store currently holds.
    fn num_blocks(&self) -> u64;

    /// Reads a block into `buf`, zero-filling blocks never written.
    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes a block, extending the store if needed.
    fn write_block(&self, block: BlockId, buf: &[u8]) -> StorageResult<()>;

    /// Forces written blocks to durable storage.
    fn sync(&self) -> StorageResult<()>;
}

fn check_len(store: &dyn BlockStore, block: BlockId, len: usize) -> StorageResult<()> {
    if !block.is_valid() {
        return Err(crate::error::StorageError::BlockNotFound { block });
    }
    if len != store.block_size() {
        return Err(crate::error::StorageError::invalid_argument(format!(
            "buffer of {len} bytes for {}-byte blocks",
            store.block_size()
        )));
    }
    Ok(())
}
