//! In-memory block store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sortheap_common::types::BlockId;

use super::{check_len, BlockStore};
use crate::error::StorageResult;

/// A block store kept in a hash map.
///
/// Clones share the same blocks, which lets a test drop an engine without
/// flushing and reopen it over whatever reached the store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    block_size: usize,
    blocks: Arc<RwLock<HashMap<u64, Box<[u8]>>>>,
    num_blocks: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Arc::new(RwLock::new(HashMap::new())),
            num_blocks: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deep copy of the current contents, detached from this store.
    pub fn fork(&self) -> Self {
        let blocks = self.blocks.read().clone();
        Self {
            block_size: self.block_size,
            blocks: Arc::new(RwLock::new(blocks)),
            num_blocks: Arc::new(AtomicU64::new(self.num_blocks.load(Ordering::Acquire))),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of block writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemoryStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Acquire)
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> StorageResult<()> {
        check_len(self, block, buf.len())?;
        match self.blocks.read().get(&block.as_u64()) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block: BlockId, buf: &[u8]) -> StorageResult<()> {
        check_len(self, block, buf.len())?;
        self.blocks
            .write()
            .insert(block.as_u64(), buf.to_vec().into_boxed_slice());
        self.num_blocks
            .fetch_max(block.as_u64() + 1, Ordering::AcqRel);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let store = MemoryStore::new(4096);
        let mut buf = vec![0xFFu8; 4096];
        store.read_block(BlockId::new(10), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(store.num_blocks(), 0);

        store.write_block(BlockId::new(10), &vec![3u8; 4096]).unwrap();
        assert_eq!(store.num_blocks(), 11);
        store.read_block(BlockId::new(10), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_fork_is_detached() {
        let store = MemoryStore::new(4096);
        store.write_block(BlockId::new(1), &vec![1u8; 4096]).unwrap();
        let fork = store.fork();
        store.write_block(BlockId::new(1), &vec![2u8; 4096]).unwrap();

        let mut buf = vec![0u8; 4096];
        fork.read_block(BlockId::new(1), &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_rejects_wrong_buffer() {
        let store = MemoryStore::new(4096);
        let mut buf = vec![0u8; 100];
        assert!(store.read_block(BlockId::new(0), &mut buf).is_err());
        assert!(store.read_block(BlockId::INVALID, &mut vec![0u8; 4096]).is_err());
    }
}
