//! Block allocator.
//!
//! A two-level bitmap tracks which blocks of a relation are in use:
//!
//! ```text
//! root 1 ──next──▶ root k ──next──▶ ...
//!   │ (leaf, free)   │
//!   ▼                ▼
//! leaf 0           leaf k·R
//! [summary|words]  [summary|words]
//! ```
//!
//! Root entries carry each leaf's free count so full leaves are skipped
//! without reading them; a leaf's summary bitmap has one bit per bitmap word
//! and lets the scan skip fully allocated words. Allocation always returns
//! the lowest free block.
//!
//! Every change goes through the caller's [`MiniTxn`], so an allocation is
//! atomic with whatever the caller does with the block. Allocator pages are
//! latched after every other page of the mini-transaction, root before leaf;
//! the exclusive latch on the first root page serializes all allocator work
//! for the relation.

pub mod layout;

use bytes::Bytes;
use sortheap_common::types::{BlockId, BlockType};
use sortheap_wal::PageOp;
use tracing::{debug, info};

use self::layout::{
    leaf_bit, leaf_first_free, root_count, root_entry, AllocGeometry, FIRST_LEAF_BLOCK,
    FIRST_ROOT_BLOCK,
};
use crate::buffer::{BufferPool, MiniTxn};
use crate::error::{StorageError, StorageResult};
use crate::page::PageHeader;

/// Allocator of one relation's blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockAllocator {
    geometry: AllocGeometry,
}

impl BlockAllocator {
    /// Creates an allocator for pages of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            geometry: AllocGeometry::new(block_size),
        }
    }

    /// Page geometry in use.
    pub fn geometry(&self) -> &AllocGeometry {
        &self.geometry
    }

    /// Formats the first root page and leaf of an empty relation.
    pub fn format(&self, mtr: &mut MiniTxn<'_>) -> StorageResult<()> {
        mtr.init(FIRST_ROOT_BLOCK, BlockType::AllocRoot)?;
        let free = self.init_leaf(mtr, 0)?;
        mtr.apply(PageOp::AllocRootSet {
            block: FIRST_ROOT_BLOCK,
            index: 0,
            leaf: FIRST_LEAF_BLOCK,
            free,
        })
    }

    /// Formats leaf `index` with its reserved bits set; returns its free count.
    fn init_leaf(&self, mtr: &mut MiniTxn<'_>, index: u64) -> StorageResult<u32> {
        let block = self.geometry.leaf_block(index);
        mtr.init(block, BlockType::AllocLeaf)?;
        let reserved = self.geometry.reserved_bits(index);
        for &bit in &reserved {
            mtr.apply(PageOp::BitmapSet {
                block,
                bit,
                allocated: true,
            })?;
        }
        Ok((self.geometry.leaf_capacity as usize - reserved.len()) as u32)
    }

    /// Allocates the lowest free block.
    pub fn allocate(&self, mtr: &mut MiniTxn<'_>) -> StorageResult<BlockId> {
        let capacity = self.geometry.root_capacity;
        let mut root_index = 0u64;
        let mut root = FIRST_ROOT_BLOCK;

        loop {
            let page = mtr.page_typed(root, BlockType::AllocRoot)?;
            let count = root_count(page);
            let next = PageHeader::new(page).next();
            let open = (0..count)
                .map(|i| (i, root_entry(page, i)))
                .find(|(_, (_, free))| *free > 0);

            if let Some((entry, (leaf, free))) = open {
                let leaf_index = root_index * capacity + u64::from(entry);
                let page = mtr.page_typed(leaf, BlockType::AllocLeaf)?;
                let bit = leaf_first_free(page).ok_or_else(|| {
                    StorageError::corrupted(leaf, format!("root reports {free} free, bitmap full"))
                })?;
                let block = BlockId::new(leaf_index * self.geometry.leaf_capacity + u64::from(bit));
                self.take(mtr, root, entry, leaf, bit, free)?;
                return Ok(block);
            }

            if u64::from(count) < capacity {
                let leaf_index = root_index * capacity + u64::from(count);
                return self.extend(mtr, root, count, leaf_index);
            }
            if !next.is_valid() {
                let new_root = self.geometry.root_block(root_index + 1);
                mtr.apply(PageOp::SetNext {
                    block: root,
                    next: new_root,
                })?;
                mtr.init(new_root, BlockType::AllocRoot)?;
                info!(root = %new_root, "allocator root chain extended");
                return self.extend(mtr, new_root, 0, (root_index + 1) * capacity);
            }
            root = next;
            root_index += 1;
        }
    }

    /// Creates leaf `leaf_index` as entry `entry` of `root` and allocates
    /// its first free block.
    fn extend(
        &self,
        mtr: &mut MiniTxn<'_>,
        root: BlockId,
        entry: u32,
        leaf_index: u64,
    ) -> StorageResult<BlockId> {
        let leaf = self.geometry.leaf_block(leaf_index);
        let free = self.init_leaf(mtr, leaf_index)?;
        mtr.apply(PageOp::AllocRootSet {
            block: root,
            index: entry,
            leaf,
            free,
        })?;
        let bit = leaf_first_free(mtr.page(leaf)?)
            .ok_or_else(|| StorageError::corrupted(leaf, "fresh leaf has no free bit"))?;
        self.take(mtr, root, entry, leaf, bit, free)?;
        debug!(leaf = %leaf, leaf_index, "allocator leaf added");
        Ok(BlockId::new(leaf_index * self.geometry.leaf_capacity + u64::from(bit)))
    }

    fn take(
        &self,
        mtr: &mut MiniTxn<'_>,
        root: BlockId,
        entry: u32,
        leaf: BlockId,
        bit: u32,
        free: u32,
    ) -> StorageResult<()> {
        mtr.apply(PageOp::BitmapSet {
            block: leaf,
            bit,
            allocated: true,
        })?;
        mtr.apply(PageOp::AllocRootSet {
            block: root,
            index: entry,
            leaf,
            free: free - 1,
        })
    }

    /// Returns a block to the free pool.
    pub fn recycle(&self, mtr: &mut MiniTxn<'_>, block: BlockId) -> StorageResult<()> {
        if !block.is_valid() || self.geometry.is_reserved(block) {
            return Err(StorageError::ReservedBlock { block });
        }
        let (leaf_index, bit) = self.geometry.locate(block);
        let (root_index, entry) = self.geometry.root_entry(leaf_index);

        let mut root = FIRST_ROOT_BLOCK;
        for _ in 0..root_index {
            let next = PageHeader::new(mtr.page_typed(root, BlockType::AllocRoot)?).next();
            if !next.is_valid() {
                return Err(StorageError::DoubleFree { block });
            }
            root = next;
        }

        let page = mtr.page_typed(root, BlockType::AllocRoot)?;
        if entry >= root_count(page) {
            return Err(StorageError::DoubleFree { block });
        }
        let (leaf, free) = root_entry(page, entry);
        if !leaf_bit(mtr.page_typed(leaf, BlockType::AllocLeaf)?, bit) {
            return Err(StorageError::DoubleFree { block });
        }
        mtr.apply(PageOp::BitmapSet {
            block: leaf,
            bit,
            allocated: false,
        })?;
        mtr.apply(PageOp::AllocRootSet {
            block: root,
            index: entry,
            leaf,
            free: free + 1,
        })
    }

    /// Number of allocated blocks, metadata and allocator pages included.
    ///
    /// Must not be called while the calling thread holds a mini-transaction
    /// that touched the allocator.
    pub fn allocated_count(&self, pool: &BufferPool) -> StorageResult<u64> {
        let mut total = 0u64;
        let mut root = FIRST_ROOT_BLOCK;
        while root.is_valid() {
            let page = pool.read_typed(root, BlockType::AllocRoot)?;
            for i in 0..root_count(&page) {
                let (_, free) = root_entry(&page, i);
                total += self.geometry.leaf_capacity - u64::from(free);
            }
            root = PageHeader::new(&page[..]).next();
        }
        Ok(total)
    }

    /// Returns true if `block` is allocated.
    pub fn is_allocated(&self, pool: &BufferPool, block: BlockId) -> StorageResult<bool> {
        if !block.is_valid() {
            return Ok(false);
        }
        let (leaf_index, bit) = self.geometry.locate(block);
        let (root_index, entry) = self.geometry.root_entry(leaf_index);

        let mut root = FIRST_ROOT_BLOCK;
        for _ in 0..root_index {
            let next = PageHeader::new(&pool.read_typed(root, BlockType::AllocRoot)?[..]).next();
            if !next.is_valid() {
                return Ok(false);
            }
            root = next;
        }
        let leaf = {
            let page = pool.read_typed(root, BlockType::AllocRoot)?;
            if entry >= root_count(&page) {
                return Ok(false);
            }
            root_entry(&page, entry).0
        };
        let page = pool.read_typed(leaf, BlockType::AllocLeaf)?;
        Ok(leaf_bit(&page, bit))
    }
}

/// Encodes a list of block ids as one record.
pub(crate) fn encode_block_list(blocks: &[BlockId]) -> Bytes {
    let mut out = Vec::with_capacity(blocks.len() * 8);
    for block in blocks {
        out.extend_from_slice(&block.as_u64().to_le_bytes());
    }
    Bytes::from(out)
}

/// Decodes a record written by [`encode_block_list`].
pub(crate) fn decode_block_list(record: &[u8]) -> StorageResult<Vec<BlockId>> {
    if record.len() % 8 != 0 {
        return Err(StorageError::decode(format!(
            "block list of {} bytes",
            record.len()
        )));
    }
    Ok(record
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            BlockId::new(u64::from_le_bytes(raw))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sortheap_common::types::TxnId;
    use sortheap_wal::MemoryWal;

    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::store::MemoryStore;

    fn setup() -> (BufferPool, BlockAllocator) {
        let pool = BufferPool::new(
            BufferPoolConfig::for_testing(),
            Arc::new(MemoryStore::new(4096)),
            Arc::new(MemoryWal::new()),
        )
        .unwrap();
        let alloc = BlockAllocator::new(4096);
        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        alloc.format(&mut mtr).unwrap();
        mtr.commit().unwrap();
        (pool, alloc)
    }

    fn allocate(pool: &BufferPool, alloc: &BlockAllocator) -> BlockId {
        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        let block = alloc.allocate(&mut mtr).unwrap();
        mtr.commit().unwrap();
        block
    }

    #[test]
    fn test_allocates_lowest_free() {
        let (pool, alloc) = setup();
        assert_eq!(alloc.allocated_count(&pool).unwrap(), 3);

        let blocks: Vec<u64> = (0..5).map(|_| allocate(&pool, &alloc).as_u64()).collect();
        assert_eq!(blocks, vec![3, 4, 5, 6, 7]);
        assert_eq!(alloc.allocated_count(&pool).unwrap(), 8);

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        alloc.recycle(&mut mtr, BlockId::new(5)).unwrap();
        mtr.commit().unwrap();
        assert!(!alloc.is_allocated(&pool, BlockId::new(5)).unwrap());
        assert_eq!(allocate(&pool, &alloc), BlockId::new(5));
        assert_eq!(allocate(&pool, &alloc), BlockId::new(8));
    }

    #[test]
    fn test_double_free_and_reserved_are_fatal() {
        let (pool, alloc) = setup();
        let block = allocate(&pool, &alloc);

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        alloc.recycle(&mut mtr, block).unwrap();
        let err = alloc.recycle(&mut mtr, block).unwrap_err();
        assert!(matches!(err, StorageError::DoubleFree { .. }));
        assert!(err.is_fatal());
        drop(mtr);
        assert!(alloc.is_allocated(&pool, block).unwrap());

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        for reserved in [0, 1, 2] {
            let err = alloc.recycle(&mut mtr, BlockId::new(reserved)).unwrap_err();
            assert!(matches!(err, StorageError::ReservedBlock { .. }));
            assert!(err.is_fatal());
        }
        let far = BlockId::new(alloc.geometry().leaf_capacity * 5 + 9);
        assert!(matches!(
            alloc.recycle(&mut mtr, far).unwrap_err(),
            StorageError::DoubleFree { .. }
        ));
    }

    #[test]
    fn test_extends_when_leaf_full() {
        let (pool, alloc) = setup();
        let capacity = alloc.geometry().leaf_capacity;

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        for bit in 3..capacity as u32 {
            mtr.apply(PageOp::BitmapSet {
                block: FIRST_LEAF_BLOCK,
                bit,
                allocated: true,
            })
            .unwrap();
        }
        mtr.apply(PageOp::AllocRootSet {
            block: FIRST_ROOT_BLOCK,
            index: 0,
            leaf: FIRST_LEAF_BLOCK,
            free: 0,
        })
        .unwrap();
        mtr.commit().unwrap();
        assert_eq!(alloc.allocated_count(&pool).unwrap(), capacity);

        // Bit 0 of the new leaf is the leaf page itself.
        let block = allocate(&pool, &alloc);
        assert_eq!(block, BlockId::new(capacity + 1));
        assert!(alloc.is_allocated(&pool, BlockId::new(capacity)).unwrap());
        assert_eq!(alloc.allocated_count(&pool).unwrap(), capacity + 2);

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        alloc.recycle(&mut mtr, BlockId::new(100)).unwrap();
        mtr.commit().unwrap();
        assert_eq!(allocate(&pool, &alloc), BlockId::new(100));
    }

    #[test]
    fn test_extends_root_chain() {
        let (pool, alloc) = setup();
        let geometry = *alloc.geometry();

        // Pretend every leaf of the first root page exists and is full.
        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        for entry in 0..geometry.root_capacity as u32 {
            mtr.apply(PageOp::AllocRootSet {
                block: FIRST_ROOT_BLOCK,
                index: entry,
                leaf: geometry.leaf_block(u64::from(entry)),
                free: 0,
            })
            .unwrap();
        }
        mtr.commit().unwrap();

        let block = allocate(&pool, &alloc);
        let first_leaf = geometry.root_capacity * geometry.leaf_capacity;
        assert_eq!(block, BlockId::new(first_leaf + 2));
        assert_eq!(geometry.root_block(1), BlockId::new(first_leaf + 1));
        assert!(alloc.is_allocated(&pool, block).unwrap());
        assert!(alloc.is_allocated(&pool, geometry.root_block(1)).unwrap());

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        alloc.recycle(&mut mtr, block).unwrap();
        mtr.commit().unwrap();
        assert!(!alloc.is_allocated(&pool, block).unwrap());
    }

    #[test]
    fn test_rolled_back_allocation_is_free() {
        let (pool, alloc) = setup();
        {
            let mut mtr = pool.begin(TxnId::new(1)).unwrap();
            assert_eq!(alloc.allocate(&mut mtr).unwrap(), BlockId::new(3));
        }
        assert_eq!(allocate(&pool, &alloc), BlockId::new(3));
    }

    #[test]
    fn test_block_list_encoding() {
        let blocks = vec![BlockId::new(3), BlockId::new(90_000)];
        let bytes = encode_block_list(&blocks);
        assert_eq!(decode_block_list(&bytes).unwrap(), blocks);
        assert!(decode_block_list(&bytes[..5]).is_err());
    }
}
