//! Allocator page layouts.
//!
//! # Root page
//!
//! ```text
//! +------------------+
//! | Page Header      |  48 bytes, `next` links the following root page
//! | count: u32       |
//! | entries[count]   |  (leaf block: u64, free blocks: u32)
//! +------------------+
//! ```
//!
//! # Leaf page
//!
//! ```text
//! +------------------+
//! | Page Header      |  48 bytes
//! | free: u32, pad   |
//! | summary[S]: u64  |  bit w set when words[w] is fully allocated
//! | words[W]: u64    |  one liveness bit per block
//! +------------------+
//! ```
//!
//! `W` is the largest word count such that `W` words plus `ceil(W / 64)`
//! summary words fit, so one leaf covers `64 * W` consecutive blocks.
//! Leaf `i` covers blocks `[i * C, (i + 1) * C)` and lives on the first of
//! them, except leaf 0 which lives on block 2 after the metadata block and
//! the first root page.

use bytes::{Buf, BufMut};
use sortheap_common::constants::PAGE_HEADER_SIZE;
use sortheap_common::types::BlockId;

use crate::error::{StorageError, StorageResult};
use crate::page::PageHeader;

const LEAF_PREFIX: usize = 8;
const ROOT_PREFIX: usize = 4;
const ROOT_ENTRY_SIZE: usize = 12;
const BITS_PER_WORD: usize = 64;

/// Block holding the first allocator root page.
pub const FIRST_ROOT_BLOCK: BlockId = BlockId::new(1);
/// Block holding the first allocator leaf.
pub const FIRST_LEAF_BLOCK: BlockId = BlockId::new(2);

/// Derived sizes of allocator pages for one block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocGeometry {
    /// Bitmap words per leaf.
    pub words: usize,
    /// Summary words per leaf.
    pub summary_words: usize,
    /// Blocks covered by one leaf.
    pub leaf_capacity: u64,
    /// Leaf entries per root page.
    pub root_capacity: u64,
}

impl AllocGeometry {
    /// Computes the geometry for `block_size`.
    pub const fn new(block_size: usize) -> Self {
        let body = block_size - PAGE_HEADER_SIZE - LEAF_PREFIX;
        // Each word costs 8 bytes plus 1/64 of a summary word.
        let words = body * 64 / 520;
        let summary_words = words.div_ceil(BITS_PER_WORD);
        let root_capacity = (block_size - PAGE_HEADER_SIZE - ROOT_PREFIX) / ROOT_ENTRY_SIZE;
        Self {
            words,
            summary_words,
            leaf_capacity: (words * BITS_PER_WORD) as u64,
            root_capacity: root_capacity as u64,
        }
    }

    /// Block holding leaf `index`.
    pub const fn leaf_block(&self, index: u64) -> BlockId {
        if index == 0 {
            FIRST_LEAF_BLOCK
        } else {
            BlockId::new(index * self.leaf_capacity)
        }
    }

    /// Block holding root page `index`.
    ///
    /// Root page `k > 0` lives right after the leaf it is created with, the
    /// first leaf it describes.
    pub const fn root_block(&self, index: u64) -> BlockId {
        if index == 0 {
            FIRST_ROOT_BLOCK
        } else {
            BlockId::new(index * self.root_capacity * self.leaf_capacity + 1)
        }
    }

    /// Leaf index and bit position of `block`.
    pub const fn locate(&self, block: BlockId) -> (u64, u32) {
        let raw = block.as_u64();
        (raw / self.leaf_capacity, (raw % self.leaf_capacity) as u32)
    }

    /// Root page index and entry index of leaf `leaf`.
    pub const fn root_entry(&self, leaf: u64) -> (u64, u32) {
        (leaf / self.root_capacity, (leaf % self.root_capacity) as u32)
    }

    /// Bits preset in a freshly created leaf: the metadata and allocator
    /// pages that live inside its range.
    pub fn reserved_bits(&self, leaf: u64) -> Vec<u32> {
        if leaf == 0 {
            return vec![0, 1, 2];
        }
        if leaf % self.root_capacity == 0 {
            vec![0, 1]
        } else {
            vec![0]
        }
    }

    /// Returns true for blocks the allocator owns.
    pub fn is_reserved(&self, block: BlockId) -> bool {
        let (leaf, bit) = self.locate(block);
        self.reserved_bits(leaf).contains(&bit)
    }
}

fn summary_offset() -> usize {
    PAGE_HEADER_SIZE + LEAF_PREFIX
}

fn words_offset(geometry: &AllocGeometry) -> usize {
    summary_offset() + geometry.summary_words * 8
}

fn read_word(page: &[u8], offset: usize) -> u64 {
    (&page[offset..]).get_u64_le()
}

fn write_word(page: &mut [u8], offset: usize, word: u64) {
    (&mut page[offset..]).put_u64_le(word);
}

// =============================================================================
// Leaf pages
// =============================================================================

/// Free block count of a leaf.
pub fn leaf_free(page: &[u8]) -> u32 {
    (&page[PAGE_HEADER_SIZE..]).get_u32_le()
}

fn set_leaf_free(page: &mut [u8], free: u32) {
    (&mut page[PAGE_HEADER_SIZE..]).put_u32_le(free);
}

/// Formats the body of a fresh leaf: every block free.
pub fn init_leaf(page: &mut [u8]) {
    let geometry = AllocGeometry::new(page.len());
    set_leaf_free(page, geometry.leaf_capacity as u32);
}

/// Returns true if `bit` is allocated.
pub fn leaf_bit(page: &[u8], bit: u32) -> bool {
    let geometry = AllocGeometry::new(page.len());
    let word = bit as usize / BITS_PER_WORD;
    let value = read_word(page, words_offset(&geometry) + word * 8);
    value & (1u64 << (bit as usize % BITS_PER_WORD)) != 0
}

/// Sets or clears one liveness bit, keeping the summary and free count.
pub fn set_leaf_bit(page: &mut [u8], bit: u32, allocated: bool) -> StorageResult<()> {
    let block = PageHeader::new(&*page).block_id();
    let geometry = AllocGeometry::new(page.len());
    if u64::from(bit) >= geometry.leaf_capacity {
        return Err(StorageError::corrupted(
            block,
            format!("bitmap bit {bit} out of range"),
        ));
    }
    if leaf_bit(page, bit) == allocated {
        return Err(StorageError::corrupted(
            block,
            format!("bitmap bit {bit} already {}", if allocated { "set" } else { "clear" }),
        ));
    }

    let word = bit as usize / BITS_PER_WORD;
    let mask = 1u64 << (bit as usize % BITS_PER_WORD);
    let word_at = words_offset(&geometry) + word * 8;
    let value = read_word(page, word_at);
    let value = if allocated { value | mask } else { value & !mask };
    write_word(page, word_at, value);

    let summary_at = summary_offset() + (word / BITS_PER_WORD) * 8;
    let summary_mask = 1u64 << (word % BITS_PER_WORD);
    let summary = read_word(page, summary_at);
    let summary = if value == u64::MAX {
        summary | summary_mask
    } else {
        summary & !summary_mask
    };
    write_word(page, summary_at, summary);

    let free = leaf_free(page);
    set_leaf_free(page, if allocated { free - 1 } else { free + 1 });
    Ok(())
}

/// Lowest free bit of a leaf, skipping full words through the summary.
pub fn leaf_first_free(page: &[u8]) -> Option<u32> {
    let geometry = AllocGeometry::new(page.len());
    for s in 0..geometry.summary_words {
        let summary = read_word(page, summary_offset() + s * 8);
        if summary == u64::MAX {
            continue;
        }
        let mut open = !summary;
        while open != 0 {
            let word = s * BITS_PER_WORD + open.trailing_zeros() as usize;
            if word >= geometry.words {
                break;
            }
            let value = read_word(page, words_offset(&geometry) + word * 8);
            if value != u64::MAX {
                let bit = (!value).trailing_zeros() as usize;
                return Some((word * BITS_PER_WORD + bit) as u32);
            }
            open &= open - 1;
        }
    }
    None
}

/// Number of allocated bits in a leaf.
pub fn leaf_allocated(page: &[u8]) -> u64 {
    let geometry = AllocGeometry::new(page.len());
    geometry.leaf_capacity - u64::from(leaf_free(page))
}

// =============================================================================
// Root pages
// =============================================================================

/// Number of entries in a root page.
pub fn root_count(page: &[u8]) -> u32 {
    (&page[PAGE_HEADER_SIZE..]).get_u32_le()
}

/// Entry `index` of a root page: leaf block and its free count.
pub fn root_entry(page: &[u8], index: u32) -> (BlockId, u32) {
    let at = PAGE_HEADER_SIZE + ROOT_PREFIX + index as usize * ROOT_ENTRY_SIZE;
    let mut buf = &page[at..at + ROOT_ENTRY_SIZE];
    let leaf = BlockId::new(buf.get_u64_le());
    (leaf, buf.get_u32_le())
}

/// Writes entry `index`, appending when `index == count`.
pub fn set_root_entry(page: &mut [u8], index: u32, leaf: BlockId, free: u32) -> StorageResult<()> {
    let geometry = AllocGeometry::new(page.len());
    let count = root_count(page);
    if index > count || u64::from(index) >= geometry.root_capacity {
        return Err(StorageError::corrupted(
            PageHeader::new(&*page).block_id(),
            format!("root entry {index} with {count} entries"),
        ));
    }
    let at = PAGE_HEADER_SIZE + ROOT_PREFIX + index as usize * ROOT_ENTRY_SIZE;
    let mut buf = &mut page[at..at + ROOT_ENTRY_SIZE];
    buf.put_u64_le(leaf.as_u64());
    buf.put_u32_le(free);
    if index == count {
        (&mut page[PAGE_HEADER_SIZE..]).put_u32_le(count + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortheap_common::types::BlockType;

    fn leaf_page(block_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; block_size];
        PageHeader::new(&mut page[..]).initialize(FIRST_LEAF_BLOCK, BlockType::AllocLeaf);
        init_leaf(&mut page);
        page
    }

    #[test]
    fn test_geometry() {
        let g = AllocGeometry::new(8192);
        assert_eq!(g.words, 1001);
        assert_eq!(g.summary_words, 16);
        assert_eq!(g.leaf_capacity, 64_064);
        assert!(words_offset(&g) + g.words * 8 <= 8192);

        let g = AllocGeometry::new(4096);
        assert!(words_offset(&g) + g.words * 8 <= 4096);
        assert_eq!(g.leaf_block(0), FIRST_LEAF_BLOCK);
        assert_eq!(g.leaf_block(3), BlockId::new(3 * g.leaf_capacity));
        assert_eq!(g.root_block(0), FIRST_ROOT_BLOCK);
    }

    #[test]
    fn test_reserved_blocks() {
        let g = AllocGeometry::new(4096);
        assert!(g.is_reserved(BlockId::META));
        assert!(g.is_reserved(FIRST_ROOT_BLOCK));
        assert!(g.is_reserved(FIRST_LEAF_BLOCK));
        assert!(!g.is_reserved(BlockId::new(3)));
        assert!(g.is_reserved(g.leaf_block(1)));
        assert!(!g.is_reserved(BlockId::new(g.leaf_capacity + 1)));
        assert!(g.is_reserved(g.root_block(1)));
    }

    #[test]
    fn test_leaf_bits_and_summary() {
        let mut page = leaf_page(4096);
        let g = AllocGeometry::new(4096);
        assert_eq!(leaf_free(&page) as u64, g.leaf_capacity);
        assert_eq!(leaf_first_free(&page), Some(0));

        for bit in 0..64 {
            set_leaf_bit(&mut page, bit, true).unwrap();
        }
        assert_eq!(read_word(&page, summary_offset()) & 1, 1);
        assert_eq!(leaf_first_free(&page), Some(64));
        assert_eq!(leaf_allocated(&page), 64);

        set_leaf_bit(&mut page, 5, false).unwrap();
        assert_eq!(read_word(&page, summary_offset()) & 1, 0);
        assert_eq!(leaf_first_free(&page), Some(5));
        assert!(set_leaf_bit(&mut page, 5, false).is_err());
        assert!(set_leaf_bit(&mut page, 6, true).is_err());
    }

    #[test]
    fn test_full_leaf() {
        let mut page = leaf_page(4096);
        let g = AllocGeometry::new(4096);
        for bit in 0..g.leaf_capacity as u32 {
            set_leaf_bit(&mut page, bit, true).unwrap();
        }
        assert_eq!(leaf_free(&page), 0);
        assert_eq!(leaf_first_free(&page), None);
    }

    #[test]
    fn test_root_entries() {
        let mut page = vec![0u8; 4096];
        PageHeader::new(&mut page[..]).initialize(FIRST_ROOT_BLOCK, BlockType::AllocRoot);
        set_root_entry(&mut page, 0, FIRST_LEAF_BLOCK, 100).unwrap();
        set_root_entry(&mut page, 1, BlockId::new(31_808), 99).unwrap();
        set_root_entry(&mut page, 0, FIRST_LEAF_BLOCK, 98).unwrap();
        assert_eq!(root_count(&page), 2);
        assert_eq!(root_entry(&page, 0), (FIRST_LEAF_BLOCK, 98));
        assert_eq!(root_entry(&page, 1), (BlockId::new(31_808), 99));
        assert!(set_root_entry(&mut page, 5, FIRST_LEAF_BLOCK, 1).is_err());
    }
}
