//! Block type tags and row locators.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::BlockId;

/// Types of blocks in a SortHeap relation.
///
/// Every formatted page records its type in the header; reading a page as
/// the wrong type is a structural error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    /// Never formatted or recycled.
    #[default]
    Free = 0,
    /// Engine metadata (block 0).
    Meta = 1,
    /// Allocator root chain: `(leaf, free count)` entries.
    AllocRoot = 2,
    /// Allocator leaf: liveness bitmap plus per-word summary.
    AllocLeaf = 3,
    /// TapeSet state.
    TapeSet = 4,
    /// Tape header.
    TapeHeader = 5,
    /// Auxiliary record of every block allocated to a tape.
    TapeAux = 6,
    /// Run metadata entries of a tape.
    RunIndex = 7,
    /// Row data.
    Data = 8,
    /// Per-run B-tree leaf.
    BTreeLeaf = 9,
    /// Per-run B-tree internal node.
    BTreeInternal = 10,
    /// Per-run block-range summaries.
    RangeSummary = 11,
    /// Out-of-line value chunks.
    Overflow = 12,
}

impl BlockType {
    /// Creates a `BlockType` from a raw byte value.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Meta),
            2 => Some(Self::AllocRoot),
            3 => Some(Self::AllocLeaf),
            4 => Some(Self::TapeSet),
            5 => Some(Self::TapeHeader),
            6 => Some(Self::TapeAux),
            7 => Some(Self::RunIndex),
            8 => Some(Self::Data),
            9 => Some(Self::BTreeLeaf),
            10 => Some(Self::BTreeInternal),
            11 => Some(Self::RangeSummary),
            12 => Some(Self::Overflow),
            _ => None,
        }
    }

    /// Returns the raw byte value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if the page stores variable-length slotted records.
    #[inline]
    #[must_use]
    pub const fn is_slotted(self) -> bool {
        matches!(
            self,
            Self::TapeAux
                | Self::RunIndex
                | Self::Data
                | Self::BTreeLeaf
                | Self::BTreeInternal
                | Self::RangeSummary
                | Self::Overflow
        )
    }

    /// Returns true if this is a B-tree page.
    #[inline]
    #[must_use]
    pub const fn is_btree(self) -> bool {
        matches!(self, Self::BTreeLeaf | Self::BTreeInternal)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "Free",
            Self::Meta => "Meta",
            Self::AllocRoot => "AllocRoot",
            Self::AllocLeaf => "AllocLeaf",
            Self::TapeSet => "TapeSet",
            Self::TapeHeader => "TapeHeader",
            Self::TapeAux => "TapeAux",
            Self::RunIndex => "RunIndex",
            Self::Data => "Data",
            Self::BTreeLeaf => "BTreeLeaf",
            Self::BTreeInternal => "BTreeInternal",
            Self::RangeSummary => "RangeSummary",
            Self::Overflow => "Overflow",
        };
        f.write_str(name)
    }
}

/// Physical position of a row: a data block, a slot in it, and the member
/// index inside a compressed group (0 for plain rows).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowLocator {
    /// Data block.
    pub block: BlockId,
    /// Slot within the block.
    pub slot: u16,
    /// Row within a compressed group.
    pub member: u16,
}

impl RowLocator {
    /// Encoded size in bytes.
    pub const ENCODED_SIZE: usize = 12;

    /// Locator that points nowhere.
    pub const INVALID: Self = Self {
        block: BlockId::INVALID,
        slot: 0,
        member: 0,
    };

    /// Creates a locator for a plain tuple.
    #[inline]
    #[must_use]
    pub const fn new(block: BlockId, slot: u16) -> Self {
        Self {
            block,
            slot,
            member: 0,
        }
    }

    /// Returns the locator of one member of the group stored at `self`.
    #[inline]
    #[must_use]
    pub const fn with_member(self, member: u16) -> Self {
        Self {
            block: self.block,
            slot: self.slot,
            member,
        }
    }

    /// Returns true if the locator points at a block.
    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.block.is_valid()
    }

    /// Encodes as 12 little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[..8].copy_from_slice(&self.block.as_u64().to_le_bytes());
        out[8..10].copy_from_slice(&self.slot.to_le_bytes());
        out[10..12].copy_from_slice(&self.member.to_le_bytes());
        out
    }

    /// Decodes from the first 12 bytes of `bytes`.
    ///
    /// Returns `None` if the slice is too short.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return None;
        }
        let mut block = [0u8; 8];
        block.copy_from_slice(&bytes[..8]);
        Some(Self {
            block: BlockId::new(u64::from_le_bytes(block)),
            slot: u16::from_le_bytes([bytes[8], bytes[9]]),
            member: u16::from_le_bytes([bytes[10], bytes[11]]),
        })
    }
}

impl fmt::Debug for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.member == 0 {
            write!(f, "({}, {})", self.block, self.slot)
        } else {
            write!(f, "({}, {}.{})", self.block, self.slot, self.member)
        }
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_from_u8() {
        for raw in 0..=12u8 {
            let ty = BlockType::from_u8(raw).unwrap();
            assert_eq!(ty.as_u8(), raw);
        }
        assert_eq!(BlockType::from_u8(13), None);
        assert!(BlockType::Data.is_slotted());
        assert!(!BlockType::TapeSet.is_slotted());
        assert!(BlockType::BTreeInternal.is_btree());
    }

    #[test]
    fn test_locator_bytes() {
        let loc = RowLocator::new(BlockId::new(99), 7).with_member(3);
        let bytes = loc.to_bytes();
        assert_eq!(RowLocator::from_bytes(&bytes), Some(loc));
        assert_eq!(RowLocator::from_bytes(&bytes[..4]), None);
        assert_eq!(loc.to_string(), "(99, 7.3)");
    }

    #[test]
    fn test_locator_ordering() {
        let a = RowLocator::new(BlockId::new(1), 5);
        let b = RowLocator::new(BlockId::new(1), 6);
        assert!(a < b);
        assert!(a < a.with_member(1));
    }
}
