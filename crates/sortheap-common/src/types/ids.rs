//! Core identifier types for SortHeap.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block identifier - the index of a fixed-size block within a relation.
///
/// Block 0 always holds the engine metadata page.
///
/// # Example
///
/// ```rust
/// use sortheap_common::types::BlockId;
///
/// let block = BlockId::new(42);
/// assert_eq!(block.as_u64(), 42);
/// assert!(!BlockId::INVALID.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockId(u64);

impl BlockId {
    /// Invalid block ID constant, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// The engine metadata block.
    pub const META: Self = Self(0);

    /// Creates a new `BlockId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid block ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Byte offset of this block in a file of `block_size` blocks.
    #[inline]
    #[must_use]
    pub const fn offset(self, block_size: usize) -> u64 {
        self.0 * block_size as u64
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "BlockId(INVALID)")
        } else {
            write!(f, "BlockId({})", self.0)
        }
    }
}

/// Defaults to [`BlockId::INVALID`], never the metadata block.
impl Default for BlockId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<BlockId> for u64 {
    #[inline]
    fn from(id: BlockId) -> Self {
        id.0
    }
}

/// Transaction identifier - uniquely identifies a transaction.
///
/// Transaction IDs are monotonically increasing and drive run visibility:
/// every run records the id of the transaction that created it.
///
/// # Example
///
/// ```rust
/// use sortheap_common::types::TxnId;
///
/// let txn = TxnId::new(1);
/// assert!(txn.is_valid());
/// assert!(!TxnId::INVALID.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction ID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Minimum valid transaction ID.
    pub const MIN: Self = Self(1);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid transaction ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the next transaction ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Log Sequence Number - orders WAL records.
///
/// LSNs are assigned densely starting at [`Lsn::FIRST`]; every page stores
/// the LSN of the last record that modified it.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN, also the LSN of a page that was never logged.
    pub const INVALID: Self = Self(0);

    /// First LSN handed out by a log.
    pub const FIRST: Self = Self(1);

    /// Creates a new `Lsn` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the following LSN.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

/// Relation identifier - names one SortHeap table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RelationId(u32);

impl RelationId {
    /// Creates a new `RelationId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationId({})", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id() {
        let block = BlockId::new(42);
        assert_eq!(block.as_u64(), 42);
        assert!(block.is_valid());
        assert!(!BlockId::INVALID.is_valid());
        assert_eq!(block.offset(8192), 42 * 8192);
        assert_eq!(format!("{:?}", BlockId::INVALID), "BlockId(INVALID)");
        assert_eq!(BlockId::default(), BlockId::INVALID);
        assert_ne!(BlockId::default(), BlockId::META);
    }

    #[test]
    fn test_txn_id_ordering() {
        let t1 = TxnId::new(1);
        let t2 = t1.next();
        assert!(t1 < t2);
        assert!(!TxnId::INVALID.is_valid());
        assert_eq!(t2.to_string(), "2");
    }

    #[test]
    fn test_lsn() {
        assert!(!Lsn::INVALID.is_valid());
        assert_eq!(Lsn::FIRST.next(), Lsn::new(2));
        assert_eq!(Lsn::default(), Lsn::INVALID);
    }

    #[test]
    fn test_serde_roundtrip() {
        let block = BlockId::new(7);
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(json, "7");
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }
}
