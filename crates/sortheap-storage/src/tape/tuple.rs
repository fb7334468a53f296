//! Physical tuples as stored on data pages.
//!
//! ```text
//! +-------+----------------------+
//! | flags | payload              |
//! +-------+----------------------+
//!   u8      encoded row or group
//! ```

use bitflags::bitflags;
use bytes::Bytes;
use sortheap_common::types::RowLocator;

use crate::error::{StorageError, StorageResult};

bitflags! {
    /// Flags of a physical tuple.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TupleFlags: u8 {
        /// Marks the end of a run; carries no payload.
        const END_OF_RUN = 0b0000_0001;
        /// Payload is a compressed column group.
        const COMPRESSED = 0b0000_0010;
    }
}

/// A tuple read from a data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTuple {
    /// Where the tuple lives.
    pub locator: RowLocator,
    /// Tuple flags.
    pub flags: TupleFlags,
    /// Encoded row or group, sharing the page copy it was read from.
    pub payload: Bytes,
}

impl StoredTuple {
    /// Splits a record copied from `page` into flags and payload.
    pub(crate) fn parse(locator: RowLocator, page: &Bytes, record: &[u8]) -> StorageResult<Self> {
        let (&raw, payload) = record.split_first().ok_or_else(|| {
            StorageError::corrupted(locator.block, format!("empty tuple in slot {}", locator.slot))
        })?;
        let flags = TupleFlags::from_bits(raw).ok_or_else(|| {
            StorageError::corrupted(locator.block, format!("unknown tuple flags {raw:#04x}"))
        })?;
        Ok(Self {
            locator,
            flags,
            payload: page.slice_ref(payload),
        })
    }

    /// Returns true for the end-of-run marker.
    #[inline]
    pub fn is_end(&self) -> bool {
        self.flags.contains(TupleFlags::END_OF_RUN)
    }

    /// Returns true for a compressed group.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(TupleFlags::COMPRESSED)
    }
}

/// Builds the on-page record of a tuple.
pub(crate) fn encode_tuple(flags: TupleFlags, payload: &[u8]) -> Bytes {
    let mut record = Vec::with_capacity(1 + payload.len());
    record.push(flags.bits());
    record.extend_from_slice(payload);
    Bytes::from(record)
}
