//! Run metadata stored in run-index pages.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::Serialize;
use sortheap_common::types::{BlockId, RowLocator, TxnId};

use crate::error::{StorageError, StorageResult};
use crate::index::ColumnSummary;

const RUN_META_VERSION: u8 = 1;

/// How a run was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum RunOrigin {
    /// Sorted insert buffer.
    Dump = 1,
    /// Merge of other runs.
    Merge = 2,
}

impl RunOrigin {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Dump),
            2 => Some(Self::Merge),
            _ => None,
        }
    }
}

bitflags! {
    /// Run flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RunFlags: u8 {
        /// Run was written by the compressed tuple format.
        const COMPRESSED = 0b0000_0001;
        /// Whole-run summary did not fit and was dropped.
        const SUMMARY_DROPPED = 0b0000_0010;
    }
}

/// Metadata of one committed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMeta {
    /// Position of the run on its tape.
    pub run_no: u32,
    /// TapeSet cycle the run belongs to.
    pub cycle: u32,
    /// Dump or merge output.
    pub origin: RunOrigin,
    /// Transaction that created the run.
    pub xmin: TxnId,
    /// First tuple; the end marker for an empty run.
    pub first: RowLocator,
    /// Last tuple before the end marker; invalid for an empty run.
    pub last: RowLocator,
    /// End-of-run marker.
    pub end: RowLocator,
    /// Logical rows, compressed group members included.
    pub rows: u64,
    /// Data blocks the run touched.
    pub data_blocks: u32,
    /// B-tree root, invalid when no tree was built.
    pub btree_root: BlockId,
    /// B-tree height; 0 without a tree.
    pub btree_height: u16,
    /// First range-summary page, invalid when none was built.
    pub range_anchor: BlockId,
    /// Whole-run summary, one entry per column.
    pub summary: Vec<ColumnSummary>,
    /// Run flags.
    pub flags: RunFlags,
}

impl RunMeta {
    /// Metadata for a run about to be written.
    pub fn new(origin: RunOrigin, cycle: u32, xmin: TxnId) -> Self {
        Self {
            run_no: 0,
            cycle,
            origin,
            xmin,
            first: RowLocator::INVALID,
            last: RowLocator::INVALID,
            end: RowLocator::INVALID,
            rows: 0,
            data_blocks: 0,
            btree_root: BlockId::INVALID,
            btree_height: 0,
            range_anchor: BlockId::INVALID,
            summary: Vec::new(),
            flags: RunFlags::empty(),
        }
    }

    /// Returns true for a run without rows.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Returns true if the run holds compressed groups.
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(RunFlags::COMPRESSED)
    }

    /// Encodes the entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.put_u8(RUN_META_VERSION);
        out.put_u32_le(self.run_no);
        out.put_u32_le(self.cycle);
        out.put_u8(self.origin as u8);
        out.put_u64_le(self.xmin.as_u64());
        out.put_slice(&self.first.to_bytes());
        out.put_slice(&self.last.to_bytes());
        out.put_slice(&self.end.to_bytes());
        out.put_u64_le(self.rows);
        out.put_u32_le(self.data_blocks);
        out.put_u64_le(self.btree_root.as_u64());
        out.put_u16_le(self.btree_height);
        out.put_u64_le(self.range_anchor.as_u64());
        out.put_u8(self.flags.bits());
        out.put_u16_le(self.summary.len() as u16);
        for column in &self.summary {
            column.encode_into(&mut out);
        }
        out
    }

    /// Encodes the entry, dropping the whole-run summary if the result would
    /// exceed `max_len` bytes.
    pub fn encode_bounded(&mut self, max_len: usize) -> Vec<u8> {
        let encoded = self.encode();
        if encoded.len() <= max_len || self.summary.is_empty() {
            return encoded;
        }
        self.summary.clear();
        self.flags |= RunFlags::SUMMARY_DROPPED;
        self.encode()
    }

    /// Decodes an entry read from `block`.
    pub fn decode(block: BlockId, mut buf: &[u8]) -> StorageResult<Self> {
        const FIXED: usize = 1 + 4 + 4 + 1 + 8 + 3 * RowLocator::ENCODED_SIZE + 8 + 4 + 8 + 2 + 8 + 1 + 2;
        if buf.remaining() < FIXED {
            return Err(StorageError::corrupted(block, "truncated run metadata"));
        }
        let version = buf.get_u8();
        if version != RUN_META_VERSION {
            return Err(StorageError::corrupted(
                block,
                format!("unsupported run metadata version {version}"),
            ));
        }
        let run_no = buf.get_u32_le();
        let cycle = buf.get_u32_le();
        let origin_raw = buf.get_u8();
        let origin = RunOrigin::from_u8(origin_raw).ok_or_else(|| {
            StorageError::corrupted(block, format!("unknown run origin {origin_raw}"))
        })?;
        let xmin = TxnId::new(buf.get_u64_le());
        let mut locator = || {
            let loc = RowLocator::from_bytes(buf).unwrap_or(RowLocator::INVALID);
            buf.advance(RowLocator::ENCODED_SIZE);
            loc
        };
        let first = locator();
        let last = locator();
        let end = locator();
        let rows = buf.get_u64_le();
        let data_blocks = buf.get_u32_le();
        let btree_root = BlockId::new(buf.get_u64_le());
        let btree_height = buf.get_u16_le();
        let range_anchor = BlockId::new(buf.get_u64_le());
        let flags = RunFlags::from_bits_truncate(buf.get_u8());
        let columns = buf.get_u16_le() as usize;
        let mut summary = Vec::with_capacity(columns);
        for _ in 0..columns {
            summary.push(ColumnSummary::decode_from(&mut buf)?);
        }
        Ok(Self {
            run_no,
            cycle,
            origin,
            xmin,
            first,
            last,
            end,
            rows,
            data_blocks,
            btree_root,
            btree_height,
            range_anchor,
            summary,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn meta() -> RunMeta {
        let mut meta = RunMeta::new(RunOrigin::Merge, 3, TxnId::new(17));
        meta.run_no = 2;
        meta.first = RowLocator::new(BlockId::new(20), 0);
        meta.last = RowLocator::new(BlockId::new(29), 11);
        meta.end = RowLocator::new(BlockId::new(29), 12);
        meta.rows = 500;
        meta.btree_root = BlockId::new(31);
        meta.btree_height = 2;
        meta.summary = vec![ColumnSummary::from_bounds(Value::Int(1), Value::Int(900))];
        meta
    }

    #[test]
    fn test_encode_decode() {
        let meta = meta();
        let decoded = RunMeta::decode(BlockId::new(5), &meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_encode_bounded_drops_summary() {
        let mut meta = meta();
        meta.summary = vec![
            ColumnSummary::from_bounds(Value::Text("a".repeat(200)), Value::Text("z".repeat(200)));
            8
        ];
        let full = meta.encode().len();
        let bytes = meta.encode_bounded(full - 1);
        let decoded = RunMeta::decode(BlockId::new(5), &bytes).unwrap();
        assert!(decoded.summary.is_empty());
        assert!(decoded.flags.contains(RunFlags::SUMMARY_DROPPED));
    }
}
