//! Tape header block contents.

use bytes::{Buf, BufMut};
use sortheap_common::types::{BlockId, RowLocator};

use crate::error::{StorageError, StorageResult};

const HEADER_VERSION: u8 = 1;
const FIXED_SIZE: usize = 1 + 8 * 6 + RowLocator::ENCODED_SIZE + 4 * 5 + 2;

/// The structured body of a tape header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeHeaderData {
    /// First data block of the chain.
    pub first_data: BlockId,
    /// Last data block of the chain.
    pub last_data: BlockId,
    /// End marker of the last committed run.
    pub committed_tail: RowLocator,
    /// Number of committed runs.
    pub run_count: u32,
    /// First run-index page.
    pub run_index_head: BlockId,
    /// Run-index page receiving new entries.
    pub run_index_tail: BlockId,
    /// First page of the allocated-blocks chain.
    pub aux_head: BlockId,
    /// Page receiving new allocated-block records.
    pub aux_tail: BlockId,
    /// Allocated-block records written so far.
    pub aux_records: u32,
    /// Allocated-block records already recycled by vacuum.
    pub vacuumed: u32,
    /// Size of the next preallocation batch.
    pub batch_size: u32,
    /// Largest preallocation batch.
    pub prealloc_cap: u32,
    /// Preallocated blocks not yet handed out, ascending.
    pub prealloc: Vec<BlockId>,
}

impl TapeHeaderData {
    /// State of a freshly created tape whose first aux page is `aux`.
    pub fn new(aux: BlockId, prealloc_start: u32, prealloc_cap: u32) -> Self {
        Self {
            first_data: BlockId::INVALID,
            last_data: BlockId::INVALID,
            committed_tail: RowLocator::INVALID,
            run_count: 0,
            run_index_head: BlockId::INVALID,
            run_index_tail: BlockId::INVALID,
            aux_head: aux,
            aux_tail: aux,
            aux_records: 0,
            vacuumed: 0,
            batch_size: prealloc_start.max(1),
            prealloc_cap: prealloc_cap.max(1),
            prealloc: Vec::new(),
        }
    }

    /// Returns true once vacuum has recycled every recorded block.
    pub fn fully_vacuumed(&self) -> bool {
        self.vacuumed >= self.aux_records
    }

    /// Encodes the header body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_SIZE + self.prealloc.len() * 8);
        out.put_u8(HEADER_VERSION);
        out.put_u64_le(self.first_data.as_u64());
        out.put_u64_le(self.last_data.as_u64());
        out.put_slice(&self.committed_tail.to_bytes());
        out.put_u32_le(self.run_count);
        out.put_u64_le(self.run_index_head.as_u64());
        out.put_u64_le(self.run_index_tail.as_u64());
        out.put_u64_le(self.aux_head.as_u64());
        out.put_u64_le(self.aux_tail.as_u64());
        out.put_u32_le(self.aux_records);
        out.put_u32_le(self.vacuumed);
        out.put_u32_le(self.batch_size);
        out.put_u32_le(self.prealloc_cap);
        out.put_u16_le(self.prealloc.len() as u16);
        for block in &self.prealloc {
            out.put_u64_le(block.as_u64());
        }
        out
    }

    /// Decodes a header body of the tape at `block`.
    pub fn decode(block: BlockId, mut buf: &[u8]) -> StorageResult<Self> {
        if buf.remaining() < FIXED_SIZE {
            return Err(StorageError::corrupted(block, "truncated tape header"));
        }
        let version = buf.get_u8();
        if version != HEADER_VERSION {
            return Err(StorageError::corrupted(
                block,
                format!("unsupported tape header version {version}"),
            ));
        }
        let first_data = BlockId::new(buf.get_u64_le());
        let last_data = BlockId::new(buf.get_u64_le());
        let committed_tail = RowLocator::from_bytes(buf)
            .ok_or_else(|| StorageError::corrupted(block, "truncated tape header"))?;
        buf.advance(RowLocator::ENCODED_SIZE);
        let run_count = buf.get_u32_le();
        let run_index_head = BlockId::new(buf.get_u64_le());
        let run_index_tail = BlockId::new(buf.get_u64_le());
        let aux_head = BlockId::new(buf.get_u64_le());
        let aux_tail = BlockId::new(buf.get_u64_le());
        let aux_records = buf.get_u32_le();
        let vacuumed = buf.get_u32_le();
        let batch_size = buf.get_u32_le();
        let prealloc_cap = buf.get_u32_le();
        let cached = buf.get_u16_le() as usize;
        if buf.remaining() < cached * 8 {
            return Err(StorageError::corrupted(block, "truncated preallocation list"));
        }
        let prealloc = (0..cached).map(|_| BlockId::new(buf.get_u64_le())).collect();
        Ok(Self {
            first_data,
            last_data,
            committed_tail,
            run_count,
            run_index_head,
            run_index_tail,
            aux_head,
            aux_tail,
            aux_records,
            vacuumed,
            batch_size,
            prealloc_cap,
            prealloc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut state = TapeHeaderData::new(BlockId::new(8), 4, 64);
        state.first_data = BlockId::new(10);
        state.committed_tail = RowLocator::new(BlockId::new(12), 7);
        state.prealloc = vec![BlockId::new(13), BlockId::new(14)];
        state.aux_records = 2;

        let bytes = state.encode();
        let decoded = TapeHeaderData::decode(BlockId::new(7), &bytes).unwrap();
        assert_eq!(decoded, state);
        assert!(!decoded.fully_vacuumed());
        assert!(TapeHeaderData::decode(BlockId::new(7), &bytes[..bytes.len() - 3]).is_err());
    }
}
