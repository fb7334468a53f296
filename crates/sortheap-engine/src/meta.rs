//! Engine metadata block.
//!
//! Block 0 of a relation holds everything needed to open it:
//!
//! ```text
//! magic u64 | version u32 | relation u32 | flags u8 | tapes per set u16
//! | tapeset count u16 | tapeset block u64 ... | schema len u32 | schema
//! ```
//!
//! A TapeSet slot is `INVALID` until the first insert creates the TapeSet.

use bytes::{Buf, BufMut, Bytes};
use sortheap_common::constants::{META_FORMAT_VERSION, META_MAGIC};
use sortheap_common::types::{BlockId, BlockType, RelationId};
use sortheap_storage::buffer::{BufferPool, MiniTxn};
use sortheap_storage::page::{max_body_size, read_body};
use sortheap_storage::row::Schema;
use sortheap_storage::StorageError;
use sortheap_wal::PageOp;

use crate::error::{EngineError, EngineResult};

/// The metadata block.
pub const META_BLOCK: BlockId = BlockId::META;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Decoded contents of block 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaData {
    /// Relation the file belongs to.
    pub relation: RelationId,
    /// Runs are written by the compressed tuple format.
    pub compressed: bool,
    /// Tapes in every TapeSet.
    pub tapes_per_set: usize,
    /// TapeSet blocks; `INVALID` until created.
    pub tapesets: Vec<BlockId>,
    /// Row schema and sort key.
    pub schema: Schema,
}

impl MetaData {
    /// Metadata of a freshly created relation.
    pub fn new(
        relation: RelationId,
        schema: Schema,
        compressed: bool,
        tapes_per_set: usize,
        tapesets: usize,
    ) -> Self {
        Self {
            relation,
            compressed,
            tapes_per_set,
            tapesets: vec![BlockId::INVALID; tapesets],
            schema,
        }
    }

    /// Encodes the body.
    pub fn encode(&self) -> Vec<u8> {
        let schema = self.schema.encode();
        let mut out = Vec::with_capacity(32 + self.tapesets.len() * 8 + schema.len());
        out.put_u64_le(META_MAGIC);
        out.put_u32_le(META_FORMAT_VERSION);
        out.put_u32_le(self.relation.as_u32());
        out.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        out.put_u16_le(self.tapes_per_set as u16);
        out.put_u16_le(self.tapesets.len() as u16);
        for block in &self.tapesets {
            out.put_u64_le(block.as_u64());
        }
        out.put_u32_le(schema.len() as u32);
        out.put_slice(&schema);
        out
    }

    /// Decodes the body of block 0.
    pub fn decode(mut buf: &[u8]) -> EngineResult<Self> {
        let corrupt = |reason: String| EngineError::from(StorageError::corrupted(META_BLOCK, reason));
        if buf.remaining() < 25 {
            return Err(corrupt("truncated metadata".into()));
        }
        let magic = buf.get_u64_le();
        if magic != META_MAGIC {
            return Err(corrupt(format!("bad metadata magic {magic:#x}")));
        }
        let version = buf.get_u32_le();
        if version != META_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported metadata version {version}")));
        }
        let relation = RelationId::new(buf.get_u32_le());
        let flags = buf.get_u8();
        let tapes_per_set = buf.get_u16_le() as usize;
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < count * 8 + 4 {
            return Err(corrupt("truncated TapeSet table".into()));
        }
        let tapesets = (0..count).map(|_| BlockId::new(buf.get_u64_le())).collect();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() != len {
            return Err(corrupt(format!(
                "schema length {len}, {} bytes left",
                buf.remaining()
            )));
        }
        let schema = Schema::decode(buf)?;
        Ok(Self {
            relation,
            compressed: flags & FLAG_COMPRESSED != 0,
            tapes_per_set,
            tapesets,
            schema,
        })
    }

    /// Reads block 0 without latching it for writing.
    pub fn load(pool: &BufferPool) -> EngineResult<Self> {
        let page = pool.read_typed(META_BLOCK, BlockType::Meta)?;
        Self::decode(read_body(&page)?)
    }

    /// Latches block 0 in `mtr` and decodes it.
    pub fn load_in(mtr: &mut MiniTxn<'_>) -> EngineResult<Self> {
        let page = mtr.page_typed(META_BLOCK, BlockType::Meta)?;
        Self::decode(read_body(page)?)
    }

    /// Writes the body back in `mtr`.
    pub fn store_in(&self, mtr: &mut MiniTxn<'_>) -> EngineResult<()> {
        let body = self.encode();
        let max = max_body_size(mtr.pool().block_size());
        if body.len() > max {
            return Err(EngineError::invalid_argument(format!(
                "metadata of {} bytes exceeds the {max} byte block body",
                body.len()
            )));
        }
        mtr.apply(PageOp::BodyWrite {
            block: META_BLOCK,
            block_type: BlockType::Meta,
            body: Bytes::from(body),
        })?;
        Ok(())
    }
}
