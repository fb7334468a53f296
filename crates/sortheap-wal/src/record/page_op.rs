//! Physiological page operations.
//!
//! A `PageOp` names one block and one mutation of it. The same value is
//! applied to the in-memory page on the forward path and replayed from the
//! log during recovery, so the encoding here is the only description of a
//! page change that exists.

use bytes::{Buf, BufMut, Bytes};
use sortheap_common::types::{BlockId, BlockType};

use crate::error::{WalError, WalResult};

/// One page mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    /// Format a block as an empty page of the given type.
    Init { block: BlockId, block_type: BlockType },
    /// Append a record to a slotted page.
    SlotAppend { block: BlockId, data: Bytes },
    /// Replace a record in place (same length).
    SlotOverwrite { block: BlockId, slot: u16, data: Bytes },
    /// Drop every slot at or after `keep`.
    SlotTruncate { block: BlockId, keep: u16 },
    /// Set the forward chain pointer.
    SetNext { block: BlockId, next: BlockId },
    /// Set the backward chain pointer.
    SetPrev { block: BlockId, prev: BlockId },
    /// Flip one allocator bitmap bit.
    BitmapSet { block: BlockId, bit: u32, allocated: bool },
    /// Write one allocator root entry.
    AllocRootSet {
        block: BlockId,
        index: u32,
        leaf: BlockId,
        free: u32,
    },
    /// Replace the structured body of a fixed-layout page.
    BodyWrite {
        block: BlockId,
        block_type: BlockType,
        body: Bytes,
    },
}

const TAG_INIT: u8 = 1;
const TAG_SLOT_APPEND: u8 = 2;
const TAG_SLOT_OVERWRITE: u8 = 3;
const TAG_SLOT_TRUNCATE: u8 = 4;
const TAG_SET_NEXT: u8 = 5;
const TAG_SET_PREV: u8 = 6;
const TAG_BITMAP_SET: u8 = 7;
const TAG_ALLOC_ROOT_SET: u8 = 8;
const TAG_BODY_WRITE: u8 = 9;

impl PageOp {
    /// Returns the block this op modifies.
    pub fn block(&self) -> BlockId {
        match self {
            Self::Init { block, .. }
            | Self::SlotAppend { block, .. }
            | Self::SlotOverwrite { block, .. }
            | Self::SlotTruncate { block, .. }
            | Self::SetNext { block, .. }
            | Self::SetPrev { block, .. }
            | Self::BitmapSet { block, .. }
            | Self::AllocRootSet { block, .. }
            | Self::BodyWrite { block, .. } => *block,
        }
    }

    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::SlotAppend { .. } => "slot_append",
            Self::SlotOverwrite { .. } => "slot_overwrite",
            Self::SlotTruncate { .. } => "slot_truncate",
            Self::SetNext { .. } => "set_next",
            Self::SetPrev { .. } => "set_prev",
            Self::BitmapSet { .. } => "bitmap_set",
            Self::AllocRootSet { .. } => "alloc_root_set",
            Self::BodyWrite { .. } => "body_write",
        }
    }

    /// Returns the number of bytes `serialize` will produce.
    pub fn encoded_len(&self) -> usize {
        1 + 8
            + match self {
                Self::Init { .. } => 1,
                Self::SlotAppend { data, .. } => 4 + data.len(),
                Self::SlotOverwrite { data, .. } => 2 + 4 + data.len(),
                Self::SlotTruncate { .. } => 2,
                Self::SetNext { .. } | Self::SetPrev { .. } => 8,
                Self::BitmapSet { .. } => 5,
                Self::AllocRootSet { .. } => 16,
                Self::BodyWrite { body, .. } => 1 + 4 + body.len(),
            }
    }

    /// Serializes the op.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Self::Init { block, block_type } => {
                buf.put_u8(TAG_INIT);
                buf.put_u64(block.as_u64());
                buf.put_u8(block_type.as_u8());
            }
            Self::SlotAppend { block, data } => {
                buf.put_u8(TAG_SLOT_APPEND);
                buf.put_u64(block.as_u64());
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Self::SlotOverwrite { block, slot, data } => {
                buf.put_u8(TAG_SLOT_OVERWRITE);
                buf.put_u64(block.as_u64());
                buf.put_u16(*slot);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Self::SlotTruncate { block, keep } => {
                buf.put_u8(TAG_SLOT_TRUNCATE);
                buf.put_u64(block.as_u64());
                buf.put_u16(*keep);
            }
            Self::SetNext { block, next } => {
                buf.put_u8(TAG_SET_NEXT);
                buf.put_u64(block.as_u64());
                buf.put_u64(next.as_u64());
            }
            Self::SetPrev { block, prev } => {
                buf.put_u8(TAG_SET_PREV);
                buf.put_u64(block.as_u64());
                buf.put_u64(prev.as_u64());
            }
            Self::BitmapSet {
                block,
                bit,
                allocated,
            } => {
                buf.put_u8(TAG_BITMAP_SET);
                buf.put_u64(block.as_u64());
                buf.put_u32(*bit);
                buf.put_u8(u8::from(*allocated));
            }
            Self::AllocRootSet {
                block,
                index,
                leaf,
                free,
            } => {
                buf.put_u8(TAG_ALLOC_ROOT_SET);
                buf.put_u64(block.as_u64());
                buf.put_u32(*index);
                buf.put_u64(leaf.as_u64());
                buf.put_u32(*free);
            }
            Self::BodyWrite {
                block,
                block_type,
                body,
            } => {
                buf.put_u8(TAG_BODY_WRITE);
                buf.put_u64(block.as_u64());
                buf.put_u8(block_type.as_u8());
                buf.put_u32(body.len() as u32);
                buf.put_slice(body);
            }
        }
    }

    /// Deserializes one op from the front of `buf`.
    pub fn deserialize(buf: &mut Bytes) -> WalResult<Self> {
        need(buf, 9, "page op header")?;
        let tag = buf.get_u8();
        let block = BlockId::new(buf.get_u64());
        let op = match tag {
            TAG_INIT => {
                need(buf, 1, "init")?;
                Self::Init {
                    block,
                    block_type: block_type(buf.get_u8())?,
                }
            }
            TAG_SLOT_APPEND => {
                let data = take_bytes(buf, "slot append")?;
                Self::SlotAppend { block, data }
            }
            TAG_SLOT_OVERWRITE => {
                need(buf, 2, "slot overwrite")?;
                let slot = buf.get_u16();
                let data = take_bytes(buf, "slot overwrite")?;
                Self::SlotOverwrite { block, slot, data }
            }
            TAG_SLOT_TRUNCATE => {
                need(buf, 2, "slot truncate")?;
                Self::SlotTruncate {
                    block,
                    keep: buf.get_u16(),
                }
            }
            TAG_SET_NEXT => {
                need(buf, 8, "set next")?;
                Self::SetNext {
                    block,
                    next: BlockId::new(buf.get_u64()),
                }
            }
            TAG_SET_PREV => {
                need(buf, 8, "set prev")?;
                Self::SetPrev {
                    block,
                    prev: BlockId::new(buf.get_u64()),
                }
            }
            TAG_BITMAP_SET => {
                need(buf, 5, "bitmap set")?;
                let bit = buf.get_u32();
                let allocated = buf.get_u8() != 0;
                Self::BitmapSet {
                    block,
                    bit,
                    allocated,
                }
            }
            TAG_ALLOC_ROOT_SET => {
                need(buf, 16, "alloc root set")?;
                Self::AllocRootSet {
                    block,
                    index: buf.get_u32(),
                    leaf: BlockId::new(buf.get_u64()),
                    free: buf.get_u32(),
                }
            }
            TAG_BODY_WRITE => {
                need(buf, 1, "body write")?;
                let block_type = block_type(buf.get_u8())?;
                let body = take_bytes(buf, "body write")?;
                Self::BodyWrite {
                    block,
                    block_type,
                    body,
                }
            }
            other => {
                return Err(WalError::deserialization_error(format!(
                    "unknown page op tag {other}"
                )))
            }
        };
        Ok(op)
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> WalResult<()> {
    if buf.remaining() < n {
        return Err(WalError::deserialization_error(format!("{what} truncated")));
    }
    Ok(())
}

fn take_bytes(buf: &mut Bytes, what: &str) -> WalResult<Bytes> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

fn block_type(raw: u8) -> WalResult<BlockType> {
    BlockType::from_u8(raw)
        .ok_or_else(|| WalError::deserialization_error(format!("unknown block type {raw}")))
}
