//! TapeSet state.
//!
//! A TapeSet is one polyphase sort instance: `T` tape slots, the Algorithm D
//! bookkeeping for them, and the status that says which runs readers use.
//! The whole state lives in the body of the TapeSet block and is replaced in
//! the same mini-transaction as the run or tape change it describes, so a
//! reader latching the block always sees state and tapes agree.
//!
//! ```text
//!   Initial ──▶ BuildingRuns ──▶ MergedUnvacuumed ──▶ MergedVacuumed
//!                    ▲                                      │
//!                    └──────────────────────────────────────┘
//! ```

/// Polyphase merge planning
pub mod polyphase;

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use serde::Serialize;
use sortheap_common::types::{BlockId, BlockType, TxnId};
use sortheap_storage::buffer::{BufferPool, MiniTxn};
use sortheap_storage::page::read_body;
use sortheap_storage::StorageError;
use sortheap_wal::PageOp;

use crate::error::{EngineError, EngineResult};

pub use polyphase::{MergeStep, StepInput};

const STATE_VERSION: u8 = 1;
const FLAG_MERGING: u8 = 0b0000_0001;
const FLAG_MERGE_WORTHWHILE: u8 = 0b0000_0010;
const FIXED_SIZE: usize = 1 + 1 + 1 + 4 * 4 + 2 + 8 * 5 + 4 + 2;
const SLOT_SIZE: usize = 8 + 4 * 4;

/// Lifecycle of a TapeSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TapeSetStatus {
    /// No run written yet.
    Initial = 0,
    /// Accepting dumps.
    BuildingRuns = 1,
    /// Every run merged onto the result tape; old tapes not reclaimed.
    MergedUnvacuumed = 2,
    /// Old tapes reclaimed; the result run is the base of the next cycle.
    MergedVacuumed = 3,
}

impl TapeSetStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initial),
            1 => Some(Self::BuildingRuns),
            2 => Some(Self::MergedUnvacuumed),
            3 => Some(Self::MergedVacuumed),
            _ => None,
        }
    }

    /// Returns true if `next` directly follows `self`.
    pub fn can_advance_to(self, next: TapeSetStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initial, Self::BuildingRuns)
                | (Self::BuildingRuns, Self::MergedUnvacuumed)
                | (Self::MergedUnvacuumed, Self::MergedVacuumed)
                | (Self::MergedVacuumed, Self::BuildingRuns)
        )
    }

    /// Returns true once a merge result exists.
    pub fn is_merged(self) -> bool {
        matches!(self, Self::MergedUnvacuumed | Self::MergedVacuumed)
    }
}

impl fmt::Display for TapeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::BuildingRuns => "building_runs",
            Self::MergedUnvacuumed => "merged_unvacuumed",
            Self::MergedVacuumed => "merged_vacuumed",
        };
        f.write_str(name)
    }
}

/// One tape slot and its Algorithm D counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TapeSlot {
    /// Tape header; `INVALID` until the slot first receives a run.
    pub header: BlockId,
    /// Real runs not yet merged.
    pub runs: u32,
    /// Dummy runs.
    pub dummy: u32,
    /// Target run count of the current level (Knuth's `A[j]`).
    pub fib: u32,
    /// Position on the tape of the next unread run.
    pub consumed: u32,
}

impl TapeSlot {
    /// An unused slot.
    pub fn empty() -> Self {
        Self {
            header: BlockId::INVALID,
            ..Self::default()
        }
    }
}

/// A run addressed by tape and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RunRef {
    /// Tape header block.
    pub tape: BlockId,
    /// Position of the run on the tape.
    pub run_no: u32,
}

/// Decoded body of a TapeSet block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeSetState {
    /// Lifecycle status.
    pub status: TapeSetStatus,
    /// Incremented every time a merged TapeSet starts building runs again.
    pub cycle: u32,
    /// Polyphase level.
    pub level: u32,
    /// Slot receiving the next dump.
    pub dest: usize,
    /// Runs dumped in this cycle.
    pub dumps: u32,
    /// A merge of this cycle has started and not finished.
    pub merging: bool,
    /// The level reached the merge trigger.
    pub merge_worthwhile: bool,
    /// Tape holding the merge result; `INVALID` before the final pass.
    pub result: BlockId,
    /// Result run of the previous cycle, merged along with this cycle's dumps.
    pub base: Option<RunRef>,
    /// Most recent inserting transaction.
    pub last_insert_xid: TxnId,
    /// Transaction that produced the current merge result.
    pub last_merge_xid: TxnId,
    /// Transaction that last vacuumed the TapeSet.
    pub last_vacuum_xid: TxnId,
    /// Tape slots; the last one is the merge output.
    pub tapes: Vec<TapeSlot>,
}

impl TapeSetState {
    /// State of a TapeSet with `tapes` slots that has never been written.
    pub fn new(tapes: usize) -> Self {
        Self {
            status: TapeSetStatus::Initial,
            cycle: 0,
            level: 0,
            dest: 0,
            dumps: 0,
            merging: false,
            merge_worthwhile: false,
            result: BlockId::INVALID,
            base: None,
            last_insert_xid: TxnId::INVALID,
            last_merge_xid: TxnId::INVALID,
            last_vacuum_xid: TxnId::INVALID,
            tapes: vec![TapeSlot::empty(); tapes],
        }
    }

    /// Moves to `next`, refusing anything but the following status.
    pub fn advance_to(&mut self, next: TapeSetStatus, tapeset: usize) -> EngineResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(EngineError::InvalidTransition {
                tapeset,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Tape headers referenced by the state, result tape included.
    pub fn tape_headers(&self) -> impl Iterator<Item = BlockId> + '_ {
        let result = self.result;
        self.tapes
            .iter()
            .map(|slot| slot.header)
            .filter(|h| h.is_valid())
            .chain(
                std::iter::once(result)
                    .filter(move |h| h.is_valid() && !self.tapes.iter().any(|s| s.header == *h)),
            )
    }

    /// Encodes the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_SIZE + self.tapes.len() * SLOT_SIZE);
        out.put_u8(STATE_VERSION);
        out.put_u8(self.status as u8);
        let mut flags = 0;
        if self.merging {
            flags |= FLAG_MERGING;
        }
        if self.merge_worthwhile {
            flags |= FLAG_MERGE_WORTHWHILE;
        }
        out.put_u8(flags);
        out.put_u32_le(self.cycle);
        out.put_u32_le(self.level);
        out.put_u32_le(self.dumps);
        out.put_u32_le(self.base.map_or(u32::MAX, |b| b.run_no));
        out.put_u16_le(self.dest as u16);
        out.put_u64_le(self.result.as_u64());
        out.put_u64_le(self.base.map_or(BlockId::INVALID, |b| b.tape).as_u64());
        out.put_u64_le(self.last_insert_xid.as_u64());
        out.put_u64_le(self.last_merge_xid.as_u64());
        out.put_u64_le(self.last_vacuum_xid.as_u64());
        out.put_u32_le(0);
        out.put_u16_le(self.tapes.len() as u16);
        for slot in &self.tapes {
            out.put_u64_le(slot.header.as_u64());
            out.put_u32_le(slot.runs);
            out.put_u32_le(slot.dummy);
            out.put_u32_le(slot.fib);
            out.put_u32_le(slot.consumed);
        }
        out
    }

    /// Decodes the body of TapeSet block `block`.
    pub fn decode(block: BlockId, mut buf: &[u8]) -> EngineResult<Self> {
        let corrupt = |reason: String| EngineError::from(StorageError::corrupted(block, reason));
        if buf.remaining() < FIXED_SIZE {
            return Err(corrupt("truncated TapeSet state".into()));
        }
        let version = buf.get_u8();
        if version != STATE_VERSION {
            return Err(corrupt(format!("unsupported TapeSet version {version}")));
        }
        let raw = buf.get_u8();
        let status =
            TapeSetStatus::from_u8(raw).ok_or_else(|| corrupt(format!("unknown status {raw}")))?;
        let flags = buf.get_u8();
        let cycle = buf.get_u32_le();
        let level = buf.get_u32_le();
        let dumps = buf.get_u32_le();
        let base_run = buf.get_u32_le();
        let dest = buf.get_u16_le() as usize;
        let result = BlockId::new(buf.get_u64_le());
        let base_tape = BlockId::new(buf.get_u64_le());
        let last_insert_xid = TxnId::new(buf.get_u64_le());
        let last_merge_xid = TxnId::new(buf.get_u64_le());
        let last_vacuum_xid = TxnId::new(buf.get_u64_le());
        let _reserved = buf.get_u32_le();
        let count = buf.get_u16_le() as usize;
        if buf.remaining() != count * SLOT_SIZE {
            return Err(corrupt(format!(
                "{count} tape slots need {} bytes, {} left",
                count * SLOT_SIZE,
                buf.remaining()
            )));
        }
        if dest >= count.max(1) {
            return Err(corrupt(format!("destination slot {dest} of {count}")));
        }
        let tapes = (0..count)
            .map(|_| TapeSlot {
                header: BlockId::new(buf.get_u64_le()),
                runs: buf.get_u32_le(),
                dummy: buf.get_u32_le(),
                fib: buf.get_u32_le(),
                consumed: buf.get_u32_le(),
            })
            .collect();
        let base = base_tape.is_valid().then_some(RunRef {
            tape: base_tape,
            run_no: base_run,
        });
        Ok(Self {
            status,
            cycle,
            level,
            dest,
            dumps,
            merging: flags & FLAG_MERGING != 0,
            merge_worthwhile: flags & FLAG_MERGE_WORTHWHILE != 0,
            result,
            base,
            last_insert_xid,
            last_merge_xid,
            last_vacuum_xid,
            tapes,
        })
    }

    /// Reads TapeSet `block` without latching it for writing.
    pub fn load(pool: &BufferPool, block: BlockId) -> EngineResult<Self> {
        let page = pool.read_typed(block, BlockType::TapeSet)?;
        Self::decode(block, read_body(&page)?)
    }

    /// Latches TapeSet `block` in `mtr` and decodes it.
    pub fn load_in(mtr: &mut MiniTxn<'_>, block: BlockId) -> EngineResult<Self> {
        let page = mtr.page_typed(block, BlockType::TapeSet)?;
        Self::decode(block, read_body(page)?)
    }

    /// Writes the state to `block` in `mtr`.
    pub fn store_in(&self, mtr: &mut MiniTxn<'_>, block: BlockId) -> EngineResult<()> {
        mtr.apply(PageOp::BodyWrite {
            block,
            block_type: BlockType::TapeSet,
            body: Bytes::from(self.encode()),
        })?;
        Ok(())
    }
}
