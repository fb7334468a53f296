//! Run writer.

use bytes::Bytes;
use sortheap_common::constants::{PAGE_HEADER_SIZE, SLOT_SIZE};
use sortheap_common::types::{BlockId, BlockType, RowLocator, TxnId};
use sortheap_wal::PageOp;
use tracing::debug;

use super::blob::BlobSink;
use super::header::TapeHeaderData;
use super::run::RunMeta;
use super::tuple::{encode_tuple, TupleFlags};
use super::Tape;
use crate::buffer::MiniTxn;
use crate::error::{StorageError, StorageResult};
use crate::page::{max_record_size, SlottedPage};

/// Appends one run to a tape.
///
/// Tuples destined for the current data page are kept in memory and written
/// in one mini-transaction when the page fills, so locators are known as
/// soon as a tuple is accepted. Nothing becomes part of the tape until
/// [`finish`](TapeWriter::finish) commits the run; a writer dropped before
/// that leaves a tail the next [`Tape::begin_run`] cuts off.
#[derive(Debug)]
pub struct TapeWriter<'a> {
    tape: Tape<'a>,
    txn: TxnId,
    current: Option<BlockId>,
    room: usize,
    next_slot: u16,
    pending: Vec<Bytes>,
    first: RowLocator,
    last: RowLocator,
    tuples: u64,
    data_blocks: u32,
}

impl<'a> TapeWriter<'a> {
    pub(crate) fn new(
        tape: Tape<'a>,
        txn: TxnId,
        current: Option<BlockId>,
        room: usize,
        next_slot: u16,
    ) -> Self {
        Self {
            tape,
            txn,
            current,
            room,
            next_slot,
            pending: Vec::new(),
            first: RowLocator::INVALID,
            last: RowLocator::INVALID,
            tuples: 0,
            data_blocks: u32::from(current.is_some()),
        }
    }

    /// The tape being written.
    pub fn tape(&self) -> &Tape<'a> {
        &self.tape
    }

    /// Transaction the writes are logged under.
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Tuples accepted so far.
    pub fn tuples(&self) -> u64 {
        self.tuples
    }

    /// Largest tuple payload a data page can hold.
    pub fn max_payload(&self) -> usize {
        max_record_size(self.tape.pool().block_size()) - 1
    }

    /// Accepts a tuple and returns where it will live.
    pub fn write_tuple(&mut self, flags: TupleFlags, payload: &[u8]) -> StorageResult<RowLocator> {
        if payload.len() > self.max_payload() {
            return Err(StorageError::RowTooLarge {
                size: payload.len() + 1,
                max_size: self.max_payload() + 1,
            });
        }
        let record = encode_tuple(flags, payload);
        if self.current.is_none() || record.len() + SLOT_SIZE > self.room {
            let mut mtr = self.tape.pool().begin(self.txn)?;
            let mut state = self.tape.load_in(&mut mtr)?;
            self.roll(&mut mtr, &mut state)?;
            self.tape.store_in(&mut mtr, &state)?;
            mtr.commit()?;
        }
        let locator = self.place(record)?;
        if !flags.contains(TupleFlags::END_OF_RUN) {
            if !self.first.is_valid() {
                self.first = locator;
            }
            self.last = locator;
            self.tuples += 1;
        }
        Ok(locator)
    }

    fn place(&mut self, record: Bytes) -> StorageResult<RowLocator> {
        let block = self
            .current
            .ok_or_else(|| StorageError::invalid_argument("tape writer has no current page"))?;
        let locator = RowLocator::new(block, self.next_slot);
        self.next_slot += 1;
        self.room -= record.len() + SLOT_SIZE;
        self.pending.push(record);
        Ok(locator)
    }

    fn flush_pending(&mut self, mtr: &mut MiniTxn<'_>) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let block = self
            .current
            .ok_or_else(|| StorageError::invalid_argument("tape writer has no current page"))?;
        for data in self.pending.drain(..) {
            mtr.apply(PageOp::SlotAppend { block, data })?;
        }
        Ok(())
    }

    /// Writes out the current page and moves to a fresh data block.
    fn roll(&mut self, mtr: &mut MiniTxn<'_>, state: &mut TapeHeaderData) -> StorageResult<()> {
        if let Some(block) = self.current {
            mtr.page_typed(block, BlockType::Data)?;
        }
        self.flush_pending(mtr)?;
        let block = self.tape.extend(mtr, state, BlockType::Data)?;
        self.current = Some(block);
        self.next_slot = 0;
        self.room = self.tape.pool().block_size() - PAGE_HEADER_SIZE;
        self.data_blocks += 1;
        Ok(())
    }

    /// Writes `records` into a fresh chain of `block_type` pages, each
    /// filled to at most `fill_percent` of its capacity (always at least one
    /// record). Returns each page with the index of its first record.
    pub fn write_chain(
        &mut self,
        block_type: BlockType,
        records: &[Bytes],
        fill_percent: u8,
    ) -> StorageResult<Vec<(BlockId, usize)>> {
        let block_size = self.tape.pool().block_size();
        let capacity = block_size - PAGE_HEADER_SIZE;
        let limit = capacity * usize::from(fill_percent.clamp(10, 100)) / 100;
        let max = max_record_size(block_size);
        if let Some(too_large) = records.iter().find(|r| r.len() > max) {
            return Err(StorageError::RowTooLarge {
                size: too_large.len(),
                max_size: max,
            });
        }

        let mut pages = Vec::new();
        let mut prev = BlockId::INVALID;
        let mut next = 0usize;
        while next < records.len() {
            let mut mtr = self.tape.pool().begin(self.txn)?;
            let mut state = self.tape.load_in(&mut mtr)?;
            if prev.is_valid() {
                mtr.page_typed(prev, block_type)?;
            }
            let block = self.tape.extend(&mut mtr, &mut state, block_type)?;
            let start = next;
            let mut used = 0usize;
            while next < records.len() {
                let len = records[next].len() + SLOT_SIZE;
                if next > start && used + len > limit {
                    break;
                }
                mtr.apply(PageOp::SlotAppend {
                    block,
                    data: records[next].clone(),
                })?;
                used += len;
                next += 1;
            }
            if prev.is_valid() {
                mtr.apply(PageOp::SetNext { block: prev, next: block })?;
                mtr.apply(PageOp::SetPrev { block, prev })?;
            }
            self.tape.store_in(&mut mtr, &state)?;
            mtr.commit()?;
            pages.push((block, start));
            prev = block;
        }
        Ok(pages)
    }

    /// Writes the end marker and commits the run in `mtr`.
    ///
    /// The caller fills in the logical fields of `meta` (origin, cycle,
    /// xmin, rows, index anchors, summary); the writer fills in run number,
    /// locators and block count, appends the entry to the run index and
    /// records the new committed tail in the header.
    pub fn finish(mut self, mtr: &mut MiniTxn<'_>, mut meta: RunMeta) -> StorageResult<RunMeta> {
        let mut state = self.tape.load_in(mtr)?;
        let end_record = encode_tuple(TupleFlags::END_OF_RUN, &[]);
        if self.current.is_none() || end_record.len() + SLOT_SIZE > self.room {
            self.roll(mtr, &mut state)?;
        } else if let Some(block) = self.current {
            mtr.page_typed(block, BlockType::Data)?;
        }
        let end = self.place(end_record)?;
        self.flush_pending(mtr)?;

        meta.run_no = state.run_count;
        meta.first = if self.first.is_valid() { self.first } else { end };
        meta.last = self.last;
        meta.end = end;
        meta.data_blocks = self.data_blocks.max(1);

        let block_size = self.tape.pool().block_size();
        let entry = Bytes::from(meta.encode_bounded(max_record_size(block_size)));
        let tail = state.run_index_tail;
        let tail_fits = tail.is_valid()
            && SlottedPage::new(mtr.page_typed(tail, BlockType::RunIndex)?).fits(entry.len());
        if !tail_fits {
            let block = self.tape.extend(mtr, &mut state, BlockType::RunIndex)?;
            if tail.is_valid() {
                mtr.apply(PageOp::SetNext { block: tail, next: block })?;
                mtr.apply(PageOp::SetPrev { block, prev: tail })?;
            } else {
                state.run_index_head = block;
            }
            state.run_index_tail = block;
        }
        mtr.apply(PageOp::SlotAppend {
            block: state.run_index_tail,
            data: entry,
        })?;

        state.committed_tail = end;
        state.run_count += 1;
        self.tape.store_in(mtr, &state)?;
        debug!(
            tape = %self.tape.header_block(),
            run = meta.run_no,
            tuples = self.tuples,
            rows = meta.rows,
            blocks = meta.data_blocks,
            "committed run"
        );
        Ok(meta)
    }
}

impl BlobSink for TapeWriter<'_> {
    fn write_blob(&mut self, data: &[u8]) -> StorageResult<BlockId> {
        let chunk = max_record_size(self.tape.pool().block_size());
        let mut first = BlockId::INVALID;
        let mut prev = BlockId::INVALID;
        for piece in data.chunks(chunk) {
            let mut mtr = self.tape.pool().begin(self.txn)?;
            let mut state = self.tape.load_in(&mut mtr)?;
            if prev.is_valid() {
                mtr.page_typed(prev, BlockType::Overflow)?;
            }
            let block = self.tape.extend(&mut mtr, &mut state, BlockType::Overflow)?;
            mtr.apply(PageOp::SlotAppend {
                block,
                data: Bytes::copy_from_slice(piece),
            })?;
            if prev.is_valid() {
                mtr.apply(PageOp::SetNext { block: prev, next: block })?;
            } else {
                first = block;
            }
            self.tape.store_in(&mut mtr, &state)?;
            mtr.commit()?;
            prev = block;
        }
        Ok(first)
    }
}
