//! Tape I/O.
//!
//! A tape is a chain of data blocks holding runs one after another, plus the
//! bookkeeping that lets it be written, read and reclaimed:
//!
//! ```text
//! header ──▶ first_data ─▶ data ─▶ ... ─▶ last_data      (next/prev linked)
//!   │
//!   ├──▶ run index page ─▶ run index page                (RunMeta records)
//!   │
//!   └──▶ aux page ─▶ aux page                            (allocated block lists)
//! ```
//!
//! Blocks are handed out from a per-tape preallocation cache. Each refill
//! allocates a batch of blocks (doubling up to a cap) and records the whole
//! batch in the aux chain before any of them is used, so vacuum can reclaim
//! every block a tape ever owned, including blocks an interrupted writer
//! never linked.
//!
//! Within a mini-transaction the tape header is latched before any other
//! tape page, and tape pages before the allocator.

mod blob;
mod cursor;
mod header;
mod run;
mod tuple;
mod writer;

pub use blob::{read_blob, BlobSink, BlobSource};
pub use cursor::{RunCursor, ScanDirection};
pub use header::TapeHeaderData;
pub use run::{RunFlags, RunMeta, RunOrigin};
pub use tuple::{StoredTuple, TupleFlags};
pub use writer::TapeWriter;

use bytes::Bytes;
use sortheap_common::types::{BlockId, BlockType, RowLocator, TxnId};
use sortheap_wal::PageOp;
use tracing::{debug, trace};

use crate::alloc::{decode_block_list, encode_block_list, BlockAllocator};
use crate::buffer::{BufferPool, MiniTxn};
use crate::error::{StorageError, StorageResult};
use crate::page::{read_body, PageHeader, SlottedPage};

/// Handle to one tape of a relation.
#[derive(Debug, Clone, Copy)]
pub struct Tape<'a> {
    pool: &'a BufferPool,
    alloc: BlockAllocator,
    header: BlockId,
}

impl<'a> Tape<'a> {
    /// Creates an empty tape and returns its header block.
    pub fn create(
        mtr: &mut MiniTxn<'_>,
        alloc: &BlockAllocator,
        prealloc_start: usize,
        prealloc_cap: usize,
    ) -> StorageResult<BlockId> {
        let header = alloc.allocate(mtr)?;
        let aux = alloc.allocate(mtr)?;
        mtr.init(header, BlockType::TapeHeader)?;
        mtr.init(aux, BlockType::TapeAux)?;
        let state = TapeHeaderData::new(aux, prealloc_start as u32, prealloc_cap as u32);
        store_header(mtr, header, &state)?;
        debug!(tape = %header, aux = %aux, "created tape");
        Ok(header)
    }

    /// Opens the tape whose header is `header`.
    pub fn open(pool: &'a BufferPool, alloc: BlockAllocator, header: BlockId) -> Self {
        Self {
            pool,
            alloc,
            header,
        }
    }

    /// Header block.
    pub fn header_block(&self) -> BlockId {
        self.header
    }

    /// Buffer pool the tape reads through.
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    /// Reads the header without latching it for writing.
    pub fn load(&self) -> StorageResult<TapeHeaderData> {
        let page = self.pool.read_typed(self.header, BlockType::TapeHeader)?;
        TapeHeaderData::decode(self.header, read_body(&page)?)
    }

    /// Latches the header in `mtr` and decodes it.
    pub fn load_in(&self, mtr: &mut MiniTxn<'_>) -> StorageResult<TapeHeaderData> {
        let page = mtr.page_typed(self.header, BlockType::TapeHeader)?;
        TapeHeaderData::decode(self.header, read_body(page)?)
    }

    /// Writes the header back in `mtr`.
    pub fn store_in(&self, mtr: &mut MiniTxn<'_>, state: &TapeHeaderData) -> StorageResult<()> {
        store_header(mtr, self.header, state)
    }

    /// Hands out a new block of `block_type` from the preallocation cache.
    ///
    /// Data blocks are linked onto the end of the data chain; other types
    /// are left unlinked for the caller to chain.
    pub fn extend(
        &self,
        mtr: &mut MiniTxn<'_>,
        state: &mut TapeHeaderData,
        block_type: BlockType,
    ) -> StorageResult<BlockId> {
        if state.prealloc.is_empty() {
            self.refill(mtr, state)?;
        }
        let block = state.prealloc.remove(0);
        mtr.init(block, block_type)?;

        if block_type == BlockType::Data {
            if state.last_data.is_valid() {
                mtr.apply(PageOp::SetNext {
                    block: state.last_data,
                    next: block,
                })?;
                mtr.apply(PageOp::SetPrev {
                    block,
                    prev: state.last_data,
                })?;
            } else {
                state.first_data = block;
            }
            state.last_data = block;
        }
        trace!(tape = %self.header, %block, ?block_type, "extended tape");
        Ok(block)
    }

    fn refill(&self, mtr: &mut MiniTxn<'_>, state: &mut TapeHeaderData) -> StorageResult<()> {
        let batch = state.batch_size.max(1) as usize;
        let record_len = batch * 8;
        let tail_fits = SlottedPage::new(mtr.page_typed(state.aux_tail, BlockType::TapeAux)?)
            .fits(record_len);

        let mut blocks = Vec::with_capacity(batch);
        for _ in 0..batch {
            blocks.push(self.alloc.allocate(mtr)?);
        }
        if !tail_fits {
            let aux = self.alloc.allocate(mtr)?;
            mtr.init(aux, BlockType::TapeAux)?;
            mtr.apply(PageOp::SetNext {
                block: state.aux_tail,
                next: aux,
            })?;
            mtr.apply(PageOp::SetPrev {
                block: aux,
                prev: state.aux_tail,
            })?;
            state.aux_tail = aux;
        }
        mtr.apply(PageOp::SlotAppend {
            block: state.aux_tail,
            data: encode_block_list(&blocks),
        })?;
        state.aux_records += 1;

        blocks.sort_unstable();
        debug!(
            tape = %self.header,
            batch,
            first = %blocks[0],
            "refilled preallocation cache"
        );
        state.prealloc = blocks;
        state.batch_size = (state.batch_size.saturating_mul(2)).min(state.prealloc_cap).max(1);
        Ok(())
    }

    /// Starts writing a new run.
    ///
    /// Anything after the end marker of the last committed run is left over
    /// from an interrupted writer and is cut off first. Blocks it occupied
    /// stay recorded in the aux chain and are reclaimed by vacuum.
    pub fn begin_run(&self, txn: TxnId) -> StorageResult<TapeWriter<'a>> {
        let mut mtr = self.pool.begin(txn)?;
        let mut state = self.load_in(&mut mtr)?;
        let tail = state.committed_tail;
        let mut changed = false;

        if tail.is_valid() {
            let page = mtr.page_typed(tail.block, BlockType::Data)?;
            let count = SlottedPage::new(page).slot_count();
            let next = PageHeader::new(page).next();
            if count > tail.slot + 1 {
                mtr.apply(PageOp::SlotTruncate {
                    block: tail.block,
                    keep: tail.slot + 1,
                })?;
            }
            if next.is_valid() {
                mtr.apply(PageOp::SetNext {
                    block: tail.block,
                    next: BlockId::INVALID,
                })?;
            }
            if state.last_data != tail.block {
                state.last_data = tail.block;
                changed = true;
            }
            if count > tail.slot + 1 || next.is_valid() {
                debug!(tape = %self.header, tail = %tail, "discarded uncommitted tail");
            }
        } else if state.first_data.is_valid() {
            debug!(tape = %self.header, "discarded uncommitted first run");
            state.first_data = BlockId::INVALID;
            state.last_data = BlockId::INVALID;
            changed = true;
        }
        if changed {
            self.store_in(&mut mtr, &state)?;
        }
        mtr.commit()?;

        let (current, room, next_slot) = if state.last_data.is_valid() {
            let page = self.pool.read_typed(state.last_data, BlockType::Data)?;
            let header = PageHeader::new(&page[..]);
            (Some(state.last_data), header.free_space(), header.slot_count())
        } else {
            (None, 0, 0)
        };
        Ok(TapeWriter::new(*self, txn, current, room, next_slot))
    }

    /// Committed runs in write order.
    pub fn runs(&self) -> StorageResult<Vec<RunMeta>> {
        let state = self.load()?;
        let mut runs = Vec::with_capacity(state.run_count as usize);
        let mut block = state.run_index_head;
        while block.is_valid() {
            let page = self.pool.read_typed(block, BlockType::RunIndex)?;
            let slotted = SlottedPage::new(&page[..]);
            for record in slotted.records() {
                runs.push(RunMeta::decode(block, record)?);
            }
            block = PageHeader::new(&page[..]).next();
        }
        if runs.len() != state.run_count as usize {
            return Err(StorageError::corrupted(
                self.header,
                format!(
                    "run index holds {} entries, header counts {}",
                    runs.len(),
                    state.run_count
                ),
            ));
        }
        Ok(runs)
    }

    /// Opens a cursor over `run`.
    pub fn cursor(&self, run: &RunMeta, direction: ScanDirection) -> RunCursor<'a> {
        RunCursor::open(self.pool, run, direction)
    }

    /// Reads the tuple at `locator`, if the block is a data page holding it.
    pub fn fetch(&self, locator: RowLocator) -> StorageResult<Option<StoredTuple>> {
        fetch_tuple(self.pool, locator)
    }

    /// Every block the tape owns: header, aux pages and recorded blocks.
    pub fn allocated_blocks(&self) -> StorageResult<Vec<BlockId>> {
        let state = self.load()?;
        let mut blocks = vec![self.header];
        for (page, records) in self.aux_pages(state.aux_head)? {
            blocks.push(page);
            for record in records {
                blocks.extend(record);
            }
        }
        Ok(blocks)
    }

    fn aux_pages(&self, head: BlockId) -> StorageResult<Vec<(BlockId, Vec<Vec<BlockId>>)>> {
        let mut pages = Vec::new();
        let mut block = head;
        while block.is_valid() {
            let page = self.pool.read_typed(block, BlockType::TapeAux)?;
            let records = SlottedPage::new(&page[..])
                .records()
                .map(decode_block_list)
                .collect::<StorageResult<Vec<_>>>()?;
            pages.push((block, records));
            block = PageHeader::new(&page[..]).next();
        }
        Ok(pages)
    }

    /// Recycles the blocks of up to `max_records` aux records not yet
    /// recycled. Returns true once every recorded block is free.
    ///
    /// Progress is kept in the header, so a step interrupted by a crash is
    /// simply repeated.
    pub fn vacuum_step(&self, mtr: &mut MiniTxn<'_>, max_records: usize) -> StorageResult<bool> {
        let mut state = self.load_in(mtr)?;
        if state.fully_vacuumed() {
            return Ok(true);
        }
        let records: Vec<Vec<BlockId>> = self
            .aux_pages(state.aux_head)?
            .into_iter()
            .flat_map(|(_, records)| records)
            .skip(state.vacuumed as usize)
            .take(max_records.max(1))
            .collect();

        let mut recycled = 0usize;
        for block in records.iter().flatten() {
            self.alloc.recycle(mtr, *block)?;
            recycled += 1;
        }
        state.vacuumed += records.len() as u32;
        state.prealloc.clear();
        self.store_in(mtr, &state)?;
        debug!(
            tape = %self.header,
            records = records.len(),
            blocks = recycled,
            remaining = state.aux_records - state.vacuumed,
            "recycled tape blocks"
        );
        Ok(state.fully_vacuumed())
    }

    /// Recycles the aux pages and the header once every recorded block is
    /// free. Returns the number of blocks recycled.
    pub fn release(&self, mtr: &mut MiniTxn<'_>) -> StorageResult<usize> {
        let state = self.load_in(mtr)?;
        if !state.fully_vacuumed() {
            return Err(StorageError::invalid_argument(format!(
                "tape {} still owns {} unrecycled block records",
                self.header,
                state.aux_records - state.vacuumed
            )));
        }
        let pages: Vec<BlockId> = self
            .aux_pages(state.aux_head)?
            .into_iter()
            .map(|(block, _)| block)
            .collect();
        for block in &pages {
            self.alloc.recycle(mtr, *block)?;
        }
        self.alloc.recycle(mtr, self.header)?;
        debug!(tape = %self.header, aux_pages = pages.len(), "released tape");
        Ok(pages.len() + 1)
    }
}

fn store_header(mtr: &mut MiniTxn<'_>, header: BlockId, state: &TapeHeaderData) -> StorageResult<()> {
    mtr.apply(PageOp::BodyWrite {
        block: header,
        block_type: BlockType::TapeHeader,
        body: Bytes::from(state.encode()),
    })
}

/// Reads the tuple at `locator` through `pool`.
///
/// Returns `None` if the block is not a data page or the slot is past its
/// end.
pub fn fetch_tuple(pool: &BufferPool, locator: RowLocator) -> StorageResult<Option<StoredTuple>> {
    if !locator.is_valid() {
        return Ok(None);
    }
    let guard = pool.read(locator.block)?;
    let header = PageHeader::new(&guard[..]);
    if !header.is_valid_magic() || header.block_type() != Some(BlockType::Data) {
        return Ok(None);
    }
    if locator.slot >= header.slot_count() {
        return Ok(None);
    }
    let page = Bytes::copy_from_slice(&guard);
    drop(guard);
    let slotted = SlottedPage::new(&page[..]);
    let record = slotted.record(locator.slot)?;
    StoredTuple::parse(RowLocator::new(locator.block, locator.slot), &page, record).map(Some)
}
