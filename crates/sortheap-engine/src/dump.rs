//! Insert buffering and dumps.
//!
//! Rows collect in an [`InsertBuffer`] until the sort buffer limits are hit;
//! the buffer is then sorted and written as one run on whichever tape of the
//! chosen TapeSet polyphase distribution picks. The run and the TapeSet
//! bookkeeping that accounts for it are committed by one mini-transaction.

use std::sync::atomic::Ordering;
use std::thread;

use parking_lot::MutexGuard;
use sortheap_common::types::{BlockId, TxnId};
use sortheap_storage::page::max_record_size;
use sortheap_storage::row::{Row, SortTuple};
use sortheap_storage::tape::{RunMeta, RunOrigin, Tape};
use sortheap_storage::StorageError;
use sortheap_txn::InsertGuard;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::RunBuilder;
use crate::heap::{HeapCore, TapeSetHandle};
use crate::tapeset::{TapeSetState, TapeSetStatus};

/// Rows buffered by one inserting transaction.
#[derive(Debug)]
pub struct InsertBuffer {
    xid: TxnId,
    rows: Vec<Row>,
    bytes: usize,
    dumps: u64,
    inserted: u64,
}

impl InsertBuffer {
    /// Creates an empty buffer for transaction `xid`.
    pub fn new(xid: TxnId) -> Self {
        Self {
            xid,
            rows: Vec::new(),
            bytes: 0,
            dumps: 0,
            inserted: 0,
        }
    }

    /// Inserting transaction.
    pub fn xid(&self) -> TxnId {
        self.xid
    }

    /// Rows waiting for the next dump.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encoded size of the buffered rows.
    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// Runs dumped so far.
    pub fn dumps(&self) -> u64 {
        self.dumps
    }

    /// Rows accepted so far, dumped or not.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }
}

/// A TapeSet locked for one dump.
struct InsertTarget<'c> {
    handle: &'c TapeSetHandle,
    _insert: InsertGuard,
    _dump: MutexGuard<'c, ()>,
}

impl HeapCore {
    pub(crate) fn insert(&self, buffer: &mut InsertBuffer, row: Row) -> EngineResult<()> {
        self.schema.check_row(&row)?;
        let size = row.encoded_len();
        let max = max_record_size(self.pool.block_size()) - 1;
        if size > max {
            return Err(StorageError::RowTooLarge {
                size,
                max_size: max,
            }
            .into());
        }
        buffer.rows.push(row);
        buffer.bytes += size;
        buffer.inserted += 1;
        if buffer.rows.len() >= self.config.sort_buffer_rows
            || buffer.bytes >= self.config.sort_buffer_bytes
        {
            self.flush(buffer)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&self, buffer: &mut InsertBuffer) -> EngineResult<()> {
        if buffer.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut buffer.rows);
        buffer.bytes = 0;
        self.dump(buffer.xid, rows)?;
        buffer.dumps += 1;
        Ok(())
    }

    /// Sorts `rows` and writes them as one run.
    fn dump(&self, xid: TxnId, rows: Vec<Row>) -> EngineResult<RunMeta> {
        let mut tuples: Vec<SortTuple> = rows
            .into_iter()
            .map(|row| SortTuple::new(row, &self.comparator))
            .collect();
        tuples.sort_by(|a, b| self.format.compare(&self.comparator, a, b));
        let target = self.acquire_insert_target()?;
        self.dump_into(target.handle, xid, tuples)
    }

    /// Picks the TapeSet for a dump, starting at the preferred one.
    ///
    /// A first pass skips TapeSets that wait for a merge; a second takes
    /// any TapeSet that can be locked. When both fail the caller backs off.
    fn acquire_insert_target(&self) -> EngineResult<InsertTarget<'_>> {
        let count = self.tapesets.len();
        let policy = &self.config.retry;
        for attempt in 0..policy.max_attempts {
            let preferred = self.preferred.load(Ordering::Relaxed) % count;
            for strict in [true, false] {
                for offset in 0..count {
                    let index = (preferred + offset) % count;
                    let Some(target) = self.try_target(index, strict)? else {
                        continue;
                    };
                    if index != preferred {
                        self.preferred
                            .store(index, Ordering::Relaxed);
                        debug!(
                            relation = %self.relation,
                            from = preferred,
                            to = index,
                            "switched insert TapeSet"
                        );
                    }
                    return Ok(target);
                }
            }
            let wait = policy.backoff(attempt);
            debug!(relation = %self.relation, attempt, ?wait, "every TapeSet busy, backing off");
            thread::sleep(wait);
        }
        warn!(relation = %self.relation, tapesets = count, "no TapeSet accepted the dump");
        Err(EngineError::busy(format!(
            "{count} TapeSets locked by merge or vacuum"
        )))
    }

    fn try_target(&self, index: usize, strict: bool) -> EngineResult<Option<InsertTarget<'_>>> {
        let handle = &self.tapesets[index];
        if self.merge_in_progress.load(Ordering::Acquire)
            && handle.lock.is_merging()
        {
            return Ok(None);
        }
        let Some(insert) = handle.lock.try_insert() else {
            return Ok(None);
        };
        let dump = if strict {
            handle.dump.try_lock()
        } else {
            handle.dump.try_lock_for(self.config.retry.max_backoff)
        };
        let Some(dump) = dump else {
            return Ok(None);
        };

        if let Some(state) = self.tapeset_state(index)? {
            if state.merging {
                return Ok(None);
            }
            if strict && state.merge_worthwhile && state.status == TapeSetStatus::BuildingRuns {
                return Ok(None);
            }
            if state.status == TapeSetStatus::MergedUnvacuumed {
                match self.vacuum_tapeset(handle) {
                    Ok(_) => {}
                    Err(err) if err.is_retryable() => {
                        debug!(tapeset = index, error = %err, "unvacuumed TapeSet skipped");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(Some(InsertTarget {
            handle,
            _insert: insert,
            _dump: dump,
        }))
    }

    /// Moves the TapeSet into a distributing state and makes sure the
    /// destination slot has a tape. Returns the state and the tape header.
    fn prepare_dump(
        &self,
        handle: &TapeSetHandle,
        block: BlockId,
        xid: TxnId,
    ) -> EngineResult<(TapeSetState, BlockId)> {
        let mut mtr = self.pool.begin(xid)?;
        let mut state = TapeSetState::load_in(&mut mtr, block)?;
        let mut changed = false;
        match state.status {
            TapeSetStatus::Initial => {
                state.advance_to(TapeSetStatus::BuildingRuns, handle.index)?;
                state.start_distribution();
                changed = true;
            }
            TapeSetStatus::MergedVacuumed => {
                state.advance_to(TapeSetStatus::BuildingRuns, handle.index)?;
                state.cycle += 1;
                let base = state.result;
                state.start_cycle(base.is_valid().then_some(base));
                changed = true;
                debug!(tapeset = handle.index, cycle = state.cycle, base = %base, "started new cycle");
            }
            TapeSetStatus::BuildingRuns => {}
            TapeSetStatus::MergedUnvacuumed => {
                return Err(EngineError::invalid_state(format!(
                    "TapeSet {} is merged but not vacuumed",
                    handle.index
                )));
            }
        }
        let dest = state.dest;
        if !state.tapes[dest].header.is_valid() {
            let header = Tape::create(
                &mut mtr,
                &self.alloc,
                self.config.prealloc_start,
                self.config.prealloc_cap,
            )?;
            state.tapes[dest].header = header;
            changed = true;
        }
        let header = state.tapes[dest].header;
        if changed {
            state.store_in(&mut mtr, block)?;
        }
        mtr.commit()?;
        Ok((state, header))
    }

    fn dump_into(
        &self,
        handle: &TapeSetHandle,
        xid: TxnId,
        tuples: Vec<SortTuple>,
    ) -> EngineResult<RunMeta> {
        let block = self.ensure_tapeset(handle)?;
        let (prepared, header) = self.prepare_dump(handle, block, xid)?;
        let dest = prepared.dest;

        let tape = self.tape(header);
        let writer = tape.begin_run(xid)?;
        let meta = RunMeta::new(RunOrigin::Dump, prepared.cycle, xid);
        let mut run = RunBuilder::new(writer, &self.comparator, self.schema.len(), &self.config, meta);
        let mut stream = tuples.into_iter().map(Ok::<_, EngineError>);
        self.format.write_run(&mut run, &mut stream)?;
        let sealed = run.seal()?;

        let mut mtr = self.pool.begin(xid)?;
        let mut state = TapeSetState::load_in(&mut mtr, block)?;
        if state.dest != dest || state.tapes[dest].header != header {
            return Err(EngineError::invalid_state(format!(
                "TapeSet {} changed during a dump",
                handle.index
            )));
        }
        let meta = sealed.commit(&mut mtr)?;
        state.record_dump()?;
        state.select_new_tape();
        state.last_insert_xid = xid;
        state
            .check_invariant()
            .map_err(EngineError::invalid_state)?;
        if state.level >= self.config.merge_trigger_level {
            state.merge_worthwhile = true;
        }
        state.store_in(&mut mtr, block)?;
        mtr.commit()?;

        info!(
            relation = %self.relation,
            tapeset = handle.index,
            tape = %header,
            run = meta.run_no,
            rows = meta.rows,
            level = state.level,
            "dumped run"
        );
        if state.merge_worthwhile {
            self.signal.notify();
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use sortheap_common::config::EngineConfig;
    use sortheap_storage::row::Value;
    use sortheap_txn::TransactionService;

    use super::*;
    use crate::heap::tests::{heap, heap_with, keys, row};

    #[test]
    fn test_buffer_dumps_at_row_limit() {
        let heap = heap();
        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        for i in 0..130 {
            heap.insert(&mut buffer, row(130 - i, i)).unwrap();
        }
        assert_eq!(buffer.dumps(), 2);
        assert_eq!(buffer.len(), 2);
        heap.finish_insert(&mut buffer).unwrap();
        assert_eq!(buffer.dumps(), 3);
        assert!(buffer.is_empty());
        heap.txns().commit(txn.xid).unwrap();

        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.dumps, 3);
        assert_eq!(state.last_insert_xid, txn.xid);
        state.check_invariant().unwrap();
        assert_eq!(keys(&heap), (1..=130).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_row_rejected() {
        let heap = heap();
        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        let huge = Row::new(vec![
            Value::Int(1),
            Value::Int(1),
            Value::Text("x".repeat(8000)),
        ]);
        let err = heap.insert(&mut buffer, huge).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::RowTooLarge { .. })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_merge_worthwhile_prefers_other_tapeset() {
        let config = EngineConfig::for_testing()
            .with_sort_buffer_rows(8)
            .with_tapes_per_set(3)
            .with_merge_trigger_level(2);
        let heap = heap_with(config);
        // Two inputs reach level 2 after the second dump.
        heap.load((0..16).map(|i| row(i, i))).unwrap();
        let first = heap.core().tapeset_state(0).unwrap().unwrap();
        assert!(first.merge_worthwhile);

        heap.load((16..24).map(|i| row(i, i))).unwrap();
        let second = heap.core().tapeset_state(1).unwrap().unwrap();
        assert_eq!(second.dumps, 1);
        assert_eq!(heap.core().tapeset_state(0).unwrap().unwrap().dumps, first.dumps);
        assert_eq!(keys(&heap), (0..24).collect::<Vec<_>>());
    }

    #[test]
    fn test_busy_tapeset_falls_through() {
        let heap = heap();
        heap.load((0..10).map(|i| row(i, i))).unwrap();
        let guard = heap.core().tapesets[0].lock.try_merge().unwrap();
        heap.load((10..20).map(|i| row(i, i))).unwrap();
        drop(guard);
        assert_eq!(heap.core().tapeset_state(1).unwrap().unwrap().dumps, 1);
        assert_eq!(heap.core().preferred.load(Ordering::Relaxed), 1);
        assert_eq!(keys(&heap), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_tapesets_busy() {
        let config = EngineConfig::for_testing().with_tapesets(1);
        let heap = heap_with(config);
        let _guard = heap.core().tapesets[0].lock.try_merge().unwrap();
        let err = heap.load(vec![row(1, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::TapeSetBusy { .. }));
        assert!(err.is_retryable());
    }
}
