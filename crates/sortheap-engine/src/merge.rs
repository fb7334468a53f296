//! Polyphase merge of a TapeSet.
//!
//! A merge runs in a transaction of its own and commits every step in one
//! mini-transaction: the output run, the slot counters and, on the final
//! pass, the status change to `MergedUnvacuumed`. A merge interrupted by a
//! crash leaves `merging` set; the next merge of the TapeSet resumes at the
//! first uncommitted step, and the partial output it left behind is cut off
//! by the tape writer.

use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use sortheap_common::types::{BlockId, TxnId};
use sortheap_storage::tape::{RunMeta, RunOrigin, ScanDirection, Tape};
use sortheap_txn::{Snapshot, Transaction, TxnStatus};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::RunBuilder;
use crate::heap::{HeapCore, TapeSetHandle};
use crate::kmerge::KMerge;
use crate::tapeset::{MergeStep, StepInput, TapeSetState, TapeSetStatus};

/// Clears the relation-wide merge flag when dropped.
struct MergeFlag<'a>(&'a AtomicBool);

impl Drop for MergeFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Merge,
    /// Merged, but the merge transaction aborted after the final pass.
    Restamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Finished,
    /// Stopped after the requested number of steps.
    Stopped,
    /// An input transaction stayed invisible through every retry.
    Blocked,
}

impl HeapCore {
    /// Merges one TapeSet. Returns true if merge work remains.
    pub(crate) fn merge_once(&self, force: bool, max_steps: Option<usize>) -> EngineResult<bool> {
        if self
            .merge_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(relation = %self.relation, "merge already running");
            return Ok(true);
        }
        let _flag = MergeFlag(&self.merge_in_progress);

        let mut skipped = false;
        for handle in &self.tapesets {
            let Some(state) = self.tapeset_state(handle.index)? else {
                continue;
            };
            match self.merge_candidate(&state, force) {
                None => {}
                Some(Candidate::Restamp) => {
                    if !self.restamp_merge(handle)? {
                        skipped = true;
                    }
                }
                Some(Candidate::Merge) => {
                    // An inserter still running in this TapeSet may need to
                    // dump into it before it can commit.
                    if let Err(err) = self.check_inputs_visible(&state, &self.txns.snapshot()) {
                        debug!(tapeset = handle.index, error = %err, "merge waits for inserters");
                        skipped = true;
                        continue;
                    }
                    let Some(_guard) = handle.lock.try_merge() else {
                        debug!(tapeset = handle.index, "TapeSet has inserters, merge skipped");
                        skipped = true;
                        continue;
                    };
                    match self.merge_tapeset(handle, max_steps)? {
                        MergeOutcome::Finished => break,
                        MergeOutcome::Stopped | MergeOutcome::Blocked => return Ok(true),
                    }
                }
            }
        }
        Ok(skipped || self.merge_pending(force)?)
    }

    fn merge_candidate(&self, state: &TapeSetState, force: bool) -> Option<Candidate> {
        match state.status {
            TapeSetStatus::BuildingRuns
                if state.merging || (state.dumps > 0 && (force || state.merge_worthwhile)) =>
            {
                Some(Candidate::Merge)
            }
            TapeSetStatus::MergedUnvacuumed
                if self.txns.status(state.last_merge_xid) == TxnStatus::Aborted =>
            {
                Some(Candidate::Restamp)
            }
            _ => None,
        }
    }

    fn merge_pending(&self, force: bool) -> EngineResult<bool> {
        for handle in &self.tapesets {
            if let Some(state) = self.tapeset_state(handle.index)? {
                if self.merge_candidate(&state, force).is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Gives a finished merge whose transaction aborted a committed owner.
    fn restamp_merge(&self, handle: &TapeSetHandle) -> EngineResult<bool> {
        let Some(_vacuum) = handle.vacuum.try_lock() else {
            return Ok(false);
        };
        let block = handle.block();
        let txn = self.txns.begin()?;
        let restamped = (|| {
            let mut mtr = self.pool.begin(txn.xid)?;
            let mut state = TapeSetState::load_in(&mut mtr, block)?;
            let old = state.last_merge_xid;
            state.last_merge_xid = txn.xid;
            state.store_in(&mut mtr, block)?;
            mtr.commit()?;
            Ok::<_, EngineError>(old)
        })();
        match restamped {
            Ok(old) => {
                self.txns.commit(txn.xid)?;
                info!(tapeset = handle.index, from = %old, to = %txn.xid, "restamped merge result");
                Ok(true)
            }
            Err(err) => {
                self.abort_quietly(&txn);
                Err(err)
            }
        }
    }

    fn merge_tapeset(
        &self,
        handle: &TapeSetHandle,
        max_steps: Option<usize>,
    ) -> EngineResult<MergeOutcome> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            let txn = self.txns.begin()?;
            match self.run_merge(handle, &txn, max_steps) {
                Ok(outcome) => {
                    self.txns.commit(txn.xid)?;
                    return Ok(outcome);
                }
                Err(err) => {
                    self.abort_quietly(&txn);
                    if !err.is_retryable() {
                        warn!(tapeset = handle.index, error = %err, "merge failed");
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        debug!(tapeset = handle.index, error = %err, attempts = attempt, "merge postponed");
                        return Ok(MergeOutcome::Blocked);
                    }
                    thread::sleep(policy.backoff(attempt));
                }
            }
        }
    }

    fn abort_quietly(&self, txn: &Transaction) {
        if let Err(err) = self.txns.abort(txn.xid) {
            warn!(xid = %txn.xid, error = %err, "abort failed");
        }
    }

    fn run_merge(
        &self,
        handle: &TapeSetHandle,
        txn: &Transaction,
        max_steps: Option<usize>,
    ) -> EngineResult<MergeOutcome> {
        let block = handle.block();
        let state = TapeSetState::load(&self.pool, block)?;
        self.check_inputs_visible(&state, &txn.snapshot)?;
        if !state.merging {
            let mut mtr = self.pool.begin(txn.xid)?;
            let mut state = TapeSetState::load_in(&mut mtr, block)?;
            state.merging = true;
            state.store_in(&mut mtr, block)?;
            mtr.commit()?;
            info!(
                relation = %self.relation,
                tapeset = handle.index,
                cycle = state.cycle,
                level = state.level,
                dumps = state.dumps,
                "merge started"
            );
        } else {
            info!(relation = %self.relation, tapeset = handle.index, "merge resumed");
        }

        let mut steps = 0usize;
        loop {
            let state = TapeSetState::load(&self.pool, block)?;
            let step = state.next_merge_step()?;
            match step {
                MergeStep::Done => return Ok(MergeOutcome::Finished),
                MergeStep::Rotate | MergeStep::AllDummy => {
                    let mut mtr = self.pool.begin(txn.xid)?;
                    let mut current = TapeSetState::load_in(&mut mtr, block)?;
                    current.apply_merge_step(&step);
                    current.store_in(&mut mtr, block)?;
                    mtr.commit()?;
                }
                MergeStep::Merge { .. } => {
                    if max_steps.is_some_and(|max| steps >= max) {
                        debug!(tapeset = handle.index, steps, "merge paused");
                        return Ok(MergeOutcome::Stopped);
                    }
                    let finished = self.merge_step(handle, block, &state, &step, txn.xid)?;
                    steps += 1;
                    if finished {
                        return Ok(MergeOutcome::Finished);
                    }
                }
            }
        }
    }

    /// Every dump of the cycle must be aborted or visible to the merge.
    fn check_inputs_visible(&self, state: &TapeSetState, snapshot: &Snapshot) -> EngineResult<()> {
        for header in state.tape_headers() {
            for run in self.tape(header).runs()? {
                if run.origin != RunOrigin::Dump || run.cycle != state.cycle {
                    continue;
                }
                if self.txns.status(run.xmin) == TxnStatus::Aborted {
                    continue;
                }
                if !snapshot.is_visible(run.xmin, self.txns.as_ref()) {
                    return Err(EngineError::not_yet(run.xmin, "insert"));
                }
            }
        }
        Ok(())
    }

    /// Runs one merge step. Returns true if it was the final pass.
    fn merge_step(
        &self,
        handle: &TapeSetHandle,
        block: BlockId,
        state: &TapeSetState,
        step: &MergeStep,
        xid: TxnId,
    ) -> EngineResult<bool> {
        let MergeStep::Merge { inputs, final_pass } = step else {
            return Err(EngineError::invalid_state("merge step without inputs"));
        };
        let mut sources = Vec::with_capacity(inputs.len());
        let mut expected = 0u64;
        for input in inputs {
            let StepInput::Run { slot, run_no } = *input else {
                continue;
            };
            let run = self.input_run(state.tapes[slot].header, run_no)?;
            if run.origin == RunOrigin::Dump && self.txns.status(run.xmin) == TxnStatus::Aborted {
                debug!(tapeset = handle.index, slot, run = run_no, xid = %run.xmin, "skipped aborted run");
                continue;
            }
            expected += run.rows;
            sources.push(
                self.format
                    .open_reader(&self.pool, &run, ScanDirection::Forward, None),
            );
        }

        let output = self.merge_output(block, *final_pass, xid)?;
        let tape = self.tape(output);
        let writer = tape.begin_run(xid)?;
        let meta = RunMeta::new(RunOrigin::Merge, state.cycle, xid);
        let mut run = RunBuilder::new(writer, &self.comparator, self.schema.len(), &self.config, meta);
        let mut merge = KMerge::new(
            sources,
            &self.comparator,
            self.format.as_ref(),
            ScanDirection::Forward,
        );
        let mut tuples =
            iter::from_fn(|| merge.next().map(|next| next.map(|(_, tuple, _)| tuple)).transpose());
        self.format.write_run(&mut run, &mut tuples)?;
        let sealed = run.seal()?;
        if sealed.rows() != expected {
            return Err(EngineError::invalid_state(format!(
                "merge step wrote {} rows, inputs hold {expected}",
                sealed.rows()
            )));
        }

        let mut mtr = self.pool.begin(xid)?;
        let mut current = TapeSetState::load_in(&mut mtr, block)?;
        if current.next_merge_step()? != *step {
            return Err(EngineError::invalid_state(format!(
                "TapeSet {} changed during a merge step",
                handle.index
            )));
        }
        let meta = sealed.commit(&mut mtr)?;
        current.apply_merge_step(step);
        if *final_pass {
            current.advance_to(TapeSetStatus::MergedUnvacuumed, handle.index)?;
            current.last_merge_xid = xid;
            current.merging = false;
            current.merge_worthwhile = false;
        }
        current.store_in(&mut mtr, block)?;
        mtr.commit()?;

        if *final_pass {
            info!(
                relation = %self.relation,
                tapeset = handle.index,
                result = %output,
                rows = meta.rows,
                "merge finished"
            );
        } else {
            debug!(
                tapeset = handle.index,
                tape = %output,
                run = meta.run_no,
                rows = meta.rows,
                "merge step committed"
            );
        }
        Ok(*final_pass)
    }

    fn input_run(&self, header: BlockId, run_no: u32) -> EngineResult<RunMeta> {
        let mut runs = self.tape(header).runs()?;
        if run_no as usize >= runs.len() {
            return Err(EngineError::invalid_state(format!(
                "tape {header} has {} runs, merge wants run {run_no}",
                runs.len()
            )));
        }
        Ok(runs.swap_remove(run_no as usize))
    }

    /// Tape the next step writes: the output slot, or the result tape on
    /// the final pass. Created on first use.
    fn merge_output(&self, block: BlockId, final_pass: bool, xid: TxnId) -> EngineResult<BlockId> {
        let mut mtr = self.pool.begin(xid)?;
        let mut state = TapeSetState::load_in(&mut mtr, block)?;
        let output = state.output();
        let existing = if final_pass {
            state.result
        } else {
            state.tapes[output].header
        };
        if existing.is_valid() {
            mtr.commit()?;
            return Ok(existing);
        }
        let header = Tape::create(
            &mut mtr,
            &self.alloc,
            self.config.prealloc_start,
            self.config.prealloc_cap,
        )?;
        if final_pass {
            state.result = header;
        } else {
            state.tapes[output].header = header;
        }
        state.store_in(&mut mtr, block)?;
        mtr.commit()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sortheap_common::config::EngineConfig;
    use sortheap_common::types::RelationId;
    use sortheap_storage::store::{BlockStore, MemoryStore};
    use sortheap_storage::tape::TupleFlags;
    use sortheap_txn::TransactionService;
    use sortheap_wal::{LogSink, MemoryWal};

    use super::*;
    use crate::heap::tests::{heap, heap_with, keys, row, schema};
    use crate::heap::SortHeap;

    fn small_runs() -> EngineConfig {
        EngineConfig::for_testing()
            .with_sort_buffer_rows(10)
            .with_tapes_per_set(4)
            .with_tapesets(1)
    }

    #[test]
    fn test_forced_merge_produces_one_run() {
        let heap = heap_with(small_runs());
        heap.load((0..95).rev().map(|i| row(i, i))).unwrap();
        assert!(heap.merge_once(true).is_ok());

        let core = heap.core();
        let state = core.tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::MergedUnvacuumed);
        assert!(!state.merging);
        assert!(state.result.is_valid());
        assert_eq!(state.level, 0);
        let runs = core.tape(state.result).runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].rows, 95);
        assert_eq!(runs[0].origin, RunOrigin::Merge);
        assert_eq!(keys(&heap), (0..95).collect::<Vec<_>>());
    }

    #[test]
    fn test_unforced_merge_waits_for_trigger() {
        let heap = heap();
        heap.load((0..10).map(|i| row(i, i))).unwrap();
        assert!(!heap.merge_once(false).unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::BuildingRuns);
    }

    #[test]
    fn test_merge_resumes_after_steps() {
        let heap = heap_with(small_runs());
        heap.load((0..200).map(|i| row((i * 37) % 200, i))).unwrap();
        assert!(heap.merge_steps(true, 1).unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert!(state.merging);
        assert_eq!(state.status, TapeSetStatus::BuildingRuns);
        // Scans keep reading the dumps while the merge is half done.
        assert_eq!(keys(&heap), (0..200).collect::<Vec<_>>());

        while heap.merge_steps(true, 2).unwrap() {}
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::MergedUnvacuumed);
        assert_eq!(keys(&heap), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_aborted_dump_not_merged() {
        let heap = heap_with(small_runs());
        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        for i in 100..125 {
            heap.insert(&mut buffer, row(i, i)).unwrap();
        }
        heap.finish_insert(&mut buffer).unwrap();
        heap.txns().abort(txn.xid).unwrap();

        heap.load((0..30).map(|i| row(i, i))).unwrap();
        assert!(!heap.merge_once(true).unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        let runs = heap.core().tape(state.result).runs().unwrap();
        assert_eq!(runs[0].rows, 30);
        assert_eq!(keys(&heap), (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_uncommitted_dump_blocks_merge() {
        let heap = heap_with(small_runs());
        heap.load((0..20).map(|i| row(i, i))).unwrap();
        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        for i in 20..30 {
            heap.insert(&mut buffer, row(i, i)).unwrap();
        }
        heap.finish_insert(&mut buffer).unwrap();

        assert!(heap.merge_once(true).unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::BuildingRuns);
        assert!(!state.merging);

        heap.txns().commit(txn.xid).unwrap();
        assert!(!heap.merge_once(true).unwrap());
        assert_eq!(keys(&heap), (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_merge_call_reports_pending() {
        let heap = heap_with(small_runs());
        heap.load((0..20).map(|i| row(i, i))).unwrap();
        heap.core().merge_in_progress.store(true, Ordering::Release);
        assert!(heap.merge_once(true).unwrap());
        heap.core().merge_in_progress.store(false, Ordering::Release);
        assert!(!heap.merge_once(true).unwrap());
    }

    #[test]
    fn test_aborted_merge_result_is_restamped() {
        let heap = heap_with(small_runs());
        heap.load((0..20).map(|i| row(i, i))).unwrap();
        assert!(!heap.merge_once(true).unwrap());

        let core = heap.core();
        let block = core.tapesets[0].block();
        let stray = core.txns.begin().unwrap();
        core.txns.abort(stray.xid).unwrap();
        let mut mtr = core.pool.begin(stray.xid).unwrap();
        let mut state = TapeSetState::load_in(&mut mtr, block).unwrap();
        state.last_merge_xid = stray.xid;
        state.store_in(&mut mtr, block).unwrap();
        mtr.commit().unwrap();

        assert!(!heap.merge_once(false).unwrap());
        let state = core.tapeset_state(0).unwrap().unwrap();
        assert_ne!(state.last_merge_xid, stray.xid);
        assert_eq!(core.txns.status(state.last_merge_xid), TxnStatus::Committed);
    }

    #[test]
    fn test_crash_inside_merge_step_resumes_cleanly() {
        let store = Arc::new(MemoryStore::new(small_runs().block_size));
        let wal = Arc::new(MemoryWal::new());
        let heap = SortHeap::create(
            small_runs(),
            RelationId::new(4),
            schema(),
            Arc::clone(&store) as Arc<dyn BlockStore>,
            Arc::clone(&wal) as Arc<dyn LogSink>,
        )
        .unwrap();
        heap.load((0..200).map(|i| row((i * 37) % 200, i))).unwrap();
        assert!(heap.merge_steps(true, 1).unwrap());

        // Start the next step and spill part of its output without sealing.
        let core = heap.core();
        let block = core.tapesets[0].block();
        let state = core.tapeset_state(0).unwrap().unwrap();
        let MergeStep::Merge { final_pass, .. } = state.next_merge_step().unwrap() else {
            panic!("expected a merge step");
        };
        assert!(!final_pass);
        let txn = core.txns.begin().unwrap();
        let output = core.merge_output(block, final_pass, txn.xid).unwrap();
        let tape = core.tape(output);
        let runs_before = tape.runs().unwrap().len();
        let mut writer = tape.begin_run(txn.xid).unwrap();
        for _ in 0..300 {
            writer.write_tuple(TupleFlags::empty(), &[7u8; 40]).unwrap();
        }
        drop(writer);

        let reopened = SortHeap::open(
            small_runs(),
            Arc::new(store.fork()),
            Arc::new(MemoryWal::from_bytes(wal.to_bytes())),
        )
        .unwrap();
        let state = reopened.core().tapeset_state(0).unwrap().unwrap();
        assert!(state.merging);
        assert_eq!(reopened.core().tape(output).runs().unwrap().len(), runs_before);

        assert!(!reopened.merge_once(true).unwrap());
        assert!(!reopened.vacuum_once().unwrap());
        assert_eq!(keys(&reopened), (0..200).collect::<Vec<_>>());
        let state = reopened.core().tapeset_state(0).unwrap().unwrap();
        let runs = reopened.core().tape(state.result).runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].rows, 200);

        let fresh = heap_with(small_runs());
        fresh.load((0..200).map(|i| row((i * 37) % 200, i))).unwrap();
        assert!(!fresh.merge_once(true).unwrap());
        assert!(!fresh.vacuum_once().unwrap());
        assert_eq!(
            reopened.allocated_blocks().unwrap(),
            fresh.allocated_blocks().unwrap()
        );
    }
}
