//! Reclaiming the tapes of a merged TapeSet.
//!
//! Once every running transaction sees the merge result, the dump and
//! intermediate tapes are released a few aux records per mini-transaction.
//! Each tape's progress lives in its header, so an interrupted vacuum picks
//! up where it stopped.

use std::thread;

use sortheap_common::types::{BlockId, TxnId};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::heap::{HeapCore, TapeSetHandle};
use crate::tapeset::{TapeSetState, TapeSetStatus, TapeSlot};

/// Aux records recycled per mini-transaction.
const VACUUM_BATCH: usize = 8;

impl HeapCore {
    /// Vacuums every TapeSet that needs it. Returns true if one still waits,
    /// typically for an old reader to finish.
    pub(crate) fn vacuum_once(&self) -> EngineResult<bool> {
        let policy = &self.config.retry;
        let mut pending = false;
        for handle in &self.tapesets {
            let mut attempt = 0;
            loop {
                match self.vacuum_tapeset(handle) {
                    Ok(_) => break,
                    Err(err) if err.is_retryable() => {
                        attempt += 1;
                        if attempt >= policy.max_attempts {
                            debug!(tapeset = handle.index, error = %err, "vacuum postponed");
                            pending = true;
                            break;
                        }
                        thread::sleep(policy.backoff(attempt));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(pending)
    }

    /// Vacuums one TapeSet if it is merged and not yet vacuumed. Returns
    /// true if it did.
    pub(crate) fn vacuum_tapeset(&self, handle: &TapeSetHandle) -> EngineResult<bool> {
        let Some(_guard) = handle.vacuum.try_lock() else {
            return Err(EngineError::busy(format!(
                "TapeSet {} is being vacuumed",
                handle.index
            )));
        };
        let Some(state) = self.tapeset_state(handle.index)? else {
            return Ok(false);
        };
        if state.status != TapeSetStatus::MergedUnvacuumed {
            return Ok(false);
        }
        if !self.txns.is_visible_to_all(state.last_merge_xid) {
            return Err(EngineError::not_yet(state.last_merge_xid, "merge"));
        }

        let txn = self.txns.begin()?;
        match self.reclaim(handle, &state, txn.xid) {
            Ok(released) => {
                self.txns.commit(txn.xid)?;
                info!(
                    relation = %self.relation,
                    tapeset = handle.index,
                    cycle = state.cycle,
                    blocks = released,
                    "vacuumed TapeSet"
                );
                Ok(true)
            }
            Err(err) => {
                if let Err(abort) = self.txns.abort(txn.xid) {
                    warn!(xid = %txn.xid, error = %abort, "abort after failed vacuum");
                }
                Err(err)
            }
        }
    }

    fn reclaim(&self, handle: &TapeSetHandle, state: &TapeSetState, xid: TxnId) -> EngineResult<usize> {
        let block = handle.block();
        let tapes: Vec<(usize, BlockId)> = state
            .tapes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.header.is_valid() && slot.header != state.result)
            .map(|(index, slot)| (index, slot.header))
            .collect();

        let mut released = 0usize;
        for (slot, header) in tapes {
            let tape = self.tape(header);
            loop {
                let mut mtr = self.pool.begin(xid)?;
                let mut current = TapeSetState::load_in(&mut mtr, block)?;
                let done = tape.vacuum_step(&mut mtr, VACUUM_BATCH)?;
                if done {
                    released += tape.release(&mut mtr)?;
                    current.tapes[slot].header = BlockId::INVALID;
                    current.store_in(&mut mtr, block)?;
                }
                mtr.commit()?;
                if done {
                    debug!(tapeset = handle.index, slot, tape = %header, "released tape");
                    break;
                }
            }
        }

        let mut mtr = self.pool.begin(xid)?;
        let mut current = TapeSetState::load_in(&mut mtr, block)?;
        current.advance_to(TapeSetStatus::MergedVacuumed, handle.index)?;
        current.tapes = vec![TapeSlot::empty(); current.tapes.len()];
        current.base = None;
        current.level = 0;
        current.dest = 0;
        current.last_vacuum_xid = xid;
        current.store_in(&mut mtr, block)?;
        mtr.commit()?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use sortheap_common::config::EngineConfig;
    use sortheap_txn::TransactionService;

    use super::*;
    use crate::heap::tests::{heap_with, keys, row};
    use crate::scan::ScanOptions;

    fn config() -> EngineConfig {
        EngineConfig::for_testing()
            .with_sort_buffer_rows(16)
            .with_tapesets(1)
    }

    #[test]
    fn test_vacuum_releases_old_tapes() {
        let heap = heap_with(config());
        heap.load((0..160).rev().map(|i| row(i, i))).unwrap();
        let before = heap.allocated_blocks().unwrap();
        assert!(!heap.merge_once(true).unwrap());
        assert!(heap.allocated_blocks().unwrap() > before);

        assert!(!heap.vacuum_once().unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::MergedVacuumed);
        assert!(state.tapes.iter().all(|slot| !slot.header.is_valid()));
        assert!(state.result.is_valid());
        assert!(heap.allocated_blocks().unwrap() < before);
        assert_eq!(keys(&heap), (0..160).collect::<Vec<_>>());
    }

    #[test]
    fn test_second_vacuum_is_noop() {
        let heap = heap_with(config());
        heap.load((0..40).map(|i| row(i, i))).unwrap();
        heap.merge_once(true).unwrap();
        heap.vacuum_once().unwrap();
        let blocks = heap.allocated_blocks().unwrap();
        let state = heap.core().tapeset_state(0).unwrap().unwrap();

        assert!(!heap.vacuum_once().unwrap());
        assert_eq!(heap.allocated_blocks().unwrap(), blocks);
        assert_eq!(heap.core().tapeset_state(0).unwrap().unwrap(), state);
    }

    #[test]
    fn test_old_reader_blocks_vacuum() {
        let heap = heap_with(config());
        heap.load((0..40).map(|i| row(i, i))).unwrap();
        let reader = heap.txns().begin().unwrap();
        heap.merge_once(true).unwrap();

        assert!(heap.vacuum_once().unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::MergedUnvacuumed);
        let seen = heap.scan_in(&reader, ScanOptions::new()).unwrap().count();
        assert_eq!(seen, 40);

        heap.txns().commit(reader.xid).unwrap();
        assert!(!heap.vacuum_once().unwrap());
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::MergedVacuumed);
    }

    #[test]
    fn test_next_cycle_builds_on_result() {
        let heap = heap_with(config());
        heap.load((0..40).map(|i| row(i * 2, i))).unwrap();
        heap.merge_once(true).unwrap();
        heap.vacuum_once().unwrap();
        let result = heap.core().tapeset_state(0).unwrap().unwrap().result;

        heap.load((0..40).map(|i| row(i * 2 + 1, i))).unwrap();
        let state = heap.core().tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::BuildingRuns);
        assert_eq!(state.cycle, 1);
        assert_eq!(state.tapes[0].header, result);
        assert_eq!(keys(&heap), (0..80).collect::<Vec<_>>());

        heap.merge_once(true).unwrap();
        heap.vacuum_once().unwrap();
        assert_eq!(keys(&heap), (0..80).collect::<Vec<_>>());
        assert!(!heap.core().alloc.is_allocated(&heap.core().pool, result).unwrap());
    }
}
