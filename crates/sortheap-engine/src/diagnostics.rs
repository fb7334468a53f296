//! Status reports for operators and tests.

use serde::Serialize;
use sortheap_common::types::{BlockId, RelationId, TxnId};

use crate::error::{EngineError, EngineResult};
use crate::heap::HeapCore;
use crate::tapeset::{TapeSetState, TapeSetStatus};

/// One tape slot of a TapeSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapeReport {
    /// Slot index; the last slot is the merge output.
    pub slot: usize,
    /// Tape header block.
    pub header: BlockId,
    /// Runs committed on the tape, consumed ones included.
    pub stored_runs: usize,
    /// Real runs not yet merged.
    pub runs: u32,
    /// Dummy runs.
    pub dummy: u32,
    /// Blocks owned by the tape.
    pub blocks: usize,
}

/// One TapeSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapeSetReport {
    /// TapeSet index.
    pub index: usize,
    /// TapeSet block; invalid before the first dump.
    pub block: BlockId,
    /// Lifecycle status; `None` before the first dump.
    pub status: Option<TapeSetStatus>,
    /// Cycle number.
    pub cycle: u32,
    /// Polyphase level.
    pub level: u32,
    /// Runs dumped in the current cycle.
    pub dumps: u32,
    /// A merge is under way.
    pub merging: bool,
    /// The merge trigger level was reached.
    pub merge_worthwhile: bool,
    /// Result tape of the last merge.
    pub result: BlockId,
    /// Transaction of the last merge.
    pub last_merge_xid: TxnId,
    /// Slots holding a tape.
    pub tapes: Vec<TapeReport>,
}

/// Status of a whole relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    /// Relation.
    pub relation: RelationId,
    /// Tuple format name.
    pub format: &'static str,
    /// Blocks allocated, metadata and allocator pages included.
    pub allocated_blocks: u64,
    /// One entry per TapeSet.
    pub tapesets: Vec<TapeSetReport>,
}

impl DiagnosticReport {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| EngineError::InvalidState {
            message: format!("report not serializable: {err}"),
        })
    }

    /// Report of TapeSet `index`.
    pub fn tapeset(&self, index: usize) -> Option<&TapeSetReport> {
        self.tapesets.get(index)
    }
}

impl HeapCore {
    pub(crate) fn describe(&self) -> EngineResult<DiagnosticReport> {
        let mut tapesets = Vec::with_capacity(self.tapesets.len());
        for handle in &self.tapesets {
            let report = match self.tapeset_state(handle.index)? {
                Some(state) => self.describe_tapeset(handle.index, handle.block(), &state)?,
                None => TapeSetReport {
                    index: handle.index,
                    block: BlockId::INVALID,
                    status: None,
                    cycle: 0,
                    level: 0,
                    dumps: 0,
                    merging: false,
                    merge_worthwhile: false,
                    result: BlockId::INVALID,
                    last_merge_xid: TxnId::INVALID,
                    tapes: Vec::new(),
                },
            };
            tapesets.push(report);
        }
        Ok(DiagnosticReport {
            relation: self.relation,
            format: self.format.name(),
            allocated_blocks: self.alloc.allocated_count(&self.pool)?,
            tapesets,
        })
    }

    fn describe_tapeset(
        &self,
        index: usize,
        block: BlockId,
        state: &TapeSetState,
    ) -> EngineResult<TapeSetReport> {
        let mut tapes = Vec::new();
        for (slot, tape) in state.tapes.iter().enumerate() {
            if !tape.header.is_valid() {
                continue;
            }
            let handle = self.tape(tape.header);
            tapes.push(TapeReport {
                slot,
                header: tape.header,
                stored_runs: handle.runs()?.len(),
                runs: tape.runs,
                dummy: tape.dummy,
                blocks: handle.allocated_blocks()?.len(),
            });
        }
        Ok(TapeSetReport {
            index,
            block,
            status: Some(state.status),
            cycle: state.cycle,
            level: state.level,
            dumps: state.dumps,
            merging: state.merging,
            merge_worthwhile: state.merge_worthwhile,
            result: state.result,
            last_merge_xid: state.last_merge_xid,
            tapes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::{heap, row};

    #[test]
    fn test_report_tracks_lifecycle() {
        let heap = heap();
        let report = heap.describe().unwrap();
        assert_eq!(report.format, "plain");
        assert_eq!(report.tapesets.len(), 2);
        assert!(report.tapesets.iter().all(|t| t.status.is_none()));

        heap.load((0..200).map(|i| row(i, i))).unwrap();
        let report = heap.describe().unwrap();
        let first = report.tapeset(0).unwrap();
        assert_eq!(first.status, Some(TapeSetStatus::BuildingRuns));
        assert_eq!(first.dumps, 4);
        let stored: usize = first.tapes.iter().map(|t| t.stored_runs).sum();
        assert_eq!(stored, 4);
        assert!(first.tapes.iter().all(|t| t.blocks > 0));

        heap.merge_once(true).unwrap();
        let report = heap.describe().unwrap();
        let first = report.tapeset(0).unwrap();
        assert_eq!(first.status, Some(TapeSetStatus::MergedUnvacuumed));
        assert!(first.result.is_valid());

        let json = report.to_json().unwrap();
        assert!(json.contains("\"MergedUnvacuumed\""));
        assert!(json.contains("\"format\": \"plain\""));
    }
}
