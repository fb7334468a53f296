//! Snapshot scans.
//!
//! A scan reads the runs its snapshot sees: the merge result of a TapeSet
//! once the merging transaction is visible, otherwise the previous cycle's
//! result plus every visible dump of the current cycle. A single run is read
//! directly; several are merged on the fly. Key bounds position each run
//! through its B-tree, and forward scans with a predicate skip block ranges
//! whose summaries exclude it.

mod run;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use sortheap_common::types::{RowLocator, TxnId};
use sortheap_storage::index::ScanPredicate;
use sortheap_storage::row::{Row, Value};
use sortheap_storage::tape::{RunMeta, RunOrigin, ScanDirection};
use sortheap_txn::Snapshot;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::heap::HeapCore;
use crate::kmerge::KMerge;
use crate::tapeset::{TapeSetState, TapeSetStatus};

use run::{RunFilter, RunScan};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// Leading sort key values.
    pub prefix: Vec<Value>,
    /// Whether keys equal to the prefix are in range.
    pub inclusive: bool,
}

impl Bound {
    /// Bound that includes keys equal to `prefix`.
    pub fn inclusive(prefix: Vec<Value>) -> Self {
        Self {
            prefix,
            inclusive: true,
        }
    }

    /// Bound that excludes keys equal to `prefix`.
    pub fn exclusive(prefix: Vec<Value>) -> Self {
        Self {
            prefix,
            inclusive: false,
        }
    }
}

/// What a scan returns and in which order.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Lowest key returned.
    pub lower: Option<Bound>,
    /// Highest key returned.
    pub upper: Option<Bound>,
    /// Rows must satisfy every term.
    pub predicate: ScanPredicate,
    /// Columns returned, in order; every column when `None`.
    pub projection: Option<Vec<usize>>,
    /// Initial direction.
    pub direction: ScanDirection,
}

impl ScanOptions {
    /// Full forward scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lower bound.
    #[must_use]
    pub fn with_lower(mut self, bound: Bound) -> Self {
        self.lower = Some(bound);
        self
    }

    /// Sets the upper bound.
    #[must_use]
    pub fn with_upper(mut self, bound: Bound) -> Self {
        self.upper = Some(bound);
        self
    }

    /// Sets the predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: ScanPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Returns only `columns`.
    #[must_use]
    pub fn with_projection(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        self
    }

    /// Sets the initial direction.
    #[must_use]
    pub fn with_direction(mut self, direction: ScanDirection) -> Self {
        self.direction = direction;
        self
    }
}

enum Source<'h> {
    Empty,
    Single(RunScan<'h>),
    Merge(KMerge<'h, RunScan<'h>>),
}

/// An open scan. Yields rows in key order (reverse order backward).
pub struct Scan<'h> {
    core: &'h HeapCore,
    snapshot: Snapshot,
    owned: Option<TxnId>,
    runs: Vec<RunMeta>,
    filter: Arc<RunFilter>,
    projection: Option<Vec<usize>>,
    needed: Option<Arc<[usize]>>,
    direction: ScanDirection,
    source: Source<'h>,
    returned: u64,
}

impl fmt::Debug for Scan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scan")
            .field("relation", &self.core.relation)
            .field("runs", &self.runs.len())
            .field("direction", &self.direction)
            .field("returned", &self.returned)
            .finish()
    }
}

impl<'h> Scan<'h> {
    /// Opens a scan reading with `snapshot`. An `owned` transaction is
    /// committed when the scan is dropped.
    pub(crate) fn open(
        core: &'h HeapCore,
        snapshot: Snapshot,
        owned: Option<TxnId>,
        options: ScanOptions,
    ) -> EngineResult<Self> {
        let columns = core.schema.len();
        if let Some(projection) = &options.projection {
            if let Some(bad) = projection.iter().find(|c| **c >= columns) {
                return Err(EngineError::invalid_argument(format!(
                    "projected column {bad} out of range for {columns} columns"
                )));
            }
        }
        if let Some(bad) = options.predicate.terms().iter().find(|t| t.column >= columns) {
            return Err(EngineError::invalid_argument(format!(
                "predicate column {} out of range for {columns} columns",
                bad.column
            )));
        }
        let key_len = core.schema.sort_key().len();
        for bound in options.lower.iter().chain(options.upper.iter()) {
            if bound.prefix.len() > key_len {
                return Err(EngineError::invalid_argument(format!(
                    "bound of {} values for a {key_len}-column key",
                    bound.prefix.len()
                )));
            }
        }

        let needed: Option<Arc<[usize]>> = options.projection.as_ref().map(|projection| {
            let mut needed: BTreeSet<usize> = projection.iter().copied().collect();
            needed.extend(options.predicate.terms().iter().map(|t| t.column));
            needed.extend(core.schema.sort_key().columns().iter().map(|k| k.column));
            needed.into_iter().collect()
        });
        let runs = visible_runs(core, &snapshot)?;
        debug!(
            relation = %core.relation,
            xid = %snapshot.xid,
            runs = runs.len(),
            "scan opened"
        );

        let mut scan = Self {
            core,
            snapshot,
            owned,
            runs,
            filter: Arc::new(RunFilter {
                lower: options.lower,
                upper: options.upper,
                predicate: options.predicate,
            }),
            projection: options.projection,
            needed,
            direction: options.direction,
            source: Source::Empty,
            returned: 0,
        };
        if let Err(err) = scan.restart(options.direction) {
            scan.owned = None;
            return Err(err);
        }
        Ok(scan)
    }

    fn restart(&mut self, direction: ScanDirection) -> EngineResult<()> {
        let mut sources = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            if let Some(source) = RunScan::open(
                self.core,
                run,
                direction,
                Arc::clone(&self.filter),
                self.needed.clone(),
            )? {
                sources.push(source);
            }
        }
        self.direction = direction;
        self.source = match sources.len() {
            0 => Source::Empty,
            1 => match sources.pop() {
                Some(source) => Source::Single(source),
                None => Source::Empty,
            },
            _ => Source::Merge(KMerge::new(
                sources,
                &self.core.comparator,
                self.core.format.as_ref(),
                direction,
            )),
        };
        Ok(())
    }

    /// Snapshot the scan reads with.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Runs the scan reads.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Current direction.
    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    /// Rows returned since the scan was opened or last restarted.
    pub fn returned(&self) -> u64 {
        self.returned
    }

    /// Starts over in `direction`.
    pub fn rescan(&mut self, direction: ScanDirection) -> EngineResult<()> {
        self.returned = 0;
        self.restart(direction)
    }

    /// Returns the next row and its locator.
    pub fn next_entry(&mut self) -> EngineResult<Option<(RowLocator, Row)>> {
        let next = match &mut self.source {
            Source::Empty => None,
            Source::Single(source) => source.next()?,
            Source::Merge(merge) => merge
                .next()?
                .map(|(locator, tuple, _)| (locator, tuple.into_row())),
        };
        Ok(next.map(|(locator, row)| {
            self.returned += 1;
            let row = match &self.projection {
                Some(columns) => row.project(columns),
                None => row,
            };
            (locator, row)
        }))
    }

    /// Returns the next row.
    pub fn next_row(&mut self) -> EngineResult<Option<Row>> {
        Ok(self.next_entry()?.map(|(_, row)| row))
    }

    /// Returns the next row in `direction`; a change of direction restarts
    /// the scan from that end.
    pub fn next_in(&mut self, direction: ScanDirection) -> EngineResult<Option<Row>> {
        if direction != self.direction {
            self.rescan(direction)?;
        }
        self.next_row()
    }
}

impl Iterator for Scan<'_> {
    type Item = EngineResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for Scan<'_> {
    fn drop(&mut self) {
        if let Some(xid) = self.owned.take() {
            if let Err(err) = self.core.txns.commit(xid) {
                warn!(%xid, error = %err, "scan transaction did not commit");
            }
        }
    }
}

/// Non-empty runs `snapshot` sees, across every TapeSet.
fn visible_runs(core: &HeapCore, snapshot: &Snapshot) -> EngineResult<Vec<RunMeta>> {
    let txns = core.txns.as_ref();
    let mut runs = Vec::new();
    for handle in &core.tapesets {
        let Some(state) = core.tapeset_state(handle.index)? else {
            continue;
        };
        let merged = match state.status {
            TapeSetStatus::Initial => continue,
            TapeSetStatus::MergedVacuumed => true,
            TapeSetStatus::MergedUnvacuumed => snapshot.is_visible(state.last_merge_xid, txns),
            TapeSetStatus::BuildingRuns => false,
        };
        if merged {
            runs.extend(core.tape(state.result).runs()?);
        } else {
            cycle_runs(core, &state, snapshot, &mut runs)?;
        }
    }
    runs.retain(|run| !run.is_empty());
    Ok(runs)
}

/// Base run plus the visible dumps of the current cycle.
fn cycle_runs(
    core: &HeapCore,
    state: &TapeSetState,
    snapshot: &Snapshot,
    out: &mut Vec<RunMeta>,
) -> EngineResult<()> {
    if let Some(base) = state.base {
        let mut tape_runs = core.tape(base.tape).runs()?;
        let index = base.run_no as usize;
        if index >= tape_runs.len() {
            return Err(EngineError::invalid_state(format!(
                "base run {} missing from tape {}",
                base.run_no, base.tape
            )));
        }
        out.push(tape_runs.swap_remove(index));
    }
    let mut seen = BTreeSet::new();
    for slot in &state.tapes {
        if !slot.header.is_valid() || !seen.insert(slot.header) {
            continue;
        }
        out.extend(core.tape(slot.header).runs()?.into_iter().filter(|run| {
            run.origin == RunOrigin::Dump
                && run.cycle == state.cycle
                && snapshot.is_visible(run.xmin, core.txns.as_ref())
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use sortheap_common::config::EngineConfig;
    use sortheap_storage::index::CompareOp;
    use sortheap_txn::TransactionService;

    use super::*;
    use crate::heap::tests::{heap, heap_with, keys, row};

    fn int(row: &Row, column: usize) -> i64 {
        row.get(column).and_then(Value::as_int).unwrap()
    }

    fn loaded() -> crate::SortHeap {
        let heap = heap();
        heap.load((0..300).map(|i| row((i * 7) % 300, i))).unwrap();
        heap
    }

    #[test]
    fn test_bounds_over_several_runs() {
        let heap = loaded();
        let options = ScanOptions::new()
            .with_lower(Bound::inclusive(vec![Value::Int(100)]))
            .with_upper(Bound::exclusive(vec![Value::Int(120)]));
        let scan = heap.scan(options).unwrap();
        assert!(scan.run_count() > 1);
        let got: Vec<i64> = scan.map(|r| int(&r.unwrap(), 0)).collect();
        assert_eq!(got, (100..120).collect::<Vec<_>>());
    }

    #[test]
    fn test_backward_with_bounds() {
        let heap = loaded();
        let options = ScanOptions::new()
            .with_lower(Bound::exclusive(vec![Value::Int(10)]))
            .with_upper(Bound::inclusive(vec![Value::Int(20)]))
            .with_direction(ScanDirection::Backward);
        let got: Vec<i64> = heap.scan(options).unwrap().map(|r| int(&r.unwrap(), 0)).collect();
        assert_eq!(got, (11..=20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_direction_change_restarts() {
        let heap = loaded();
        let mut scan = heap.scan(ScanOptions::new()).unwrap();
        assert_eq!(int(&scan.next_in(ScanDirection::Forward).unwrap().unwrap(), 0), 0);
        assert_eq!(int(&scan.next_in(ScanDirection::Forward).unwrap().unwrap(), 0), 1);
        assert_eq!(int(&scan.next_in(ScanDirection::Backward).unwrap().unwrap(), 0), 299);
        assert_eq!(scan.direction(), ScanDirection::Backward);
        assert_eq!(scan.returned(), 1);
    }

    #[test]
    fn test_predicate_and_projection() {
        let heap = loaded();
        let predicate = ScanPredicate::new()
            .and(1, CompareOp::Ge, Value::Int(290))
            .and(0, CompareOp::Lt, Value::Int(200));
        let options = ScanOptions::new()
            .with_predicate(predicate)
            .with_projection(vec![1]);
        let mut got: Vec<i64> = heap.scan(options).unwrap().map(|r| {
            let row = r.unwrap();
            assert_eq!(row.len(), 1);
            int(&row, 0)
        })
        .collect();
        got.sort_unstable();
        let expected: Vec<i64> = (290..300).filter(|i| (i * 7) % 300 < 200).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_bad_options_rejected() {
        let heap = heap();
        let err = heap.scan(ScanOptions::new().with_projection(vec![3])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
        let err = heap
            .scan(ScanOptions::new().with_lower(Bound::inclusive(vec![Value::Int(1), Value::Int(2)])))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_snapshot_hides_later_dumps() {
        let heap = heap();
        heap.load((0..10).map(|i| row(i, i))).unwrap();
        let reader = heap.txns().begin().unwrap();
        heap.load((10..20).map(|i| row(i, i))).unwrap();

        assert_eq!(heap.scan_in(&reader, ScanOptions::new()).unwrap().count(), 10);
        assert_eq!(keys(&heap).len(), 20);
        heap.txns().commit(reader.xid).unwrap();
    }

    #[test]
    fn test_own_dumps_visible_before_commit() {
        let heap = heap();
        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        for i in 0..5 {
            heap.insert(&mut buffer, row(i, i)).unwrap();
        }
        heap.finish_insert(&mut buffer).unwrap();
        assert_eq!(heap.scan_in(&txn, ScanOptions::new()).unwrap().count(), 5);
        assert!(keys(&heap).is_empty());
        heap.txns().abort(txn.xid).unwrap();
    }

    #[test]
    fn test_locators_fetch_rows() {
        let heap = heap_with(EngineConfig::for_testing().with_sort_buffer_rows(20));
        heap.load((0..50).rev().map(|i| row(i, i))).unwrap();
        let mut scan = heap.scan(ScanOptions::new()).unwrap();
        while let Some((locator, row)) = scan.next_entry().unwrap() {
            assert_eq!(heap.fetch_by_locator(locator).unwrap(), Some(row));
        }
    }
}
