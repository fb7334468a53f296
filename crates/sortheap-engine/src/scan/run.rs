//! Filtered reads of one run.

use std::collections::HashMap;
use std::sync::Arc;

use sortheap_common::types::RowLocator;
use sortheap_storage::index::{load_ranges, BTree, RangeSummary, ScanPredicate};
use sortheap_storage::row::{Row, RowComparator};
use sortheap_storage::tape::{RunFlags, RunMeta, ScanDirection};
use tracing::trace;

use super::Bound;
use crate::error::EngineResult;
use crate::format::RunReader;
use crate::heap::HeapCore;
use crate::kmerge::RowSource;

/// Key bounds and predicate shared by every run of a scan.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunFilter {
    pub(crate) lower: Option<Bound>,
    pub(crate) upper: Option<Bound>,
    pub(crate) predicate: ScanPredicate,
}

impl RunFilter {
    fn below_lower(&self, comparator: &RowComparator, row: &Row) -> bool {
        self.lower.as_ref().is_some_and(|bound| {
            let ord = comparator.compare_prefix(&bound.prefix, row);
            ord.is_gt() || (ord.is_eq() && !bound.inclusive)
        })
    }

    fn above_upper(&self, comparator: &RowComparator, row: &Row) -> bool {
        self.upper.as_ref().is_some_and(|bound| {
            let ord = comparator.compare_prefix(&bound.prefix, row);
            ord.is_lt() || (ord.is_eq() && !bound.inclusive)
        })
    }
}

/// Forward range skipping: summaries keyed by the first tuple of their range.
struct RangeSkip {
    ranges: Vec<RangeSummary>,
    starts: HashMap<RowLocator, usize>,
}

impl RangeSkip {
    fn new(ranges: Vec<RangeSummary>) -> Self {
        let starts = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| (RowLocator::new(range.first.block, range.first.slot), index))
            .collect();
        Self { ranges, starts }
    }

    /// If `locator` opens a range the predicate excludes, returns where
    /// reading resumes: `Some(None)` when no later range can match.
    fn skip_from(&self, locator: RowLocator, predicate: &ScanPredicate) -> Option<Option<RowLocator>> {
        if locator.member != 0 {
            return None;
        }
        let index = *self.starts.get(&locator)?;
        if predicate.may_match(&self.ranges[index].columns) {
            return None;
        }
        let next = self.ranges[index + 1..]
            .iter()
            .find(|range| predicate.may_match(&range.columns))
            .map(|range| range.first);
        Some(next)
    }
}

/// Reads the rows of one run that fall within the bounds and satisfy the
/// predicate.
pub(crate) struct RunScan<'h> {
    reader: RunReader<'h>,
    comparator: &'h RowComparator,
    filter: Arc<RunFilter>,
    direction: ScanDirection,
    ranges: Option<RangeSkip>,
}

impl<'h> RunScan<'h> {
    /// Opens a scan of `run`, or `None` if its summary rules it out.
    pub(crate) fn open(
        core: &'h HeapCore,
        run: &RunMeta,
        direction: ScanDirection,
        filter: Arc<RunFilter>,
        needed: Option<Arc<[usize]>>,
    ) -> EngineResult<Option<Self>> {
        if !run.flags.contains(RunFlags::SUMMARY_DROPPED) && !filter.predicate.may_match(&run.summary)
        {
            trace!(run = run.run_no, "run excluded by summary");
            return Ok(None);
        }
        let mut reader = core
            .format
            .open_reader(&core.pool, run, direction, needed);

        if run.btree_root.is_valid() {
            let tree = BTree::open(&core.pool, &core.comparator, run.btree_root);
            let start = match (direction, &filter.lower, &filter.upper) {
                (ScanDirection::Forward, Some(lower), _) => {
                    Some(tree.find_first(&lower.prefix, lower.inclusive)?)
                }
                (ScanDirection::Backward, _, Some(upper)) => {
                    Some(tree.find_last(&upper.prefix, upper.inclusive)?)
                }
                _ => None,
            };
            match start {
                Some(Some(locator)) => reader.seek(locator),
                Some(None) => return Ok(None),
                None => {}
            }
        }

        let ranges = if direction == ScanDirection::Forward
            && !filter.predicate.is_empty()
            && run.range_anchor.is_valid()
        {
            Some(RangeSkip::new(load_ranges(&core.pool, run.range_anchor)?))
        } else {
            None
        };

        Ok(Some(Self {
            reader,
            comparator: &core.comparator,
            filter,
            direction,
            ranges,
        }))
    }

    pub(crate) fn next(&mut self) -> EngineResult<Option<(RowLocator, Row)>> {
        loop {
            let Some((locator, row)) = self.reader.next()? else {
                return Ok(None);
            };
            if let Some(ranges) = &self.ranges {
                if let Some(resume) = ranges.skip_from(locator, &self.filter.predicate) {
                    trace!(at = %locator, resume = ?resume, "skipped block range");
                    match resume {
                        Some(next) => self.reader.seek(next),
                        None => self.reader.exhaust(),
                    }
                    continue;
                }
            }
            let (near, far) = match self.direction {
                ScanDirection::Forward => (
                    self.filter.below_lower(self.comparator, &row),
                    self.filter.above_upper(self.comparator, &row),
                ),
                ScanDirection::Backward => (
                    self.filter.above_upper(self.comparator, &row),
                    self.filter.below_lower(self.comparator, &row),
                ),
            };
            if far {
                self.reader.exhaust();
                return Ok(None);
            }
            if near || !self.filter.predicate.matches(&row) {
                continue;
            }
            return Ok(Some((locator, row)));
        }
    }
}

impl RowSource for RunScan<'_> {
    fn next_row(&mut self) -> EngineResult<Option<(RowLocator, Row)>> {
        self.next()
    }
}
