//! K-way merge of sorted row sources.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use sortheap_common::types::RowLocator;
use sortheap_storage::row::{Row, RowComparator, SortTuple};
use sortheap_storage::tape::ScanDirection;

use crate::error::EngineResult;
use crate::format::{RunReader, TupleFormat};

/// A sorted stream of rows with their locators.
pub(crate) trait RowSource {
    fn next_row(&mut self) -> EngineResult<Option<(RowLocator, Row)>>;
}

impl RowSource for RunReader<'_> {
    fn next_row(&mut self) -> EngineResult<Option<(RowLocator, Row)>> {
        self.next()
    }
}

#[derive(Clone, Copy)]
struct Order<'c> {
    comparator: &'c RowComparator,
    format: &'c dyn TupleFormat,
    direction: ScanDirection,
}

impl Order<'_> {
    /// Ordering in output order: `Less` comes out first.
    fn compare(&self, a: &Head, b: &Head) -> Ordering {
        let ord = self
            .format
            .compare(self.comparator, &a.tuple, &b.tuple)
            .then_with(|| a.source.cmp(&b.source));
        match self.direction {
            ScanDirection::Forward => ord,
            ScanDirection::Backward => ord.reverse(),
        }
    }
}

struct Head {
    tuple: SortTuple,
    locator: RowLocator,
    source: usize,
}

struct Entry<'c> {
    head: Head,
    order: Order<'c>,
}

impl PartialEq for Entry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry<'_> {}

impl PartialOrd for Entry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum.
        self.order.compare(&other.head, &self.head)
    }
}

/// Merges sorted sources into one stream in `direction` order.
///
/// Ties between sources go to the lower source index going forward and to
/// the higher one going backward, so a backward merge is the exact reverse
/// of a forward one.
pub(crate) struct KMerge<'c, S> {
    sources: Vec<S>,
    heap: BinaryHeap<Entry<'c>>,
    order: Order<'c>,
    primed: bool,
}

impl<'c, S: RowSource> KMerge<'c, S> {
    pub(crate) fn new(
        sources: Vec<S>,
        comparator: &'c RowComparator,
        format: &'c dyn TupleFormat,
        direction: ScanDirection,
    ) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources,
            heap,
            order: Order {
                comparator,
                format,
                direction,
            },
            primed: false,
        }
    }

    fn pull(&mut self, source: usize) -> EngineResult<()> {
        if let Some((locator, row)) = self.sources[source].next_row()? {
            let head = Head {
                tuple: SortTuple::new(row, self.order.comparator),
                locator,
                source,
            };
            self.heap.push(Entry {
                head,
                order: self.order,
            });
        }
        Ok(())
    }

    /// Returns the next tuple, its locator and the index of its source.
    pub(crate) fn next(&mut self) -> EngineResult<Option<(RowLocator, SortTuple, usize)>> {
        if !self.primed {
            for source in 0..self.sources.len() {
                self.pull(source)?;
            }
            self.primed = true;
        }
        let Some(Entry { head, .. }) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(head.source)?;
        Ok(Some((head.locator, head.tuple, head.source)))
    }
}
