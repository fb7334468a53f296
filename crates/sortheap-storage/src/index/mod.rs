//! Per-run access structures.
//!
//! - [`BTree`] positions a scan at the first tuple within a key bound.
//! - [`RangeSummary`] lets a scan skip block ranges a predicate excludes.
//!
//! Both are written into the run's own tape while the run is produced and
//! reclaimed together with it.

mod brin;
mod btree;

pub use brin::{
    load_ranges, ColumnPredicate, ColumnSummary, CompareOp, RangeSummary, RangeSummaryBuilder,
    ScanPredicate,
};
pub use btree::{BTree, BTreeBuilder};
