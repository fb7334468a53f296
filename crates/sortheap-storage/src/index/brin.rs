//! Block-range summaries.
//!
//! Every `blocks_per_range` data blocks of a run get one [`RangeSummary`]
//! with the min/max of every column over the rows stored there, and the run
//! as a whole gets one more in its metadata. A scan with a
//! [`ScanPredicate`] checks the whole-run summary first and then skips every
//! range whose summary rules the predicate out.
//!
//! Summaries are conservative: a value too large to store, or a comparison
//! between incomparable types, never excludes a range.

use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};
use serde::Serialize;
use sortheap_common::constants::MAX_SUMMARY_VALUE_SIZE;
use sortheap_common::types::{BlockId, BlockType, RowLocator};

use crate::buffer::BufferPool;
use crate::error::{StorageError, StorageResult};
use crate::page::{PageHeader, SlottedPage};
use crate::row::encoding::{decode_value, encode_value, encoded_value_len};
use crate::row::{Row, Value};

const HAS_BOUNDS: u8 = 0b001;
const HAS_NULLS: u8 = 0b010;
const UNSUMMARIZED: u8 = 0b100;

/// Min/max of one column over a set of rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnSummary {
    /// Smallest non-null value.
    pub min: Option<Value>,
    /// Largest non-null value.
    pub max: Option<Value>,
    /// Some row has `Null` in the column.
    pub has_nulls: bool,
    /// Some value was too large to summarize; bounds are unusable.
    pub unsummarized: bool,
}

impl ColumnSummary {
    /// Summary of a column with known bounds.
    pub fn from_bounds(min: Value, max: Value) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            has_nulls: false,
            unsummarized: false,
        }
    }

    /// Folds one value in.
    pub fn add(&mut self, value: &Value) {
        if value.is_null() {
            self.has_nulls = true;
            return;
        }
        if self.unsummarized {
            return;
        }
        if encoded_value_len(value) > MAX_SUMMARY_VALUE_SIZE {
            self.unsummarized = true;
            self.min = None;
            self.max = None;
            return;
        }
        if self.min.as_ref().map_or(true, |m| value.sort_cmp(m) == Ordering::Less) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |m| value.sort_cmp(m) == Ordering::Greater) {
            self.max = Some(value.clone());
        }
    }

    /// Folds another summary in.
    pub fn merge(&mut self, other: &ColumnSummary) {
        self.has_nulls |= other.has_nulls;
        if other.unsummarized {
            self.unsummarized = true;
            self.min = None;
            self.max = None;
        }
        if self.unsummarized {
            return;
        }
        if let Some(min) = &other.min {
            self.add(min);
        }
        if let Some(max) = &other.max {
            self.add(max);
        }
    }

    /// Returns true if some stored value may satisfy `op value`.
    pub fn may_satisfy(&self, op: CompareOp, value: &Value) -> bool {
        if self.unsummarized {
            return true;
        }
        let (Some(min), Some(max)) = (&self.min, &self.max) else {
            // Only nulls, which satisfy no comparison.
            return false;
        };
        let at_least = |bound: &Value, pass: fn(Ordering) -> bool| {
            bound.compare(value).map_or(true, pass)
        };
        match op {
            CompareOp::Eq => at_least(min, Ordering::is_le) && at_least(max, Ordering::is_ge),
            CompareOp::Lt => at_least(min, Ordering::is_lt),
            CompareOp::Le => at_least(min, Ordering::is_le),
            CompareOp::Gt => at_least(max, Ordering::is_gt),
            CompareOp::Ge => at_least(max, Ordering::is_ge),
        }
    }

    /// Appends the encoded summary.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.min.is_some() && self.max.is_some() {
            flags |= HAS_BOUNDS;
        }
        if self.has_nulls {
            flags |= HAS_NULLS;
        }
        if self.unsummarized {
            flags |= UNSUMMARIZED;
        }
        out.put_u8(flags);
        if let (Some(min), Some(max)) = (&self.min, &self.max) {
            encode_value(min, out);
            encode_value(max, out);
        }
    }

    /// Reads one encoded summary, advancing `buf`.
    pub fn decode_from(buf: &mut &[u8]) -> StorageResult<Self> {
        if !buf.has_remaining() {
            return Err(StorageError::decode("truncated column summary"));
        }
        let flags = buf.get_u8();
        let (min, max) = if flags & HAS_BOUNDS != 0 {
            (Some(decode_value(buf)?), Some(decode_value(buf)?))
        } else {
            (None, None)
        };
        Ok(Self {
            min,
            max,
            has_nulls: flags & HAS_NULLS != 0,
            unsummarized: flags & UNSUMMARIZED != 0,
        })
    }

    fn unusable() -> Self {
        Self {
            unsummarized: true,
            ..Self::default()
        }
    }
}

/// Comparison operator of a predicate term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord.is_eq(),
            Self::Lt => ord.is_lt(),
            Self::Le => ord.is_le(),
            Self::Gt => ord.is_gt(),
            Self::Ge => ord.is_ge(),
        }
    }
}

/// One `column op value` term.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    /// Column index.
    pub column: usize,
    /// Operator.
    pub op: CompareOp,
    /// Constant compared against.
    pub value: Value,
}

/// A conjunction of column comparisons.
///
/// # Example
///
/// ```rust
/// use sortheap_storage::index::{CompareOp, ScanPredicate};
/// use sortheap_storage::row::{Row, Value};
///
/// let pred = ScanPredicate::new()
///     .and(0, CompareOp::Ge, Value::Int(10))
///     .and(0, CompareOp::Lt, Value::Int(20));
/// assert!(pred.matches(&Row::new(vec![Value::Int(15)])));
/// assert!(!pred.matches(&Row::new(vec![Value::Int(20)])));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanPredicate {
    terms: Vec<ColumnPredicate>,
}

impl ScanPredicate {
    /// A predicate every row satisfies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a term.
    #[must_use]
    pub fn and(mut self, column: usize, op: CompareOp, value: impl Into<Value>) -> Self {
        self.terms.push(ColumnPredicate {
            column,
            op,
            value: value.into(),
        });
        self
    }

    /// Terms of the conjunction.
    pub fn terms(&self) -> &[ColumnPredicate] {
        &self.terms
    }

    /// Returns true without terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluates the predicate on a row. `Null` and incomparable values
    /// satisfy no term.
    pub fn matches(&self, row: &Row) -> bool {
        self.terms.iter().all(|term| {
            row.get(term.column)
                .and_then(|v| v.compare(&term.value))
                .is_some_and(|ord| term.op.holds(ord))
        })
    }

    /// Returns false only if no row summarized by `columns` can match.
    pub fn may_match(&self, columns: &[ColumnSummary]) -> bool {
        self.terms.iter().all(|term| {
            columns
                .get(term.column)
                .map_or(true, |summary| summary.may_satisfy(term.op, &term.value))
        })
    }
}

/// Summary of one range of data blocks of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSummary {
    /// First data block of the range.
    pub first_block: BlockId,
    /// Last data block of the range.
    pub last_block: BlockId,
    /// First tuple stored in the range.
    pub first: RowLocator,
    /// Rows summarized.
    pub rows: u64,
    /// One entry per column.
    pub columns: Vec<ColumnSummary>,
}

impl RangeSummary {
    fn new(first: RowLocator, columns: usize) -> Self {
        Self {
            first_block: first.block,
            last_block: first.block,
            first,
            rows: 0,
            columns: vec![ColumnSummary::default(); columns],
        }
    }

    /// Encodes the range, degrading every column to unsummarized if the
    /// result would exceed `max_len` bytes.
    pub fn encode_bounded(&self, max_len: usize) -> Bytes {
        let encoded = self.encode_with(&self.columns);
        if encoded.len() <= max_len {
            return Bytes::from(encoded);
        }
        let unusable = vec![ColumnSummary::unusable(); self.columns.len()];
        Bytes::from(self.encode_with(&unusable))
    }

    fn encode_with(&self, columns: &[ColumnSummary]) -> Vec<u8> {
        let mut out = Vec::with_capacity(40 + columns.len() * 8);
        out.put_u64_le(self.first_block.as_u64());
        out.put_u64_le(self.last_block.as_u64());
        out.put_slice(&self.first.to_bytes());
        out.put_u64_le(self.rows);
        out.put_u16_le(columns.len() as u16);
        for column in columns {
            column.encode_into(&mut out);
        }
        out
    }

    /// Decodes a range record.
    pub fn decode(mut buf: &[u8]) -> StorageResult<Self> {
        if buf.remaining() < 8 + 8 + RowLocator::ENCODED_SIZE + 8 + 2 {
            return Err(StorageError::decode("truncated range summary"));
        }
        let first_block = BlockId::new(buf.get_u64_le());
        let last_block = BlockId::new(buf.get_u64_le());
        let first = RowLocator::from_bytes(buf).unwrap_or(RowLocator::INVALID);
        buf.advance(RowLocator::ENCODED_SIZE);
        let rows = buf.get_u64_le();
        let count = buf.get_u16_le() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(ColumnSummary::decode_from(&mut buf)?);
        }
        Ok(Self {
            first_block,
            last_block,
            first,
            rows,
            columns,
        })
    }
}

/// Accumulates range summaries while a run is written.
#[derive(Debug)]
pub struct RangeSummaryBuilder {
    blocks_per_range: usize,
    columns: usize,
    ranges: Vec<RangeSummary>,
    current: Option<RangeSummary>,
    blocks_in_current: usize,
    whole: Vec<ColumnSummary>,
}

impl RangeSummaryBuilder {
    /// Creates a builder for rows of `columns` columns.
    pub fn new(columns: usize, blocks_per_range: usize) -> Self {
        Self {
            blocks_per_range: blocks_per_range.max(1),
            columns,
            ranges: Vec::new(),
            current: None,
            blocks_in_current: 0,
            whole: vec![ColumnSummary::default(); columns],
        }
    }

    /// Records a row stored at `locator`. Rows must arrive in storage order.
    pub fn add(&mut self, locator: RowLocator, row: &Row) {
        let new_block = self
            .current
            .as_ref()
            .map_or(true, |range| range.last_block != locator.block);
        if new_block {
            if self.current.is_none() || self.blocks_in_current >= self.blocks_per_range {
                let first = RowLocator::new(locator.block, locator.slot);
                if let Some(done) = self.current.replace(RangeSummary::new(first, self.columns)) {
                    self.ranges.push(done);
                }
                self.blocks_in_current = 0;
            }
            self.blocks_in_current += 1;
        }
        if let Some(range) = self.current.as_mut() {
            range.last_block = locator.block;
            range.rows += 1;
            for (index, value) in row.values().iter().enumerate().take(self.columns) {
                range.columns[index].add(value);
                self.whole[index].add(value);
            }
        }
    }

    /// Range summaries and the whole-run summary.
    pub fn finish(mut self) -> (Vec<RangeSummary>, Vec<ColumnSummary>) {
        if let Some(done) = self.current.take() {
            self.ranges.push(done);
        }
        (self.ranges, self.whole)
    }
}

/// Reads the range summaries chained from `anchor`.
pub fn load_ranges(pool: &BufferPool, anchor: BlockId) -> StorageResult<Vec<RangeSummary>> {
    let mut ranges = Vec::new();
    let mut block = anchor;
    while block.is_valid() {
        let page = pool.read_typed(block, BlockType::RangeSummary)?;
        for record in SlottedPage::new(&page[..]).records() {
            ranges.push(RangeSummary::decode(record)?);
        }
        block = PageHeader::new(&page[..]).next();
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sortheap_common::types::BlockId;

    fn loc(block: u64, slot: u16) -> RowLocator {
        RowLocator::new(BlockId::new(block), slot)
    }

    #[test]
    fn test_summary_bounds_and_nulls() {
        let mut summary = ColumnSummary::default();
        for v in [Value::Int(5), Value::Null, Value::Int(-3), Value::Int(12)] {
            summary.add(&v);
        }
        assert_eq!(summary.min, Some(Value::Int(-3)));
        assert_eq!(summary.max, Some(Value::Int(12)));
        assert!(summary.has_nulls);

        assert!(summary.may_satisfy(CompareOp::Eq, &Value::Int(0)));
        assert!(!summary.may_satisfy(CompareOp::Gt, &Value::Int(12)));
        assert!(summary.may_satisfy(CompareOp::Ge, &Value::Int(12)));
        assert!(!summary.may_satisfy(CompareOp::Lt, &Value::Int(-3)));
        assert!(summary.may_satisfy(CompareOp::Lt, &Value::Float(-2.5)));
        assert!(summary.may_satisfy(CompareOp::Eq, &Value::from("text")));

        let mut nulls = ColumnSummary::default();
        nulls.add(&Value::Null);
        assert!(!nulls.may_satisfy(CompareOp::Ge, &Value::Int(0)));
    }

    #[test]
    fn test_oversized_values_are_unsummarized() {
        let mut summary = ColumnSummary::default();
        summary.add(&Value::from("a"));
        summary.add(&Value::Text("x".repeat(MAX_SUMMARY_VALUE_SIZE)));
        summary.add(&Value::from("b"));
        assert!(summary.unsummarized);
        assert!(summary.min.is_none());
        assert!(summary.may_satisfy(CompareOp::Eq, &Value::from("zzz")));
    }

    #[test]
    fn test_summary_encoding() {
        let mut summary = ColumnSummary::from_bounds(Value::Int(1), Value::Int(2));
        summary.has_nulls = true;
        let mut out = Vec::new();
        summary.encode_into(&mut out);
        ColumnSummary::unusable().encode_into(&mut out);
        let mut buf = &out[..];
        assert_eq!(ColumnSummary::decode_from(&mut buf).unwrap(), summary);
        assert!(ColumnSummary::decode_from(&mut buf).unwrap().unsummarized);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_builder_ranges_follow_blocks() {
        let mut builder = RangeSummaryBuilder::new(1, 2);
        let mut value = 0;
        for block in 10..15u64 {
            for slot in 0..3u16 {
                builder.add(loc(block, slot), &Row::new(vec![Value::Int(value)]));
                value += 1;
            }
        }
        let (ranges, whole) = builder.finish();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].first, loc(10, 0));
        assert_eq!(ranges[0].last_block, BlockId::new(11));
        assert_eq!(ranges[1].first, loc(12, 0));
        assert_eq!(ranges[2].first_block, BlockId::new(14));
        assert_eq!(ranges[2].rows, 3);
        assert_eq!(ranges[1].columns[0].min, Some(Value::Int(6)));
        assert_eq!(ranges[1].columns[0].max, Some(Value::Int(11)));
        assert_eq!(whole[0], ColumnSummary::from_bounds(Value::Int(0), Value::Int(14)));

        let bytes = ranges[1].encode_bounded(4096);
        assert_eq!(RangeSummary::decode(&bytes).unwrap(), ranges[1]);
        let degraded = RangeSummary::decode(&ranges[1].encode_bounded(10)).unwrap();
        assert!(degraded.columns[0].unsummarized);
    }

    proptest! {
        #[test]
        fn prop_summary_covers_every_value(values in proptest::collection::vec(-1000i64..1000, 1..64)) {
            let mut summary = ColumnSummary::default();
            for v in &values {
                summary.add(&Value::Int(*v));
            }
            for v in &values {
                let value = Value::Int(*v);
                prop_assert!(summary.min.as_ref().unwrap().sort_cmp(&value).is_le());
                prop_assert!(summary.max.as_ref().unwrap().sort_cmp(&value).is_ge());
                prop_assert!(summary.may_satisfy(CompareOp::Eq, &value));
            }
        }

        #[test]
        fn prop_may_match_never_excludes_a_match(
            values in proptest::collection::vec(-100i64..100, 1..32),
            bound in -120i64..120,
            op in prop_oneof![
                Just(CompareOp::Eq),
                Just(CompareOp::Lt),
                Just(CompareOp::Le),
                Just(CompareOp::Gt),
                Just(CompareOp::Ge),
            ],
        ) {
            let pred = ScanPredicate::new().and(0, op, Value::Int(bound));
            let mut summary = ColumnSummary::default();
            for v in &values {
                summary.add(&Value::Int(*v));
            }
            let any = values.iter().any(|v| pred.matches(&Row::new(vec![Value::Int(*v)])));
            if any {
                prop_assert!(pred.may_match(std::slice::from_ref(&summary)));
            }
        }
    }
}
