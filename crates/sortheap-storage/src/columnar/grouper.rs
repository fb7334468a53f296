//! Streaming grouping of sorted tuples.

use std::cmp::Ordering;

use sortheap_common::config::CompressionConfig;

use crate::row::encoding::encoded_value_len;
use crate::row::{RowComparator, SortTuple};

/// What the grouper hands back to the run writer.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutput {
    /// A row stored as is.
    Plain(SortTuple),
    /// Same-key rows to be stored as one compressed group.
    Group(Vec<SortTuple>),
}

/// Splits a sorted tuple stream into compressible same-key groups.
///
/// A group closes when the key changes, when it reaches the configured row
/// or byte maximum, or when a row carries a value above `oversized_value`
/// (that row is always stored plain). Groups below the minimum row or byte
/// count come out as plain rows.
#[derive(Debug)]
pub struct ColumnGrouper {
    config: CompressionConfig,
    pending: Vec<SortTuple>,
    pending_bytes: usize,
}

impl ColumnGrouper {
    /// Creates a grouper.
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Rows waiting for their group to close.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feeds the next tuple, appending anything that became final to `out`.
    pub fn push(&mut self, tuple: SortTuple, comparator: &RowComparator, out: &mut Vec<GroupOutput>) {
        let oversized = tuple
            .row()
            .values()
            .iter()
            .any(|v| encoded_value_len(v) > self.config.oversized_value);
        if oversized {
            self.flush(out);
            out.push(GroupOutput::Plain(tuple));
            return;
        }

        let size = tuple.row().encoded_len();
        if let Some(head) = self.pending.first() {
            let closes = comparator.compare_tuples(head, &tuple) != Ordering::Equal
                || self.pending.len() >= self.config.max_group_rows
                || self.pending_bytes + size > self.config.max_group_bytes;
            if closes {
                self.flush(out);
            }
        }
        self.pending_bytes += size;
        self.pending.push(tuple);
    }

    /// Closes the current group.
    pub fn flush(&mut self, out: &mut Vec<GroupOutput>) {
        if self.pending.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.pending);
        let bytes = std::mem::take(&mut self.pending_bytes);
        if rows.len() < self.config.min_group_rows || bytes < self.config.min_group_bytes {
            out.extend(rows.into_iter().map(GroupOutput::Plain));
        } else {
            out.push(GroupOutput::Group(rows));
        }
    }
}
