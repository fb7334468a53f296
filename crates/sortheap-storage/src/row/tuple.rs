//! Rows with cached sort-key values.

use smallvec::SmallVec;
use sortheap_common::constants::MAX_CACHED_KEYS;

use super::comparator::RowComparator;
use super::schema::SortKeyColumn;
use super::value::{Value, NULL};
use super::Row;

/// A row plus up to [`MAX_CACHED_KEYS`] extracted key values.
///
/// Sorting and merging compare the same tuples many times; the cached values
/// spare a column lookup per comparison for the leading key columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SortTuple {
    row: Row,
    keys: SmallVec<[Value; MAX_CACHED_KEYS]>,
}

impl SortTuple {
    /// Wraps `row`, caching its leading key values.
    pub fn new(row: Row, comparator: &RowComparator) -> Self {
        let keys = comparator
            .key()
            .columns()
            .iter()
            .take(MAX_CACHED_KEYS)
            .map(|k| row.get(k.column).cloned().unwrap_or_default())
            .collect();
        Self { row, keys }
    }

    /// The row.
    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Consumes the tuple, returning the row.
    pub fn into_row(self) -> Row {
        self.row
    }

    /// Cached key values.
    pub fn cached_keys(&self) -> &[Value] {
        &self.keys
    }

    /// Value of key column `index`, from the cache when present.
    #[inline]
    pub fn key_value(&self, index: usize, column: &SortKeyColumn) -> &Value {
        match self.keys.get(index) {
            Some(value) => value,
            None => self.row.get(column.column).unwrap_or(&NULL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SortKey;

    #[test]
    fn test_cache_is_bounded() {
        let columns: Vec<_> = (0..6).map(SortKeyColumn::asc).collect();
        let cmp = RowComparator::new(SortKey::new(columns.clone()));
        let row = Row::new((0..6).map(Value::Int).collect());
        let tuple = SortTuple::new(row, &cmp);
        assert_eq!(tuple.cached_keys().len(), MAX_CACHED_KEYS);
        assert_eq!(tuple.key_value(5, &columns[5]), &Value::Int(5));
        assert_eq!(tuple.key_value(1, &columns[1]), &Value::Int(1));
    }
}
