//! Sort-key extraction and comparison.

use std::cmp::Ordering;

use super::schema::{SortKey, SortKeyColumn};
use super::tuple::SortTuple;
use super::value::{Value, NULL};
use super::Row;

/// Compares rows, tuples and key prefixes under one sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowComparator {
    key: SortKey,
}

impl RowComparator {
    /// Creates a comparator for `key`.
    pub fn new(key: SortKey) -> Self {
        Self { key }
    }

    /// The sort key.
    pub fn key(&self) -> &SortKey {
        &self.key
    }

    /// Compares two values of one key column, honouring direction and null
    /// placement.
    pub fn compare_values(column: &SortKeyColumn, a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if column.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if column.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.sort_cmp(b);
                if column.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }

    /// Key values of `row`, in key order.
    pub fn extract_key(&self, row: &Row) -> Vec<Value> {
        self.key
            .columns()
            .iter()
            .map(|k| row.get(k.column).cloned().unwrap_or_default())
            .collect()
    }

    /// Compares two extracted keys column by column.
    ///
    /// Only the common prefix is compared, so a shorter key equals every
    /// longer key that starts with it.
    pub fn compare_keys(&self, a: &[Value], b: &[Value]) -> Ordering {
        self.key
            .columns()
            .iter()
            .zip(a.iter().zip(b))
            .map(|(column, (x, y))| Self::compare_values(column, x, y))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Compares a key prefix against a row.
    pub fn compare_prefix(&self, prefix: &[Value], row: &Row) -> Ordering {
        self.key
            .columns()
            .iter()
            .zip(prefix)
            .map(|(column, value)| {
                Self::compare_values(column, value, row.get(column.column).unwrap_or(&NULL))
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Compares two rows by the full key.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for column in self.key.columns() {
            let x = a.get(column.column).unwrap_or(&NULL);
            let y = b.get(column.column).unwrap_or(&NULL);
            let ord = Self::compare_values(column, x, y);
            if ord.is_ne() {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compares two tuples, using their cached key values when present.
    pub fn compare_tuples(&self, a: &SortTuple, b: &SortTuple) -> Ordering {
        for (index, column) in self.key.columns().iter().enumerate() {
            let x = a.key_value(index, column);
            let y = b.key_value(index, column);
            let ord = Self::compare_values(column, x, y);
            if ord.is_ne() {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Sorts rows in key order; equal keys keep their input order.
    pub fn sort_rows(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| self.compare_rows(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(a: impl Into<Value>, b: impl Into<Value>) -> Row {
        Row::new(vec![a.into(), b.into()])
    }

    #[test]
    fn test_multi_column_order() {
        let cmp = RowComparator::new(SortKey::new(vec![
            SortKeyColumn::asc(0),
            SortKeyColumn::desc(1),
        ]));
        let mut rows = vec![row(2, 1), row(1, 1), row(1, 5), row(2, 9)];
        cmp.sort_rows(&mut rows);
        assert_eq!(rows, vec![row(1, 5), row(1, 1), row(2, 9), row(2, 1)]);
    }

    #[test]
    fn test_null_placement() {
        let asc = SortKeyColumn::asc(0);
        assert_eq!(
            RowComparator::compare_values(&asc, &Value::Null, &Value::Int(1)),
            Ordering::Greater
        );
        let first = asc.with_nulls_first(true);
        assert_eq!(
            RowComparator::compare_values(&first, &Value::Null, &Value::Int(1)),
            Ordering::Less
        );
        let desc = SortKeyColumn::desc(0);
        assert_eq!(
            RowComparator::compare_values(&desc, &Value::Int(1), &Value::Null),
            Ordering::Greater
        );
        assert_eq!(
            RowComparator::compare_values(&desc, &Value::Null, &Value::Null),
            Ordering::Equal
        );
    }

    #[test]
    fn test_prefix_comparison() {
        let cmp = RowComparator::new(SortKey::new(vec![
            SortKeyColumn::asc(0),
            SortKeyColumn::asc(1),
        ]));
        let r = row(5, "x");
        assert_eq!(cmp.compare_prefix(&[Value::Int(5)], &r), Ordering::Equal);
        assert_eq!(cmp.compare_prefix(&[Value::Int(4)], &r), Ordering::Less);
        assert_eq!(
            cmp.compare_prefix(&[Value::Int(5), Value::from("y")], &r),
            Ordering::Greater
        );
        assert_eq!(
            cmp.compare_keys(&[Value::Int(5)], &cmp.extract_key(&r)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_tuples_agree_with_rows() {
        let cmp = RowComparator::new(SortKey::new(vec![
            SortKeyColumn::asc(1),
            SortKeyColumn::asc(0),
        ]));
        let a = row(3, "a");
        let b = row(1, "b");
        let ta = SortTuple::new(a.clone(), &cmp);
        let tb = SortTuple::new(b.clone(), &cmp);
        assert_eq!(cmp.compare_tuples(&ta, &tb), cmp.compare_rows(&a, &b));
        assert_eq!(cmp.compare_tuples(&ta, &tb), Ordering::Less);
    }
}
