//! Row model: typed values, schema, sort key and comparison.

mod comparator;
pub mod encoding;
mod schema;
mod tuple;
mod value;

pub use comparator::RowComparator;
pub use schema::{Column, Schema, SortKey, SortKeyColumn};
pub use tuple::SortTuple;
pub use value::{ColumnType, Value};

use crate::error::StorageResult;

/// An ordered list of column values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Creates a row.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Column values.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of column `index`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true for a row without values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Keeps only the listed columns, in the listed order.
    pub fn project(&self, columns: &[usize]) -> Row {
        Row::new(
            columns
                .iter()
                .map(|&c| self.values.get(c).cloned().unwrap_or_default())
                .collect(),
        )
    }

    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        encoding::encoded_values_len(&self.values)
    }

    /// Encodes the row.
    pub fn encode(&self) -> Vec<u8> {
        encoding::encode_values(&self.values)
    }

    /// Decodes a row written by [`Row::encode`].
    pub fn decode(bytes: &[u8]) -> StorageResult<Row> {
        encoding::decode_values(bytes).map(Row::new)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}
