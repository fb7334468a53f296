//! Table schema and sort key.

use bytes::{Buf, BufMut};

use super::value::{ColumnType, Value};
use super::Row;
use crate::error::{StorageError, StorageResult};

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub column_type: ColumnType,
    /// Whether `Null` is accepted.
    pub nullable: bool,
}

impl Column {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// Allows `Null` values.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// One column of the sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKeyColumn {
    /// Index of the column in the schema.
    pub column: usize,
    /// Sort descending.
    pub descending: bool,
    /// Place `Null` before every value.
    pub nulls_first: bool,
}

impl SortKeyColumn {
    /// Ascending, nulls last.
    pub const fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    /// Descending, nulls first.
    pub const fn desc(column: usize) -> Self {
        Self {
            column,
            descending: true,
            nulls_first: true,
        }
    }

    /// Overrides null placement.
    #[must_use]
    pub const fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }
}

/// The declared multi-column sort key of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    columns: Vec<SortKeyColumn>,
}

impl SortKey {
    /// Creates a sort key.
    pub fn new(columns: Vec<SortKeyColumn>) -> Self {
        Self { columns }
    }

    /// Key columns in significance order.
    pub fn columns(&self) -> &[SortKeyColumn] {
        &self.columns
    }

    /// Number of key columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the key has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Columns plus sort key.
///
/// # Example
///
/// ```rust
/// use sortheap_storage::row::{Column, ColumnType, Row, Schema, SortKey, SortKeyColumn, Value};
///
/// let schema = Schema::new(
///     vec![Column::new("ts", ColumnType::Timestamp), Column::new("v", ColumnType::Float)],
///     SortKey::new(vec![SortKeyColumn::asc(0)]),
/// ).unwrap();
/// assert!(schema.check_row(&Row::new(vec![Value::Timestamp(1), Value::Float(0.5)])).is_ok());
/// assert!(schema.check_row(&Row::new(vec![Value::Int(1)])).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
    sort_key: SortKey,
}

impl Schema {
    /// Creates a schema, checking that the key names existing columns.
    pub fn new(columns: Vec<Column>, sort_key: SortKey) -> StorageResult<Self> {
        if columns.is_empty() || columns.len() > usize::from(u16::MAX) {
            return Err(StorageError::invalid_argument(
                "schema needs between 1 and 65535 columns",
            ));
        }
        if sort_key.is_empty() {
            return Err(StorageError::invalid_argument("sort key has no columns"));
        }
        if let Some(bad) = sort_key.columns().iter().find(|c| c.column >= columns.len()) {
            return Err(StorageError::invalid_argument(format!(
                "sort key column {} out of range",
                bad.column
            )));
        }
        Ok(Self { columns, sort_key })
    }

    /// Columns in storage order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column `index`.
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Index of the column called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Always false; a schema has at least one column.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The sort key.
    pub fn sort_key(&self) -> &SortKey {
        &self.sort_key
    }

    /// Checks arity, types and nullability of a row.
    pub fn check_row(&self, row: &Row) -> StorageResult<()> {
        if row.len() != self.columns.len() {
            return Err(StorageError::invalid_argument(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row.values()) {
            match value.column_type() {
                None if !column.nullable => {
                    return Err(StorageError::invalid_argument(format!(
                        "column {} is not nullable",
                        column.name
                    )));
                }
                Some(ty) if ty != column.column_type => {
                    return Err(StorageError::invalid_argument(format!(
                        "column {} expects {}, got {ty}",
                        column.name, column.column_type
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns the key values of a row, in key order.
    pub fn key_of(&self, row: &Row) -> Vec<Value> {
        self.sort_key
            .columns()
            .iter()
            .map(|k| row.get(k.column).cloned().unwrap_or_default())
            .collect()
    }

    /// Encodes the schema for the metadata block.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            out.put_u8(column.column_type.as_u8());
            out.put_u8(u8::from(column.nullable));
            out.put_u16_le(column.name.len() as u16);
            out.put_slice(column.name.as_bytes());
        }
        out.put_u16_le(self.sort_key.len() as u16);
        for key in self.sort_key.columns() {
            out.put_u16_le(key.column as u16);
            out.put_u8(u8::from(key.descending) | (u8::from(key.nulls_first) << 1));
        }
        out
    }

    /// Decodes a schema written by [`Schema::encode`].
    pub fn decode(mut buf: &[u8]) -> StorageResult<Self> {
        let truncated = || StorageError::decode("truncated schema");
        if buf.remaining() < 2 {
            return Err(truncated());
        }
        let count = buf.get_u16_le() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(truncated());
            }
            let tag = buf.get_u8();
            let nullable = buf.get_u8() != 0;
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(truncated());
            }
            let name = String::from_utf8(buf[..len].to_vec())
                .map_err(|e| StorageError::decode(e.to_string()))?;
            buf.advance(len);
            let column_type = ColumnType::from_u8(tag)
                .ok_or_else(|| StorageError::decode(format!("unknown column type {tag}")))?;
            columns.push(Column {
                name,
                column_type,
                nullable,
            });
        }
        if buf.remaining() < 2 {
            return Err(truncated());
        }
        let keys = buf.get_u16_le() as usize;
        let mut key_columns = Vec::with_capacity(keys);
        for _ in 0..keys {
            if buf.remaining() < 3 {
                return Err(truncated());
            }
            let column = buf.get_u16_le() as usize;
            let flags = buf.get_u8();
            key_columns.push(SortKeyColumn {
                column,
                descending: flags & 1 != 0,
                nulls_first: flags & 2 != 0,
            });
        }
        Self::new(columns, SortKey::new(key_columns))
    }
}
