//! Typed column values.

use std::cmp::Ordering;
use std::fmt;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int = 1,
    /// 64-bit float.
    Float = 2,
    /// UTF-8 text.
    Text = 3,
    /// Raw bytes.
    Bytes = 4,
    /// Boolean.
    Bool = 5,
    /// Microseconds since the Unix epoch.
    Timestamp = 6,
}

impl ColumnType {
    /// Creates a `ColumnType` from its raw tag.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::Text),
            4 => Some(Self::Bytes),
            5 => Some(Self::Bool),
            6 => Some(Self::Timestamp),
            _ => None,
        }
    }

    /// Returns the raw tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for fixed-width types.
    pub const fn is_fixed(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Bool | Self::Timestamp)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// SQL NULL.
    #[default]
    Null,
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Text(String),
    /// Bytes.
    Bytes(Vec<u8>),
    /// Boolean.
    Bool(bool),
    /// Timestamp in microseconds.
    Timestamp(i64),
}

pub(crate) static NULL: Value = Value::Null;

impl Value {
    /// Returns true for `Null`.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type of a non-null value.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(ColumnType::Int),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Bytes(_) => Some(ColumnType::Bytes),
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    /// Integer payload.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload as a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
        }
    }

    /// Compares two values of comparable types.
    ///
    /// Integers and floats compare numerically; any other mix of types, and
    /// any comparison involving `Null`, is `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Int(a), Value::Float(b)) => Some((*a as f64).total_cmp(b)),
            (Value::Float(a), Value::Int(b)) => Some(a.total_cmp(&(*b as f64))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: comparable values by [`compare`],
    /// everything else by type, `Null` lowest.
    ///
    /// [`compare`]: Value::compare
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        self.compare(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Timestamp(t) => write!(f, "ts:{t}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_cross_compare() {
        assert_eq!(Value::Int(3).compare(&Value::Float(3.5)), Some(Ordering::Less));
        assert_eq!(Value::Float(2.0).compare(&Value::Int(2)), Some(Ordering::Equal));
        assert_eq!(Value::Int(1).compare(&Value::Text("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_sort_cmp_is_total() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Int(5),
            Value::Null,
            Value::Bool(true),
            Value::Float(-1.5),
            Value::Text("a".into()),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Float(-1.5),
                Value::Int(5),
                Value::Text("a".into()),
                Value::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(7i64).as_int(), Some(7));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::Int(4).as_float(), Some(4.0));
        assert_eq!(ColumnType::from_u8(ColumnType::Text.as_u8()), Some(ColumnType::Text));
        assert_eq!(ColumnType::from_u8(0), None);
    }
}
