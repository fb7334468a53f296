//! Binary encoding of values and rows.
//!
//! ```text
//! value  := tag: u8 payload
//!   Null       tag 0
//!   Int        tag 1, i64 LE
//!   Float      tag 2, f64 bits LE
//!   Text       tag 3, u32 LE length, UTF-8 bytes
//!   Bytes      tag 4, u32 LE length, bytes
//!   Bool       tag 5, u8
//!   Timestamp  tag 6, i64 LE
//! values := count: u16 LE, value*
//! ```

use bytes::{Buf, BufMut};

use super::value::Value;
use crate::error::{StorageError, StorageResult};

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_TIMESTAMP: u8 = 6;

/// Encoded size of one value.
pub fn encoded_value_len(value: &Value) -> usize {
    1 + match value {
        Value::Null => 0,
        Value::Int(_) | Value::Float(_) | Value::Timestamp(_) => 8,
        Value::Bool(_) => 1,
        Value::Text(s) => 4 + s.len(),
        Value::Bytes(b) => 4 + b.len(),
    }
}

/// Appends one value.
pub fn encode_value(value: &Value, buf: &mut impl BufMut) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64_le(*v);
        }
        Value::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_u64_le(v.to_bits());
        }
        Value::Text(s) => {
            buf.put_u8(TAG_TEXT);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Bool(v) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*v));
        }
        Value::Timestamp(v) => {
            buf.put_u8(TAG_TIMESTAMP);
            buf.put_i64_le(*v);
        }
    }
}

fn need(buf: &&[u8], len: usize, what: &str) -> StorageResult<()> {
    if buf.remaining() < len {
        return Err(StorageError::decode(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Reads one value, advancing `buf`.
pub fn decode_value(buf: &mut &[u8]) -> StorageResult<Value> {
    need(buf, 1, "value tag")?;
    let tag = buf.get_u8();
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_INT => {
            need(buf, 8, "int")?;
            Value::Int(buf.get_i64_le())
        }
        TAG_FLOAT => {
            need(buf, 8, "float")?;
            Value::Float(f64::from_bits(buf.get_u64_le()))
        }
        TAG_TEXT | TAG_BYTES => {
            need(buf, 4, "length")?;
            let len = buf.get_u32_le() as usize;
            need(buf, len, "payload")?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            if tag == TAG_TEXT {
                Value::Text(
                    String::from_utf8(bytes).map_err(|e| StorageError::decode(e.to_string()))?,
                )
            } else {
                Value::Bytes(bytes)
            }
        }
        TAG_BOOL => {
            need(buf, 1, "bool")?;
            Value::Bool(buf.get_u8() != 0)
        }
        TAG_TIMESTAMP => {
            need(buf, 8, "timestamp")?;
            Value::Timestamp(buf.get_i64_le())
        }
        other => return Err(StorageError::decode(format!("unknown value tag {other}"))),
    };
    Ok(value)
}

/// Encoded size of a value list.
pub fn encoded_values_len(values: &[Value]) -> usize {
    2 + values.iter().map(encoded_value_len).sum::<usize>()
}

/// Appends a counted value list.
pub fn encode_values_into(values: &[Value], buf: &mut impl BufMut) {
    buf.put_u16_le(values.len() as u16);
    for value in values {
        encode_value(value, buf);
    }
}

/// Encodes a counted value list.
pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_values_len(values));
    encode_values_into(values, &mut out);
    out
}

/// Reads a counted value list, advancing `buf`.
pub fn decode_values_from(buf: &mut &[u8]) -> StorageResult<Vec<Value>> {
    need(buf, 2, "value count")?;
    let count = buf.get_u16_le() as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(buf)?);
    }
    Ok(values)
}

/// Decodes a counted value list that must span all of `bytes`.
pub fn decode_values(bytes: &[u8]) -> StorageResult<Vec<Value>> {
    let mut buf = bytes;
    let values = decode_values_from(&mut buf)?;
    if !buf.is_empty() {
        return Err(StorageError::decode(format!(
            "{} trailing bytes after values",
            buf.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Int(-42),
            Value::Float(1.25),
            Value::Text("héllo".into()),
            Value::Bytes(vec![0, 1, 2]),
            Value::Bool(true),
            Value::Timestamp(1_700_000_000_000_000),
        ]
    }

    #[test]
    fn test_values_roundtrip() {
        let values = sample();
        let bytes = encode_values(&values);
        assert_eq!(bytes.len(), encoded_values_len(&values));
        assert_eq!(decode_values(&bytes).unwrap(), values);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = encode_values(&sample());
        for cut in 0..bytes.len() {
            assert!(decode_values(&bytes[..cut]).is_err(), "cut at {cut}");
        }
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(decode_values(&extra).is_err());
    }

    #[test]
    fn test_unknown_tag() {
        let err = decode_values(&[1, 0, 99]).unwrap_err();
        assert!(err.to_string().contains("unknown value tag"));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Timestamp),
            any::<bool>().prop_map(Value::Bool),
            "[a-z]{0,12}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(values in proptest::collection::vec(arb_value(), 0..12)) {
            prop_assert_eq!(decode_values(&encode_values(&values)).unwrap(), values);
        }
    }
}
