//! Column chunks.
//!
//! A chunk holds a block of adjacent columns of one compressed group, laid
//! out column-major: every value of the first column, then every value of the
//! next. Chunk bytes are LZ4 compressed when that makes them smaller, and
//! stored either inside the group tuple or in an overflow chain.

use bytes::{Buf, BufMut, Bytes};
use serde::Serialize;
use sortheap_common::types::BlockId;

use crate::error::{StorageError, StorageResult};
use crate::row::encoding::{decode_value, encode_value, encoded_value_len};
use crate::row::{Row, Value};
use crate::tape::{BlobSink, BlobSource};

const STORAGE_INLINE: u8 = 0;
const STORAGE_OUT_OF_LINE: u8 = 1;

/// How chunk bytes are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ChunkCodec {
    /// Raw column-major values.
    Plain = 0,
    /// LZ4 block with the raw size prepended.
    Lz4 = 1,
}

impl ChunkCodec {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Plain),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// Where chunk bytes live.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkStorage {
    /// Inside the group tuple.
    Inline(Bytes),
    /// In an overflow chain.
    OutOfLine {
        /// First overflow block.
        first: BlockId,
        /// Stored length in bytes.
        len: u32,
    },
}

/// One block of columns of a compressed group.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChunk {
    /// First column held.
    pub first_column: u16,
    /// Number of columns held.
    pub column_count: u16,
    /// Encoding of the stored bytes.
    pub codec: ChunkCodec,
    /// Stored bytes.
    pub storage: ChunkStorage,
}

impl ColumnChunk {
    /// Encodes columns `first..first + count` of `rows`.
    pub fn build(rows: &[Row], first: usize, count: usize, lz4: bool) -> Self {
        let columns = first..first + count;
        let raw_len: usize = rows
            .iter()
            .flat_map(|row| row.values()[columns.clone()].iter())
            .map(encoded_value_len)
            .sum();
        let mut raw = Vec::with_capacity(raw_len);
        for column in columns {
            for row in rows {
                encode_value(&row.values()[column], &mut raw);
            }
        }

        let (codec, stored) = if lz4 {
            let compressed = lz4_flex::compress_prepend_size(&raw);
            if compressed.len() < raw.len() {
                (ChunkCodec::Lz4, compressed)
            } else {
                (ChunkCodec::Plain, raw)
            }
        } else {
            (ChunkCodec::Plain, raw)
        };
        Self {
            first_column: first as u16,
            column_count: count as u16,
            codec,
            storage: ChunkStorage::Inline(Bytes::from(stored)),
        }
    }

    /// Columns held.
    pub fn columns(&self) -> std::ops::Range<usize> {
        let first = usize::from(self.first_column);
        first..first + usize::from(self.column_count)
    }

    /// Stored length in bytes.
    pub fn stored_len(&self) -> usize {
        match &self.storage {
            ChunkStorage::Inline(bytes) => bytes.len(),
            ChunkStorage::OutOfLine { len, .. } => *len as usize,
        }
    }

    /// Returns true if the bytes live inside the group tuple.
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, ChunkStorage::Inline(_))
    }

    /// Moves the stored bytes into an overflow chain.
    pub fn move_out_of_line(&mut self, sink: &mut dyn BlobSink) -> StorageResult<()> {
        let ChunkStorage::Inline(bytes) = &self.storage else {
            return Ok(());
        };
        let len = bytes.len() as u32;
        let first = sink.write_blob(bytes)?;
        self.storage = ChunkStorage::OutOfLine { first, len };
        Ok(())
    }

    /// Bytes this chunk takes in the group tuple.
    pub fn encoded_len(&self) -> usize {
        2 + 2 + 1 + 1
            + match &self.storage {
                ChunkStorage::Inline(bytes) => 4 + bytes.len(),
                ChunkStorage::OutOfLine { .. } => 8 + 4,
            }
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u16_le(self.first_column);
        out.put_u16_le(self.column_count);
        out.put_u8(self.codec as u8);
        match &self.storage {
            ChunkStorage::Inline(bytes) => {
                out.put_u8(STORAGE_INLINE);
                out.put_u32_le(bytes.len() as u32);
                out.put_slice(bytes);
            }
            ChunkStorage::OutOfLine { first, len } => {
                out.put_u8(STORAGE_OUT_OF_LINE);
                out.put_u64_le(first.as_u64());
                out.put_u32_le(*len);
            }
        }
    }

    pub(crate) fn decode_from(buf: &mut Bytes) -> StorageResult<Self> {
        if buf.remaining() < 6 {
            return Err(StorageError::decode("truncated column chunk"));
        }
        let first_column = buf.get_u16_le();
        let column_count = buf.get_u16_le();
        let codec = ChunkCodec::from_u8(buf.get_u8())
            .ok_or_else(|| StorageError::decode("unknown chunk codec"))?;
        let storage = match buf.get_u8() {
            STORAGE_INLINE => {
                if buf.remaining() < 4 {
                    return Err(StorageError::decode("truncated column chunk"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(StorageError::decode("truncated column chunk"));
                }
                ChunkStorage::Inline(buf.split_to(len))
            }
            STORAGE_OUT_OF_LINE => {
                if buf.remaining() < 12 {
                    return Err(StorageError::decode("truncated column chunk"));
                }
                ChunkStorage::OutOfLine {
                    first: BlockId::new(buf.get_u64_le()),
                    len: buf.get_u32_le(),
                }
            }
            other => {
                return Err(StorageError::decode(format!("unknown chunk storage {other}")));
            }
        };
        Ok(Self {
            first_column,
            column_count,
            codec,
            storage,
        })
    }

    /// Decodes the chunk into one vector of `rows` values per column.
    pub fn decode_columns(
        &self,
        rows: usize,
        source: &dyn BlobSource,
    ) -> StorageResult<Vec<Vec<Value>>> {
        let stored = match &self.storage {
            ChunkStorage::Inline(bytes) => bytes.clone(),
            ChunkStorage::OutOfLine { first, len } => {
                Bytes::from(source.read_blob(*first, *len as usize)?)
            }
        };
        let raw = match self.codec {
            ChunkCodec::Plain => stored,
            ChunkCodec::Lz4 => Bytes::from(
                lz4_flex::decompress_size_prepended(&stored)
                    .map_err(|e| StorageError::Compression {
                        reason: e.to_string(),
                    })?,
            ),
        };
        let mut buf = &raw[..];
        let mut columns = Vec::with_capacity(usize::from(self.column_count));
        for _ in 0..self.column_count {
            let mut values = Vec::with_capacity(rows);
            for _ in 0..rows {
                values.push(decode_value(&mut buf)?);
            }
            columns.push(values);
        }
        if !buf.is_empty() {
            return Err(StorageError::decode("trailing bytes in column chunk"));
        }
        Ok(columns)
    }
}
