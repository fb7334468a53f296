//! Compressed groups.

use bytes::{Buf, BufMut, Bytes};
use sortheap_common::config::CompressionConfig;

use super::chunk::ColumnChunk;
use crate::error::{StorageError, StorageResult};
use crate::row::encoding::{decode_values_from, encode_values_into, encoded_values_len};
use crate::row::{Row, Value};
use crate::tape::{BlobSink, BlobSource};

/// Same-key rows stored column-wise in one tuple.
///
/// ```text
/// rows u32 | columns u16 | key values | chunk count u16 | chunk...
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedGroup {
    /// Rows in the group.
    pub rows: u32,
    /// Columns per row.
    pub columns: u16,
    /// Sort key shared by every row.
    pub key: Vec<Value>,
    /// Column chunks in column order.
    pub chunks: Vec<ColumnChunk>,
}

impl CompressedGroup {
    /// Compresses `rows`, which share `key`.
    ///
    /// Chunks above the configured threshold go out of line right away; if
    /// the tuple still exceeds `max_payload`, the largest inline chunks
    /// follow until it fits.
    pub fn build(
        rows: &[Row],
        key: Vec<Value>,
        config: &CompressionConfig,
        max_payload: usize,
        sink: &mut dyn BlobSink,
    ) -> StorageResult<Self> {
        let columns = rows.first().map_or(0, Row::len);
        if rows.is_empty() || rows.iter().any(|r| r.len() != columns) {
            return Err(StorageError::invalid_argument(
                "compressed group needs rows of equal width",
            ));
        }
        let block = config.column_block_size.max(1);
        let mut chunks = Vec::with_capacity(columns.div_ceil(block));
        let mut first = 0;
        while first < columns {
            let count = block.min(columns - first);
            let mut chunk = ColumnChunk::build(rows, first, count, config.lz4);
            if chunk.stored_len() > config.outline_threshold {
                chunk.move_out_of_line(sink)?;
            }
            chunks.push(chunk);
            first += count;
        }

        let mut group = Self {
            rows: rows.len() as u32,
            columns: columns as u16,
            key,
            chunks,
        };
        while group.encoded_len() > max_payload {
            let largest = group
                .chunks
                .iter_mut()
                .filter(|c| c.is_inline())
                .max_by_key(|c| c.stored_len());
            match largest {
                Some(chunk) => chunk.move_out_of_line(sink)?,
                None => {
                    return Err(StorageError::RowTooLarge {
                        size: group.encoded_len(),
                        max_size: max_payload,
                    })
                }
            }
        }
        Ok(group)
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 2
            + encoded_values_len(&self.key)
            + 2
            + self.chunks.iter().map(ColumnChunk::encoded_len).sum::<usize>()
    }

    /// Encodes the group.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.put_u32_le(self.rows);
        out.put_u16_le(self.columns);
        encode_values_into(&self.key, &mut out);
        out.put_u16_le(self.chunks.len() as u16);
        for chunk in &self.chunks {
            chunk.encode_into(&mut out);
        }
        out
    }

    /// Decodes a group; inline chunks share `payload`.
    pub fn decode(payload: &Bytes) -> StorageResult<Self> {
        let mut buf = payload.clone();
        if buf.remaining() < 6 {
            return Err(StorageError::decode("truncated compressed group"));
        }
        let rows = buf.get_u32_le();
        let columns = buf.get_u16_le();
        let mut rest = &buf[..];
        let key = decode_values_from(&mut rest)?;
        let consumed = buf.len() - rest.len();
        buf.advance(consumed);
        if buf.remaining() < 2 {
            return Err(StorageError::decode("truncated compressed group"));
        }
        let count = buf.get_u16_le();
        let mut chunks = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            chunks.push(ColumnChunk::decode_from(&mut buf)?);
        }
        if buf.has_remaining() {
            return Err(StorageError::decode("trailing bytes in compressed group"));
        }
        let covered: usize = chunks.iter().map(|c| usize::from(c.column_count)).sum();
        if covered != usize::from(columns) {
            return Err(StorageError::decode(format!(
                "compressed group chunks cover {covered} of {columns} columns"
            )));
        }
        Ok(Self {
            rows,
            columns,
            key,
            chunks,
        })
    }
}

/// A compressed group whose columns are decoded on demand.
///
/// Decoded columns are cached, so reading every row of a group decodes each
/// chunk once. Columns not requested stay encoded and read back as `Null`.
pub struct DecodedGroup<'a> {
    group: CompressedGroup,
    source: &'a dyn BlobSource,
    columns: Vec<Option<Vec<Value>>>,
}

impl std::fmt::Debug for DecodedGroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedGroup")
            .field("rows", &self.group.rows)
            .field("columns", &self.group.columns)
            .field(
                "decoded",
                &self.columns.iter().filter(|c| c.is_some()).count(),
            )
            .finish()
    }
}

impl<'a> DecodedGroup<'a> {
    /// Wraps `group`, reading out-of-line chunks from `source`.
    pub fn new(group: CompressedGroup, source: &'a dyn BlobSource) -> Self {
        let columns = vec![None; usize::from(group.columns)];
        Self {
            group,
            source,
            columns,
        }
    }

    /// Rows in the group.
    pub fn rows(&self) -> usize {
        self.group.rows as usize
    }

    /// Shared sort key.
    pub fn key(&self) -> &[Value] {
        &self.group.key
    }

    /// Decodes the chunks holding `needed` columns, or every chunk.
    pub fn load(&mut self, needed: Option<&[usize]>) -> StorageResult<()> {
        let rows = self.rows();
        for chunk in &self.group.chunks {
            let range = chunk.columns();
            if range.end > self.columns.len() {
                return Err(StorageError::decode("column chunk beyond group width"));
            }
            let wanted = match needed {
                None => true,
                Some(cols) => cols.iter().any(|c| range.contains(c)),
            };
            if !wanted || self.columns[range.clone()].iter().all(Option::is_some) {
                continue;
            }
            let decoded = chunk.decode_columns(rows, self.source)?;
            for (slot, values) in self.columns[range].iter_mut().zip(decoded) {
                *slot = Some(values);
            }
        }
        Ok(())
    }

    /// Member `index` as a full-width row. `needed` limits the columns
    /// decoded; the others are `Null`.
    pub fn row(&mut self, index: usize, needed: Option<&[usize]>) -> StorageResult<Row> {
        if index >= self.rows() {
            return Err(StorageError::invalid_argument(format!(
                "group member {index} out of range ({} rows)",
                self.rows()
            )));
        }
        self.load(needed)?;
        let values = self
            .columns
            .iter()
            .enumerate()
            .map(|(column, decoded)| {
                let keep = needed.map_or(true, |cols| cols.contains(&column));
                match decoded {
                    Some(values) if keep => values[index].clone(),
                    _ => Value::Null,
                }
            })
            .collect();
        Ok(Row::new(values))
    }

    /// Decodes every row.
    pub fn into_rows(mut self) -> StorageResult<Vec<Row>> {
        self.load(None)?;
        let rows = self.rows();
        let mut columns: Vec<std::vec::IntoIter<Value>> = self
            .columns
            .into_iter()
            .map(|c| c.unwrap_or_default().into_iter())
            .collect();
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            out.push(Row::new(
                columns
                    .iter_mut()
                    .map(|c| c.next().unwrap_or_default())
                    .collect(),
            ));
        }
        Ok(out)
    }
}
