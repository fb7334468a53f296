//! Column compression of same-key stretches.
//!
//! The grouper sees the sorted stream one tuple at a time and releases plain
//! rows or closed groups as soon as they are final, so a run never holds
//! more than one open group in memory. Each group becomes a single tuple
//! with the `COMPRESSED` flag; its members share the tuple's locator and
//! differ only by member index.

use sortheap_common::config::CompressionConfig;
use sortheap_common::types::RowLocator;
use sortheap_storage::buffer::BufferPool;
use sortheap_storage::columnar::{ColumnGrouper, GroupOutput};
use sortheap_storage::row::Row;

use super::{fetch_row, RunBuilder, TupleFormat, TupleStream};
use crate::error::EngineResult;

/// Stores long same-key stretches as compressed groups.
#[derive(Debug, Clone)]
pub struct CompressedFormat {
    config: CompressionConfig,
}

impl CompressedFormat {
    /// Creates the format with the given group thresholds.
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Group thresholds.
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    fn emit(&self, run: &mut RunBuilder<'_>, out: &mut Vec<GroupOutput>) -> EngineResult<()> {
        for output in out.drain(..) {
            match output {
                GroupOutput::Plain(tuple) => {
                    run.push_row(&tuple)?;
                }
                GroupOutput::Group(tuples) => {
                    run.push_group(tuples, &self.config)?;
                }
            }
        }
        Ok(())
    }
}

impl TupleFormat for CompressedFormat {
    fn name(&self) -> &'static str {
        "compressed"
    }

    fn is_compressed(&self) -> bool {
        true
    }

    fn write_run(&self, run: &mut RunBuilder<'_>, tuples: &mut TupleStream<'_>) -> EngineResult<()> {
        run.mark_compressed();
        let comparator = run.comparator();
        let mut grouper = ColumnGrouper::new(self.config.clone());
        let mut out = Vec::new();
        for tuple in tuples {
            grouper.push(tuple?, comparator, &mut out);
            self.emit(run, &mut out)?;
        }
        grouper.flush(&mut out);
        self.emit(run, &mut out)
    }

    fn fetch(&self, pool: &BufferPool, locator: RowLocator) -> EngineResult<Option<Row>> {
        fetch_row(pool, locator, true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sortheap_storage::row::Value;
    use sortheap_storage::tape::{ScanDirection, Tape};

    use super::*;
    use crate::format::tests::{comparator, read_all, row, setup, write};

    fn format() -> CompressedFormat {
        CompressedFormat::new(
            CompressionConfig::enabled()
                .with_min_group_rows(4)
                .with_min_group_bytes(16),
        )
    }

    /// Keys 0..10, each repeated `i + 1` times.
    fn skewed() -> Vec<Row> {
        let mut rows = Vec::new();
        let mut n = 0;
        for key in 0..10 {
            for _ in 0..=key {
                rows.push(row(key, n));
                n += 1;
            }
        }
        rows
    }

    #[test]
    fn test_groups_round_trip_in_order() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let format = format();
        let rows = skewed();
        let meta = write(&format, &tape, &cmp, rows.clone());

        assert!(meta.is_compressed());
        assert_eq!(meta.rows, rows.len() as u64);

        let forward = read_all(&format, &pool, &meta, ScanDirection::Forward);
        let read: Vec<Row> = forward.iter().map(|(_, r)| r.clone()).collect();
        assert_eq!(read, rows);
        assert!(forward.iter().any(|(loc, _)| loc.member > 0));

        let backward: Vec<Row> = read_all(&format, &pool, &meta, ScanDirection::Backward)
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        let mut expected = rows;
        expected.reverse();
        assert_eq!(backward, expected);
    }

    #[test]
    fn test_fetch_group_member() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let format = format();
        let meta = write(&format, &tape, &cmp, skewed());

        for (locator, expected) in read_all(&format, &pool, &meta, ScanDirection::Forward) {
            assert_eq!(format.fetch(&pool, locator).unwrap(), Some(expected));
        }
        let (grouped, _) = read_all(&format, &pool, &meta, ScanDirection::Forward)
            .into_iter()
            .find(|(loc, _)| loc.member > 0)
            .unwrap();
        assert_eq!(format.fetch(&pool, grouped.with_member(u16::MAX)).unwrap(), None);
    }

    #[test]
    fn test_projection_leaves_other_columns_null() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let format = format();
        let meta = write(&format, &tape, &cmp, skewed());

        let needed: Arc<[usize]> = Arc::from(vec![0usize]);
        let mut reader = format.open_reader(&pool, &meta, ScanDirection::Forward, Some(needed));
        while let Some((locator, row)) = reader.next().unwrap() {
            if locator.member > 0 {
                assert_eq!(row.get(1), Some(&Value::Null));
                assert!(!row.get(0).unwrap().is_null());
            }
        }
        assert!(reader.is_done());
    }
}
