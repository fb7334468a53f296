//! One encoded row per tuple.

use sortheap_common::types::RowLocator;
use sortheap_storage::buffer::BufferPool;
use sortheap_storage::row::Row;

use super::{fetch_row, RunBuilder, TupleFormat, TupleStream};
use crate::error::EngineResult;

/// Stores every row as one plain tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormat;

impl TupleFormat for PlainFormat {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn is_compressed(&self) -> bool {
        false
    }

    fn write_run(&self, run: &mut RunBuilder<'_>, tuples: &mut TupleStream<'_>) -> EngineResult<()> {
        for tuple in tuples {
            run.push_row(&tuple?)?;
        }
        Ok(())
    }

    fn fetch(&self, pool: &BufferPool, locator: RowLocator) -> EngineResult<Option<Row>> {
        fetch_row(pool, locator, false)
    }
}

#[cfg(test)]
mod tests {
    use sortheap_storage::tape::{ScanDirection, Tape};

    use super::*;
    use crate::format::tests::{comparator, read_all, row, setup, write};

    #[test]
    fn test_backward_read_reverses() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let rows: Vec<Row> = (0..300).map(|i| row(i, i)).collect();
        let meta = write(&PlainFormat, &tape, &cmp, rows.clone());

        let back: Vec<Row> = read_all(&PlainFormat, &pool, &meta, ScanDirection::Backward)
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        let mut expected = rows;
        expected.reverse();
        assert_eq!(back, expected);
    }

    #[test]
    fn test_fetch_by_locator() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let meta = write(&PlainFormat, &tape, &cmp, (0..50).map(|i| row(i, i)).collect());

        for (locator, expected) in read_all(&PlainFormat, &pool, &meta, ScanDirection::Forward) {
            assert_eq!(PlainFormat.fetch(&pool, locator).unwrap(), Some(expected));
        }
        assert_eq!(PlainFormat.fetch(&pool, meta.end).unwrap(), None);
        assert_eq!(PlainFormat.fetch(&pool, meta.first.with_member(1)).unwrap(), None);
        assert_eq!(PlainFormat.fetch(&pool, RowLocator::INVALID).unwrap(), None);
    }
}
