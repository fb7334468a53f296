//! Tuple formats.
//!
//! A [`TupleFormat`] decides how a sorted tuple stream becomes physical
//! tuples of a run and how those tuples are read back. The relation picks
//! one when it is created:
//!
//! - [`PlainFormat`] stores every row as one encoded tuple;
//! - [`CompressedFormat`] stores long stretches of equal keys as column
//!   compressed groups and everything else as plain tuples.
//!
//! Both write through a [`RunBuilder`], which builds the run's B-tree and
//! range summaries while the tuples are placed.

mod compressed;
mod plain;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use sortheap_common::config::{CompressionConfig, EngineConfig};
use sortheap_common::types::{BlockType, RowLocator};
use sortheap_storage::buffer::{BufferPool, MiniTxn};
use sortheap_storage::columnar::{CompressedGroup, DecodedGroup};
use sortheap_storage::index::{BTreeBuilder, RangeSummaryBuilder};
use sortheap_storage::page::max_record_size;
use sortheap_storage::row::{Row, RowComparator, SortTuple};
use sortheap_storage::tape::{
    fetch_tuple, RunCursor, RunFlags, RunMeta, ScanDirection, StoredTuple, TapeWriter, TupleFlags,
};
use sortheap_storage::StorageError;
use tracing::trace;

use crate::error::{EngineError, EngineResult};

pub use compressed::CompressedFormat;
pub use plain::PlainFormat;

/// Stream of sorted tuples fed to a run writer.
pub type TupleStream<'s> = dyn Iterator<Item = EngineResult<SortTuple>> + 's;

/// How rows are laid out in runs.
pub trait TupleFormat: Send + Sync + fmt::Debug {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Returns true if runs may hold compressed groups.
    fn is_compressed(&self) -> bool;

    /// Writes a sorted stream as the tuples of one run.
    fn write_run(&self, run: &mut RunBuilder<'_>, tuples: &mut TupleStream<'_>) -> EngineResult<()>;

    /// Opens a reader over `run`. `needed` limits the columns decoded from
    /// compressed groups.
    fn open_reader<'p>(
        &self,
        pool: &'p BufferPool,
        run: &RunMeta,
        direction: ScanDirection,
        needed: Option<Arc<[usize]>>,
    ) -> RunReader<'p> {
        RunReader::new(pool, run, direction, needed, self.is_compressed())
    }

    /// Reads the row at `locator`.
    fn fetch(&self, pool: &BufferPool, locator: RowLocator) -> EngineResult<Option<Row>>;

    /// Orders two tuples.
    fn compare(&self, comparator: &RowComparator, a: &SortTuple, b: &SortTuple) -> Ordering {
        comparator.compare_tuples(a, b)
    }
}

/// Picks the format for a relation.
pub fn for_relation(compressed: bool, config: &CompressionConfig) -> Arc<dyn TupleFormat> {
    if compressed {
        Arc::new(CompressedFormat::new(config.clone()))
    } else {
        Arc::new(PlainFormat)
    }
}

/// Writes the tuples of one run plus its B-tree and range summaries.
#[derive(Debug)]
pub struct RunBuilder<'a> {
    writer: TapeWriter<'a>,
    comparator: &'a RowComparator,
    btree: BTreeBuilder,
    ranges: RangeSummaryBuilder,
    meta: RunMeta,
    fill_percent: u8,
}

impl<'a> RunBuilder<'a> {
    /// Starts a run described by `meta` on `writer`.
    pub fn new(
        writer: TapeWriter<'a>,
        comparator: &'a RowComparator,
        columns: usize,
        config: &EngineConfig,
        meta: RunMeta,
    ) -> Self {
        let block_size = writer.tape().pool().block_size();
        Self {
            writer,
            comparator,
            btree: BTreeBuilder::new(block_size),
            ranges: RangeSummaryBuilder::new(columns, config.blocks_per_range),
            meta,
            fill_percent: config.btree_fill_percent,
        }
    }

    /// Comparator of the relation.
    pub fn comparator(&self) -> &'a RowComparator {
        self.comparator
    }

    /// Logical rows written so far.
    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    /// Largest tuple payload the tape accepts.
    pub fn max_payload(&self) -> usize {
        self.writer.max_payload()
    }

    /// Flags the run as written by the compressed format.
    pub fn mark_compressed(&mut self) {
        self.meta.flags |= RunFlags::COMPRESSED;
    }

    /// Writes one row as a plain tuple.
    pub fn push_row(&mut self, tuple: &SortTuple) -> EngineResult<RowLocator> {
        let row = tuple.row();
        let locator = self.writer.write_tuple(TupleFlags::empty(), &row.encode())?;
        self.btree.add(locator, &self.comparator.extract_key(row));
        self.ranges.add(locator, row);
        self.meta.rows += 1;
        Ok(locator)
    }

    /// Writes same-key rows as one compressed group.
    pub fn push_group(
        &mut self,
        tuples: Vec<SortTuple>,
        config: &CompressionConfig,
    ) -> EngineResult<RowLocator> {
        let rows: Vec<Row> = tuples.into_iter().map(SortTuple::into_row).collect();
        let Some(head) = rows.first() else {
            return Err(EngineError::invalid_argument("empty compressed group"));
        };
        if u16::try_from(rows.len()).is_err() {
            return Err(EngineError::invalid_argument(format!(
                "group of {} rows exceeds the member limit",
                rows.len()
            )));
        }
        let key = self.comparator.extract_key(head);
        let max_payload = self.writer.max_payload();
        let group = CompressedGroup::build(&rows, key.clone(), config, max_payload, &mut self.writer)?;
        let locator = self
            .writer
            .write_tuple(TupleFlags::COMPRESSED, &group.encode())?;
        self.btree.add(locator, &key);
        for (member, row) in rows.iter().enumerate() {
            self.ranges.add(locator.with_member(member as u16), row);
        }
        self.meta.rows += rows.len() as u64;
        trace!(rows = rows.len(), chunks = group.chunks.len(), %locator, "wrote compressed group");
        Ok(locator)
    }

    /// Writes the B-tree and range summaries. The run still has to be
    /// committed with [`SealedRun::commit`].
    pub fn seal(self) -> EngineResult<SealedRun<'a>> {
        let Self {
            mut writer,
            btree,
            ranges,
            mut meta,
            fill_percent,
            ..
        } = self;

        if let Some((root, height)) = btree.finish(&mut writer, fill_percent)? {
            meta.btree_root = root;
            meta.btree_height = height;
        }
        let (ranges, whole) = ranges.finish();
        if meta.rows > 0 {
            let max = max_record_size(writer.tape().pool().block_size());
            let records: Vec<Bytes> = ranges.iter().map(|r| r.encode_bounded(max)).collect();
            let pages = writer.write_chain(BlockType::RangeSummary, &records, 100)?;
            if let Some((anchor, _)) = pages.first() {
                meta.range_anchor = *anchor;
            }
            meta.summary = whole;
        }
        Ok(SealedRun { writer, meta })
    }
}

/// A run whose tuples and indexes are written but not yet committed.
#[derive(Debug)]
pub struct SealedRun<'a> {
    writer: TapeWriter<'a>,
    meta: RunMeta,
}

impl SealedRun<'_> {
    /// Logical rows in the run.
    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    /// Commits the run in `mtr`, which must not yet hold the tape header.
    pub fn commit(self, mtr: &mut MiniTxn<'_>) -> EngineResult<RunMeta> {
        Ok(self.writer.finish(mtr, self.meta)?)
    }
}

/// Reads the rows of one run.
///
/// Compressed groups are expanded into their members, in reverse order when
/// reading backward. Member locators carry the member index.
pub struct RunReader<'p> {
    pool: &'p BufferPool,
    cursor: RunCursor<'p>,
    direction: ScanDirection,
    needed: Option<Arc<[usize]>>,
    groups: bool,
    pending: VecDeque<(RowLocator, Row)>,
}

impl fmt::Debug for RunReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunReader")
            .field("direction", &self.direction)
            .field("position", &self.cursor.position())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<'p> RunReader<'p> {
    fn new(
        pool: &'p BufferPool,
        run: &RunMeta,
        direction: ScanDirection,
        needed: Option<Arc<[usize]>>,
        groups: bool,
    ) -> Self {
        Self {
            pool,
            cursor: RunCursor::open(pool, run, direction),
            direction,
            needed,
            groups,
            pending: VecDeque::new(),
        }
    }

    /// Direction of the reader.
    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    /// Moves to the tuple at `locator`.
    pub fn seek(&mut self, locator: RowLocator) {
        self.pending.clear();
        self.cursor.seek(locator);
    }

    /// Stops the reader.
    pub fn exhaust(&mut self) {
        self.pending.clear();
        self.cursor.exhaust();
    }

    /// Returns true once nothing is left.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.cursor.is_done()
    }

    /// Returns the next row and its locator.
    pub fn next(&mut self) -> EngineResult<Option<(RowLocator, Row)>> {
        loop {
            if let Some(next) = self.pending.pop_front() {
                return Ok(Some(next));
            }
            let Some(tuple) = self.cursor.next()? else {
                return Ok(None);
            };
            if !tuple.is_compressed() {
                return Ok(Some((tuple.locator, Row::decode(&tuple.payload)?)));
            }
            if !self.groups {
                return Err(StorageError::corrupted(
                    tuple.locator.block,
                    "compressed group in a plain run",
                )
                .into());
            }
            self.expand(tuple)?;
        }
    }

    fn expand(&mut self, tuple: StoredTuple) -> EngineResult<()> {
        let group = CompressedGroup::decode(&tuple.payload)?;
        let mut decoded = DecodedGroup::new(group, self.pool);
        let needed = self.needed.as_deref();
        decoded.load(needed)?;
        let members = decoded.rows();
        for member in 0..members {
            let row = decoded.row(member, needed)?;
            let locator = tuple.locator.with_member(member as u16);
            match self.direction {
                ScanDirection::Forward => self.pending.push_back((locator, row)),
                ScanDirection::Backward => self.pending.push_front((locator, row)),
            }
        }
        Ok(())
    }
}

/// Reads the row at `locator`, expanding a group member when `groups` is set.
pub(crate) fn fetch_row(
    pool: &BufferPool,
    locator: RowLocator,
    groups: bool,
) -> EngineResult<Option<Row>> {
    let tuple_locator = RowLocator::new(locator.block, locator.slot);
    let Some(tuple) = fetch_tuple(pool, tuple_locator)? else {
        return Ok(None);
    };
    if tuple.is_end() {
        return Ok(None);
    }
    if !tuple.is_compressed() {
        if locator.member != 0 {
            return Ok(None);
        }
        return Ok(Some(Row::decode(&tuple.payload)?));
    }
    if !groups {
        return Err(StorageError::corrupted(locator.block, "compressed group in a plain run").into());
    }
    let group = CompressedGroup::decode(&tuple.payload)?;
    let mut decoded = DecodedGroup::new(group, pool);
    if usize::from(locator.member) >= decoded.rows() {
        return Ok(None);
    }
    Ok(Some(decoded.row(usize::from(locator.member), None)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use sortheap_common::types::{BlockId, TxnId};
    use sortheap_storage::alloc::BlockAllocator;
    use sortheap_storage::buffer::BufferPoolConfig;
    use sortheap_storage::row::{SortKey, SortKeyColumn, Value};
    use sortheap_storage::store::MemoryStore;
    use sortheap_storage::tape::{RunOrigin, Tape};
    use sortheap_wal::MemoryWal;

    use super::*;

    pub(crate) const TXN: TxnId = TxnId::new(1);

    pub(crate) fn setup() -> (BufferPool, BlockAllocator, BlockId) {
        let pool = BufferPool::new(
            BufferPoolConfig::new(256).with_page_size(4096),
            Arc::new(MemoryStore::new(4096)),
            Arc::new(MemoryWal::new()),
        )
        .unwrap();
        let alloc = BlockAllocator::new(4096);
        let mut mtr = pool.begin(TXN).unwrap();
        alloc.format(&mut mtr).unwrap();
        let header = Tape::create(&mut mtr, &alloc, 4, 16).unwrap();
        mtr.commit().unwrap();
        (pool, alloc, header)
    }

    pub(crate) fn comparator() -> RowComparator {
        RowComparator::new(SortKey::new(vec![SortKeyColumn::asc(0)]))
    }

    pub(crate) fn write(
        format: &dyn TupleFormat,
        tape: &Tape<'_>,
        cmp: &RowComparator,
        rows: Vec<Row>,
    ) -> RunMeta {
        let config = EngineConfig::for_testing();
        let columns = rows.first().map_or(0, Row::len);
        let writer = tape.begin_run(TXN).unwrap();
        let meta = RunMeta::new(RunOrigin::Dump, 0, TXN);
        let mut run = RunBuilder::new(writer, cmp, columns, &config, meta);
        let mut stream = rows.into_iter().map(|r| Ok(SortTuple::new(r, cmp)));
        format.write_run(&mut run, &mut stream).unwrap();
        let sealed = run.seal().unwrap();
        let mut mtr = tape.pool().begin(TXN).unwrap();
        let meta = sealed.commit(&mut mtr).unwrap();
        mtr.commit().unwrap();
        meta
    }

    pub(crate) fn read_all(
        format: &dyn TupleFormat,
        pool: &BufferPool,
        run: &RunMeta,
        direction: ScanDirection,
    ) -> Vec<(RowLocator, Row)> {
        let mut reader = format.open_reader(pool, run, direction, None);
        let mut out = Vec::new();
        while let Some(next) = reader.next().unwrap() {
            out.push(next);
        }
        out
    }

    pub(crate) fn row(key: i64, i: i64) -> Row {
        Row::new(vec![Value::Int(key), Value::Int(i), Value::Text(format!("v{}", i % 3))])
    }

    #[test]
    fn test_run_builder_writes_indexes() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let cmp = comparator();
        let rows: Vec<Row> = (0..600).map(|i| row(i, i)).collect();
        let meta = write(&PlainFormat, &tape, &cmp, rows.clone());

        assert_eq!(meta.rows, 600);
        assert!(meta.btree_root.is_valid());
        assert!(meta.range_anchor.is_valid());
        assert_eq!(meta.summary.len(), 3);
        assert!(!meta.is_compressed());

        let read: Vec<Row> = read_all(&PlainFormat, &pool, &meta, ScanDirection::Forward)
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        assert_eq!(read, rows);
    }

    #[test]
    fn test_empty_run_has_no_indexes() {
        let (pool, alloc, header) = setup();
        let tape = Tape::open(&pool, alloc, header);
        let meta = write(&PlainFormat, &tape, &comparator(), Vec::new());
        assert!(meta.is_empty());
        assert!(!meta.btree_root.is_valid());
        assert!(!meta.range_anchor.is_valid());
        assert!(read_all(&PlainFormat, &pool, &meta, ScanDirection::Backward).is_empty());
    }

    #[test]
    fn test_for_relation() {
        let cfg = CompressionConfig::enabled();
        assert!(for_relation(true, &cfg).is_compressed());
        assert_eq!(for_relation(false, &cfg).name(), "plain");
    }
}
