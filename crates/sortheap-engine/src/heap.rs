//! The SortHeap engine façade.
//!
//! A [`SortHeap`] owns one relation: its buffer pool over a block store and
//! log, the block allocator, the TapeSets and the tuple format picked when
//! the relation was created. Inserts are buffered per transaction in an
//! [`InsertBuffer`] and dumped as sorted runs; merges and vacuums run on
//! demand or in the background worker.
//!
//! Mini-transactions latch pages in one global order: metadata block,
//! TapeSet block, tape header, other tape pages, allocator pages. A page a
//! thread holds in a mini-transaction is never read through the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sortheap_common::config::EngineConfig;
use sortheap_common::types::{BlockId, BlockType, Lsn, RelationId, RowLocator, TxnId};
use sortheap_storage::alloc::BlockAllocator;
use sortheap_storage::buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, RecoveryStats};
use sortheap_storage::row::{Row, RowComparator, Schema};
use sortheap_storage::store::BlockStore;
use sortheap_storage::tape::Tape;
use sortheap_txn::{TapeSetLock, Transaction, TransactionService, TxnManager};
use sortheap_wal::LogSink;
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticReport;
use crate::dump::InsertBuffer;
use crate::error::{EngineError, EngineResult};
use crate::format::{self, TupleFormat};
use crate::meta::{MetaData, META_BLOCK};
use crate::scan::{Scan, ScanOptions};
use crate::tapeset::TapeSetState;
use crate::worker::{self, MaintenanceSignal, TaskHandle, TaskLauncher, ThreadLauncher, WorkerGuard};
use crate::{recovery, session};

/// In-memory handle of one TapeSet.
pub(crate) struct TapeSetHandle {
    pub(crate) index: usize,
    block: AtomicU64,
    pub(crate) lock: TapeSetLock,
    /// Serializes dumps into the TapeSet.
    pub(crate) dump: Mutex<()>,
    /// Serializes vacuums of the TapeSet.
    pub(crate) vacuum: Mutex<()>,
}

impl TapeSetHandle {
    fn new(index: usize, block: BlockId) -> Self {
        Self {
            index,
            block: AtomicU64::new(block.as_u64()),
            lock: TapeSetLock::new(),
            dump: Mutex::new(()),
            vacuum: Mutex::new(()),
        }
    }

    /// TapeSet block; `INVALID` until the first dump creates it.
    pub(crate) fn block(&self) -> BlockId {
        BlockId::new(self.block.load(Ordering::Acquire))
    }

    fn set_block(&self, block: BlockId) {
        self.block.store(block.as_u64(), Ordering::Release);
    }
}

/// State shared by the façade, scans and background tasks.
pub(crate) struct HeapCore {
    pub(crate) config: EngineConfig,
    pub(crate) relation: RelationId,
    pub(crate) schema: Schema,
    pub(crate) comparator: RowComparator,
    pub(crate) format: Arc<dyn TupleFormat>,
    pub(crate) pool: BufferPool,
    pub(crate) alloc: BlockAllocator,
    pub(crate) txns: Arc<dyn TransactionService>,
    pub(crate) tapesets: Vec<TapeSetHandle>,
    pub(crate) tapes_per_set: usize,
    /// TapeSet inserts try first.
    pub(crate) preferred: AtomicUsize,
    /// Set while any TapeSet of the relation is being merged.
    pub(crate) merge_in_progress: AtomicBool,
    pub(crate) signal: Arc<MaintenanceSignal>,
}

impl fmt::Debug for HeapCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapCore")
            .field("relation", &self.relation)
            .field("format", &self.format.name())
            .field("tapesets", &self.tapesets.len())
            .field("tapes_per_set", &self.tapes_per_set)
            .finish()
    }
}

impl HeapCore {
    pub(crate) fn tape(&self, header: BlockId) -> Tape<'_> {
        Tape::open(&self.pool, self.alloc, header)
    }

    /// Current state of TapeSet `index`, `None` before it exists.
    pub(crate) fn tapeset_state(&self, index: usize) -> EngineResult<Option<TapeSetState>> {
        let block = self.tapesets[index].block();
        if !block.is_valid() {
            return Ok(None);
        }
        Ok(Some(TapeSetState::load(&self.pool, block)?))
    }

    /// Returns the block of `handle`, creating the TapeSet on first use.
    pub(crate) fn ensure_tapeset(&self, handle: &TapeSetHandle) -> EngineResult<BlockId> {
        let block = handle.block();
        if block.is_valid() {
            return Ok(block);
        }
        let mut mtr = self.pool.begin(TxnId::INVALID)?;
        let mut meta = MetaData::load_in(&mut mtr)?;
        let existing = meta.tapesets.get(handle.index).copied().ok_or_else(|| {
            EngineError::invalid_state(format!("metadata has no TapeSet slot {}", handle.index))
        })?;
        if existing.is_valid() {
            mtr.commit()?;
            handle.set_block(existing);
            return Ok(existing);
        }
        let block = self.alloc.allocate(&mut mtr)?;
        mtr.init(block, BlockType::TapeSet)?;
        TapeSetState::new(self.tapes_per_set).store_in(&mut mtr, block)?;
        meta.tapesets[handle.index] = block;
        meta.store_in(&mut mtr)?;
        mtr.commit()?;
        handle.set_block(block);
        info!(relation = %self.relation, tapeset = handle.index, %block, "created TapeSet");
        Ok(block)
    }

    /// One round of background work: merge what is worthwhile, then vacuum.
    /// Returns true if work remains.
    pub(crate) fn maintain(&self) -> EngineResult<bool> {
        let merge_more = self.merge_once(false, None)?;
        let vacuum_more = self.vacuum_once()?;
        Ok(merge_more || vacuum_more)
    }
}

/// A relation stored as sorted runs on TapeSets.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use sortheap_common::config::EngineConfig;
/// use sortheap_common::types::RelationId;
/// use sortheap_engine::{ScanOptions, SortHeap};
/// use sortheap_storage::row::{Column, ColumnType, Row, Schema, SortKey, SortKeyColumn, Value};
/// use sortheap_storage::store::MemoryStore;
/// use sortheap_wal::MemoryWal;
///
/// let schema = Schema::new(
///     vec![Column::new("ts", ColumnType::Int), Column::new("v", ColumnType::Int)],
///     SortKey::new(vec![SortKeyColumn::asc(0)]),
/// )
/// .unwrap();
/// let config = EngineConfig::for_testing();
/// let heap = SortHeap::create(
///     config.clone(),
///     RelationId::new(1),
///     schema,
///     Arc::new(MemoryStore::new(config.block_size)),
///     Arc::new(MemoryWal::new()),
/// )
/// .unwrap();
///
/// heap.load((0..100).rev().map(|i| Row::new(vec![Value::Int(i), Value::Int(i * 2)])))
///     .unwrap();
/// let keys: Vec<i64> = heap
///     .scan(ScanOptions::new())
///     .unwrap()
///     .map(|row| row.unwrap().get(0).and_then(Value::as_int).unwrap())
///     .collect();
/// assert_eq!(keys, (0..100).collect::<Vec<_>>());
/// ```
pub struct SortHeap {
    core: Arc<HeapCore>,
    worker: Mutex<Option<WorkerGuard>>,
    recovery: Option<RecoveryStats>,
}

impl fmt::Debug for SortHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortHeap")
            .field("core", &self.core)
            .field("worker", &self.worker.lock().is_some())
            .finish()
    }
}

impl SortHeap {
    /// Creates a relation on an empty store, logging to `wal`.
    pub fn create(
        config: EngineConfig,
        relation: RelationId,
        schema: Schema,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn LogSink>,
    ) -> EngineResult<Self> {
        let txns: Arc<dyn TransactionService> = Arc::new(TxnManager::with_log(Arc::clone(&wal)));
        Self::create_with(config, relation, schema, store, wal, txns)
    }

    /// Creates a relation that uses an external transaction service.
    pub fn create_with(
        config: EngineConfig,
        relation: RelationId,
        schema: Schema,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn LogSink>,
        txns: Arc<dyn TransactionService>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::invalid_argument)?;
        if store.block_size() != config.block_size {
            return Err(EngineError::invalid_argument(format!(
                "store block size {} does not match configured {}",
                store.block_size(),
                config.block_size
            )));
        }
        if store.num_blocks() != 0 {
            return Err(EngineError::invalid_argument(format!(
                "store already holds {} blocks",
                store.num_blocks()
            )));
        }

        let pool = new_pool(&config, store, wal)?;
        let alloc = BlockAllocator::new(config.block_size);
        let meta = MetaData::new(
            relation,
            schema,
            config.compression.enabled,
            config.tapes_per_set,
            config.tapesets,
        );
        let mut mtr = pool.begin(TxnId::INVALID)?;
        mtr.init(META_BLOCK, BlockType::Meta)?;
        alloc.format(&mut mtr)?;
        meta.store_in(&mut mtr)?;
        mtr.commit()?;
        info!(
            %relation,
            tapesets = config.tapesets,
            tapes_per_set = config.tapes_per_set,
            compressed = meta.compressed,
            "created relation"
        );
        Self::assemble(config, meta, pool, alloc, txns, None)
    }

    /// Opens an existing relation, replaying the log first. Transaction
    /// outcomes are rebuilt from the log.
    pub fn open(
        config: EngineConfig,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn LogSink>,
    ) -> EngineResult<Self> {
        let txns: Arc<dyn TransactionService> =
            Arc::new(recovery::recover_transactions(Arc::clone(&wal))?);
        Self::open_with(config, store, wal, txns)
    }

    /// Opens an existing relation with an already recovered transaction
    /// service.
    pub fn open_with(
        mut config: EngineConfig,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn LogSink>,
        txns: Arc<dyn TransactionService>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::invalid_argument)?;
        let stats = recovery::recover_pages(store.as_ref(), wal.as_ref())?;
        let pool = new_pool(&config, store, wal)?;
        let alloc = BlockAllocator::new(config.block_size);
        let meta = MetaData::load(&pool)?;

        if meta.tapes_per_set != config.tapes_per_set || meta.tapesets.len() != config.tapesets {
            warn!(
                relation = %meta.relation,
                tapes_per_set = meta.tapes_per_set,
                tapesets = meta.tapesets.len(),
                "stored TapeSet layout overrides configuration"
            );
        }
        config.tapes_per_set = meta.tapes_per_set;
        config.tapesets = meta.tapesets.len();
        config.compression.enabled = meta.compressed;
        info!(
            relation = %meta.relation,
            redo_lsn = %stats.redo_lsn,
            applied = stats.records_applied,
            "opened relation"
        );
        Self::assemble(config, meta, pool, alloc, txns, Some(stats))
    }

    fn assemble(
        config: EngineConfig,
        meta: MetaData,
        pool: BufferPool,
        alloc: BlockAllocator,
        txns: Arc<dyn TransactionService>,
        recovery: Option<RecoveryStats>,
    ) -> EngineResult<Self> {
        let comparator = RowComparator::new(meta.schema.sort_key().clone());
        let format = format::for_relation(meta.compressed, &config.compression);
        let tapesets = meta
            .tapesets
            .iter()
            .enumerate()
            .map(|(index, block)| TapeSetHandle::new(index, *block))
            .collect();
        let background = config.background_maintenance;
        let core = Arc::new(HeapCore {
            relation: meta.relation,
            schema: meta.schema,
            comparator,
            format,
            pool,
            alloc,
            txns,
            tapesets,
            tapes_per_set: meta.tapes_per_set,
            preferred: AtomicUsize::new(0),
            merge_in_progress: AtomicBool::new(false),
            signal: Arc::new(MaintenanceSignal::new()),
            config,
        });
        let heap = Self {
            core,
            worker: Mutex::new(None),
            recovery,
        };
        if background {
            heap.start_maintenance(&ThreadLauncher)?;
        }
        Ok(heap)
    }

    pub(crate) fn core(&self) -> &Arc<HeapCore> {
        &self.core
    }

    /// Relation identifier.
    pub fn relation(&self) -> RelationId {
        self.core.relation
    }

    /// Row schema and sort key.
    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Transaction service the relation uses.
    pub fn txns(&self) -> &Arc<dyn TransactionService> {
        &self.core.txns
    }

    /// Name of the tuple format.
    pub fn format_name(&self) -> &'static str {
        self.core.format.name()
    }

    /// Statistics of the last recovery, if the relation was opened.
    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery.as_ref()
    }

    /// Buffer pool statistics.
    pub fn pool_stats(&self) -> BufferPoolStats {
        self.core.pool.stats()
    }

    /// Starts the background maintenance worker unless one is running.
    pub fn start_maintenance(&self, launcher: &dyn TaskLauncher) -> EngineResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(worker::spawn_maintenance(Arc::clone(&self.core), launcher)?);
        }
        Ok(())
    }

    /// Stops the background maintenance worker and waits for it.
    pub fn stop_maintenance(&self) -> EngineResult<()> {
        match self.worker.lock().take() {
            Some(guard) => guard.stop(),
            None => Ok(()),
        }
    }

    /// Starts an insert buffer for `txn`.
    pub fn begin_insert(&self, txn: &Transaction) -> InsertBuffer {
        InsertBuffer::new(txn.xid)
    }

    /// Buffers `row`, dumping the buffer as a run once it is full.
    pub fn insert(&self, buffer: &mut InsertBuffer, row: Row) -> EngineResult<()> {
        self.core.insert(buffer, row)
    }

    /// Dumps whatever `buffer` still holds.
    pub fn finish_insert(&self, buffer: &mut InsertBuffer) -> EngineResult<()> {
        self.core.flush(buffer)
    }

    /// Inserts `rows` in a transaction of their own. Returns the row count.
    pub fn load(&self, rows: impl IntoIterator<Item = Row>) -> EngineResult<u64> {
        let txn = self.core.txns.begin()?;
        let mut buffer = InsertBuffer::new(txn.xid);
        let loaded = rows
            .into_iter()
            .try_for_each(|row| self.core.insert(&mut buffer, row))
            .and_then(|()| self.core.flush(&mut buffer));
        match loaded {
            Ok(()) => {
                self.core.txns.commit(txn.xid)?;
                debug!(relation = %self.core.relation, xid = %txn.xid, rows = buffer.inserted(), "load committed");
                Ok(buffer.inserted())
            }
            Err(err) => {
                if let Err(abort) = self.core.txns.abort(txn.xid) {
                    warn!(xid = %txn.xid, error = %abort, "abort after failed load");
                }
                Err(err)
            }
        }
    }

    /// Opens a scan in a read-only transaction of its own, committed when
    /// the scan is dropped.
    pub fn scan(&self, options: ScanOptions) -> EngineResult<Scan<'_>> {
        let txn = self.core.txns.begin()?;
        match Scan::open(&self.core, txn.snapshot.clone(), Some(txn.xid), options) {
            Ok(scan) => Ok(scan),
            Err(err) => {
                if let Err(abort) = self.core.txns.abort(txn.xid) {
                    warn!(xid = %txn.xid, error = %abort, "abort after failed scan open");
                }
                Err(err)
            }
        }
    }

    /// Opens a scan reading with the snapshot of `txn`.
    pub fn scan_in(&self, txn: &Transaction, options: ScanOptions) -> EngineResult<Scan<'_>> {
        Scan::open(&self.core, txn.snapshot.clone(), None, options)
    }

    /// Reads the row at `locator`, `None` if nothing lives there.
    pub fn fetch_by_locator(&self, locator: RowLocator) -> EngineResult<Option<Row>> {
        self.core.format.fetch(&self.core.pool, locator)
    }

    /// Merges one TapeSet that needs it; `force` merges TapeSets below the
    /// trigger level too. Returns true if more merge work remains.
    pub fn merge_once(&self, force: bool) -> EngineResult<bool> {
        self.core.merge_once(force, None)
    }

    /// Like [`merge_once`](Self::merge_once) but stops after `steps` merge
    /// steps; the next call resumes where this one stopped.
    pub fn merge_steps(&self, force: bool, steps: usize) -> EngineResult<bool> {
        self.core.merge_once(force, Some(steps))
    }

    /// Runs `merge_once(force)` on a task started by `launcher`.
    pub fn spawn_merge(&self, launcher: &dyn TaskLauncher, force: bool) -> EngineResult<TaskHandle> {
        let core = Arc::clone(&self.core);
        launcher.launch(
            self.core.relation,
            "merge",
            Box::new(move || core.merge_once(force, None).map(|_| ())),
        )
    }

    /// Reclaims the old tapes of merged TapeSets. Returns true if a TapeSet
    /// still waits for vacuum.
    pub fn vacuum_once(&self) -> EngineResult<bool> {
        self.core.vacuum_once()
    }

    /// Per-TapeSet status report.
    pub fn describe(&self) -> EngineResult<DiagnosticReport> {
        self.core.describe()
    }

    /// Flushes every dirty page and logs a checkpoint.
    pub fn checkpoint(&self) -> EngineResult<Lsn> {
        let next_xid = self.core.txns.snapshot().xmax;
        Ok(self.core.pool.checkpoint(next_xid)?)
    }

    /// Blocks currently allocated to the relation.
    pub fn allocated_blocks(&self) -> EngineResult<u64> {
        Ok(self.core.alloc.allocated_count(&self.core.pool)?)
    }

    /// Rows are never updated in place.
    pub fn update(&self, _locator: RowLocator, _row: Row) -> EngineResult<()> {
        Err(EngineError::NotSupported { operation: "update" })
    }

    /// Rows are never deleted individually.
    pub fn delete(&self, _locator: RowLocator) -> EngineResult<()> {
        Err(EngineError::NotSupported { operation: "delete" })
    }

    /// Only the sort key is indexed.
    pub fn create_index(&self, _columns: &[usize]) -> EngineResult<()> {
        Err(EngineError::NotSupported {
            operation: "create_index",
        })
    }

    /// Scans run on one thread.
    pub fn parallel_scan(&self, _options: ScanOptions, _workers: usize) -> EngineResult<Scan<'_>> {
        Err(EngineError::NotSupported {
            operation: "parallel_scan",
        })
    }

    /// Opens a session bound to this relation's transaction service.
    pub fn session(&self) -> session::Session {
        session::Session::new(Arc::clone(&self.core.txns))
    }
}

fn new_pool(
    config: &EngineConfig,
    store: Arc<dyn BlockStore>,
    wal: Arc<dyn LogSink>,
) -> EngineResult<BufferPool> {
    let pool_config = BufferPoolConfig::new(config.buffer_frames).with_page_size(config.block_size);
    Ok(BufferPool::new(pool_config, store, wal)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use sortheap_storage::row::{Column, ColumnType, SortKey, SortKeyColumn, Value};
    use sortheap_storage::store::MemoryStore;
    use sortheap_wal::MemoryWal;

    use super::*;
    use crate::tapeset::TapeSetStatus;

    pub(crate) fn schema() -> Schema {
        Schema::new(
            vec![
                Column::new("key", ColumnType::Int),
                Column::new("seq", ColumnType::Int),
                Column::new("label", ColumnType::Text),
            ],
            SortKey::new(vec![SortKeyColumn::asc(0)]),
        )
        .unwrap()
    }

    pub(crate) fn row(key: i64, seq: i64) -> Row {
        Row::new(vec![
            Value::Int(key),
            Value::Int(seq),
            Value::Text(format!("label-{}", seq % 7)),
        ])
    }

    pub(crate) fn heap_with(config: EngineConfig) -> SortHeap {
        SortHeap::create(
            config.clone(),
            RelationId::new(9),
            schema(),
            Arc::new(MemoryStore::new(config.block_size)),
            Arc::new(MemoryWal::new()),
        )
        .unwrap()
    }

    pub(crate) fn heap() -> SortHeap {
        heap_with(EngineConfig::for_testing().with_sort_buffer_rows(64))
    }

    pub(crate) fn keys(heap: &SortHeap) -> Vec<i64> {
        heap.scan(ScanOptions::new())
            .unwrap()
            .map(|r| r.unwrap().get(0).and_then(Value::as_int).unwrap())
            .collect()
    }

    #[test]
    fn test_create_rejects_bad_store() {
        let config = EngineConfig::for_testing();
        let err = SortHeap::create(
            config.clone(),
            RelationId::new(1),
            schema(),
            Arc::new(MemoryStore::new(8192)),
            Arc::new(MemoryWal::new()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));

        let err = SortHeap::create(
            config.clone().with_tapes_per_set(2),
            RelationId::new(1),
            schema(),
            Arc::new(MemoryStore::new(config.block_size)),
            Arc::new(MemoryWal::new()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_tapesets_created_lazily() {
        let heap = heap();
        let before = heap.allocated_blocks().unwrap();
        assert!(heap.core.tapeset_state(0).unwrap().is_none());

        heap.load((0..10).map(|i| row(i, i))).unwrap();
        let state = heap.core.tapeset_state(0).unwrap().unwrap();
        assert_eq!(state.status, TapeSetStatus::BuildingRuns);
        assert_eq!(state.dumps, 1);
        assert!(heap.core.tapeset_state(1).unwrap().is_none());
        assert!(heap.allocated_blocks().unwrap() > before);
    }

    #[test]
    fn test_unsupported_operations() {
        let heap = heap();
        let loc = RowLocator::new(BlockId::new(5), 0);
        for err in [
            heap.update(loc, row(1, 1)).unwrap_err(),
            heap.delete(loc).unwrap_err(),
            heap.create_index(&[1]).unwrap_err(),
            heap.parallel_scan(ScanOptions::new(), 4).unwrap_err(),
        ] {
            assert!(matches!(err, EngineError::NotSupported { .. }));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_failed_load_aborts() {
        let heap = heap();
        let bad = Row::new(vec![Value::Text("not an int".into())]);
        assert!(heap.load(vec![row(1, 1), bad]).is_err());
        assert!(keys(&heap).is_empty());
        heap.load(vec![row(2, 2)]).unwrap();
        assert_eq!(keys(&heap), vec![2]);
    }
}
