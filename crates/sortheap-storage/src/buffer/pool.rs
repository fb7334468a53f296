//! Buffer pool implementation.
//!
//! The buffer pool caches blocks of one relation, hands out latched guards,
//! tracks dirty pages and writes them back under the write-ahead rule: a
//! page is only written once the log covering its LSN is durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sortheap_common::types::{BlockId, BlockType, Lsn, TxnId};
use sortheap_wal::{LogSink, WalPayload};
use tracing::{debug, info, warn};

use super::config::BufferPoolConfig;
use super::frame::BufferFrame;
use super::guard::{BlockReadGuard, BlockWriteGuard};
use super::mtr::MiniTxn;
use super::BufferPoolStats;
use crate::error::{StorageError, StorageResult};
use crate::page::{expect_type, stamp_checksum, verify_page, PageHeader};
use crate::store::BlockStore;

/// The buffer pool of one relation.
///
/// It provides:
/// - Page caching with clock eviction of unpinned frames
/// - Latched read guards and mini-transactions for writes
/// - Dirty page tracking and WAL-ordered write-back
/// - Checkpoints that make the log before them unnecessary for recovery
pub struct BufferPool {
    config: BufferPoolConfig,
    store: Arc<dyn BlockStore>,
    wal: Arc<dyn LogSink>,
    /// Frame array; grows past `num_frames` only when every frame is pinned.
    frames: RwLock<Vec<Arc<BufferFrame>>>,
    /// Block table: maps BlockId -> frame index.
    table: RwLock<HashMap<BlockId, usize>>,
    clock_hand: AtomicUsize,
    /// Held shared by every mini-transaction, exclusively by a checkpoint.
    checkpoint_lock: RwLock<()>,
    poisoned: AtomicBool,
    fetch_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    eviction_count: AtomicU64,
    flush_count: AtomicU64,
}

impl BufferPool {
    /// Creates a pool over `store`, logging page changes to `wal`.
    pub fn new(
        config: BufferPoolConfig,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn LogSink>,
    ) -> StorageResult<Self> {
        config
            .validate()
            .map_err(StorageError::invalid_argument)?;
        if config.page_size != store.block_size() {
            return Err(StorageError::invalid_argument(format!(
                "pool page size {} does not match store block size {}",
                config.page_size,
                store.block_size()
            )));
        }

        Ok(Self {
            frames: RwLock::new(Vec::with_capacity(config.num_frames)),
            table: RwLock::new(HashMap::with_capacity(config.num_frames)),
            config,
            store,
            wal,
            clock_hand: AtomicUsize::new(0),
            checkpoint_lock: RwLock::new(()),
            poisoned: AtomicBool::new(false),
            fetch_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
        })
    }

    /// Size of every page.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.page_size
    }

    /// The log this pool writes to.
    pub fn wal(&self) -> &Arc<dyn LogSink> {
        &self.wal
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Returns true after a failed log append.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Starts a mini-transaction on behalf of `txn`.
    pub fn begin(&self, txn: TxnId) -> StorageResult<MiniTxn<'_>> {
        if self.is_poisoned() {
            return Err(StorageError::Poisoned);
        }
        Ok(MiniTxn::new(self, txn, self.checkpoint_lock.read_recursive()))
    }

    /// Fetches a block for reading.
    pub fn read(&self, block: BlockId) -> StorageResult<BlockReadGuard> {
        let frame = self.pin_frame(block)?;
        Ok(BlockReadGuard::new(frame, block))
    }

    /// Fetches a block for reading and checks its type.
    pub fn read_typed(&self, block: BlockId, expected: BlockType) -> StorageResult<BlockReadGuard> {
        let guard = self.read(block)?;
        expect_type(&guard, block, expected)?;
        Ok(guard)
    }

    pub(crate) fn write(&self, block: BlockId) -> StorageResult<BlockWriteGuard> {
        if self.is_poisoned() {
            return Err(StorageError::Poisoned);
        }
        let frame = self.pin_frame(block)?;
        Ok(BlockWriteGuard::new(frame, block))
    }

    /// Pins the frame holding `block`, loading it on a miss.
    fn pin_frame(&self, block: BlockId) -> StorageResult<Arc<BufferFrame>> {
        if !block.is_valid() {
            return Err(StorageError::BlockNotFound { block });
        }
        self.fetch_count.fetch_add(1, Ordering::Relaxed);

        // Pinning under the table lock keeps eviction, which needs the table
        // write lock, from taking the frame in between.
        {
            let table = self.table.read();
            if let Some(&index) = table.get(&block) {
                let frame = Arc::clone(&self.frames.read()[index]);
                frame.pin();
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
        }

        let mut table = self.table.write();
        if let Some(&index) = table.get(&block) {
            let frame = Arc::clone(&self.frames.read()[index]);
            frame.pin();
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let index = self.claim_frame(&mut table)?;
        let frame = Arc::clone(&self.frames.read()[index]);
        {
            let mut data = frame.data().write();
            self.store.read_block(block, &mut data)?;
            verify_page(&data, block)?;
        }
        frame.set_block(block);
        frame.set_dirty(false);
        frame.pin();
        table.insert(block, index);
        Ok(frame)
    }

    /// Finds an empty frame or evicts one. Called with the table write lock.
    fn claim_frame(&self, table: &mut HashMap<BlockId, usize>) -> StorageResult<usize> {
        {
            let mut frames = self.frames.write();
            if frames.len() < self.config.num_frames {
                frames.push(Arc::new(BufferFrame::new(self.config.page_size)));
                return Ok(frames.len() - 1);
            }
        }

        {
            let frames = self.frames.read();
            let n = frames.len();
            for _ in 0..2 * n {
                let pos = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
                let frame = &frames[pos];
                if frame.is_pinned() {
                    continue;
                }
                if frame.is_empty() {
                    return Ok(pos);
                }
                if frame.take_ref_bit() {
                    continue;
                }

                if frame.is_dirty() {
                    self.write_back(frame)?;
                }
                table.remove(&frame.block());
                frame.reset();
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
                return Ok(pos);
            }
        }

        // Every frame is pinned: grow instead of failing.
        let mut frames = self.frames.write();
        warn!(frames = frames.len(), "all buffer frames pinned, growing pool");
        frames.push(Arc::new(BufferFrame::new(self.config.page_size)));
        Ok(frames.len() - 1)
    }

    /// Writes a frame's page to the store, flushing the log first if the
    /// page reflects records that are not yet durable.
    fn write_back(&self, frame: &BufferFrame) -> StorageResult<()> {
        let block = frame.block();
        let mut page = frame.data().read().clone();
        let lsn = PageHeader::new(&page[..]).lsn();
        if lsn > self.wal.durable_lsn() {
            self.wal.flush()?;
        }
        stamp_checksum(&mut page);
        self.store.write_block(block, &page)?;
        frame.set_dirty(false);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes every dirty page back to the store.
    pub fn flush_all(&self) -> StorageResult<usize> {
        let frames: Vec<Arc<BufferFrame>> = self.frames.read().clone();
        let mut written = 0;
        for frame in frames.iter().filter(|f| !f.is_empty() && f.is_dirty()) {
            self.write_back(frame)?;
            written += 1;
        }
        self.store.sync()?;
        Ok(written)
    }

    /// Flushes every dirty page and logs a checkpoint record.
    ///
    /// Waits for in-flight mini-transactions and blocks new ones until the
    /// checkpoint is durable. Must not be called while holding a
    /// mini-transaction.
    pub fn checkpoint(&self, next_xid: TxnId) -> StorageResult<Lsn> {
        if self.is_poisoned() {
            return Err(StorageError::Poisoned);
        }
        let _exclusive = self.checkpoint_lock.write();
        let redo_lsn = self.wal.next_lsn();
        let written = self.flush_all()?;
        let lsn = self
            .wal
            .append(TxnId::INVALID, &WalPayload::Checkpoint { redo_lsn, next_xid })?;
        self.wal.flush()?;
        info!(%redo_lsn, %lsn, pages = written, "checkpoint complete");
        Ok(lsn)
    }

    /// Drops every clean, unpinned frame. Used by tests to force reloads.
    pub fn evict_clean(&self) -> usize {
        let mut table = self.table.write();
        let frames = self.frames.read();
        let mut dropped = 0;
        for frame in frames.iter() {
            if !frame.is_empty() && !frame.is_pinned() && !frame.is_dirty() {
                table.remove(&frame.block());
                frame.reset();
                dropped += 1;
            }
        }
        debug!(dropped, "evicted clean frames");
        dropped
    }

    /// Returns buffer pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let frames = self.frames.read();
        BufferPoolStats {
            fetches: self.fetch_count.load(Ordering::Relaxed),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            flushes: self.flush_count.load(Ordering::Relaxed),
            frames: frames.len(),
            pinned_frames: frames.iter().filter(|f| f.is_pinned()).count(),
            dirty_frames: frames.iter().filter(|f| f.is_dirty()).count(),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("page_size", &self.config.page_size)
            .field("num_frames", &self.config.num_frames)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sortheap_wal::{MemoryWal, PageOp};

    use crate::page::read_body;
    use crate::store::MemoryStore;

    fn pool_over(store: &MemoryStore, wal: &Arc<MemoryWal>) -> BufferPool {
        BufferPool::new(
            BufferPoolConfig::for_testing(),
            Arc::new(store.clone()),
            Arc::clone(wal) as Arc<dyn LogSink>,
        )
        .unwrap()
    }

    fn write_state(pool: &BufferPool, block: BlockId, body: &'static [u8]) {
        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        mtr.apply(PageOp::Init {
            block,
            block_type: BlockType::TapeSet,
        })
        .unwrap();
        mtr.apply(PageOp::BodyWrite {
            block,
            block_type: BlockType::TapeSet,
            body: Bytes::from_static(body),
        })
        .unwrap();
        mtr.commit().unwrap();
    }

    #[test]
    fn test_eviction_writes_back() {
        let store = MemoryStore::new(4096);
        let wal = Arc::new(MemoryWal::new());
        let pool = pool_over(&store, &wal);

        for i in 0..40u64 {
            write_state(&pool, BlockId::new(10 + i), b"state");
        }
        let stats = pool.stats();
        assert!(stats.evictions > 0);
        assert!(stats.frames <= BufferPoolConfig::for_testing().num_frames);

        let guard = pool.read(BlockId::new(10)).unwrap();
        assert_eq!(read_body(&guard).unwrap(), b"state");
        assert_eq!(PageHeader::new(&guard[..]).lsn(), Lsn::new(1));
    }

    #[test]
    fn test_checkpoint_flushes_everything() {
        let store = MemoryStore::new(4096);
        let wal = Arc::new(MemoryWal::new());
        let pool = pool_over(&store, &wal);
        write_state(&pool, BlockId::new(3), b"abc");
        assert_eq!(pool.stats().dirty_frames, 1);

        pool.checkpoint(TxnId::new(2)).unwrap();
        assert_eq!(pool.stats().dirty_frames, 0);

        let mut page = vec![0u8; 4096];
        store.read_block(BlockId::new(3), &mut page).unwrap();
        assert_eq!(read_body(&page).unwrap(), b"abc");
        assert!(verify_page(&page, BlockId::new(3)).is_ok());
    }

    #[test]
    fn test_pinned_frames_grow_pool() {
        let store = MemoryStore::new(4096);
        let wal = Arc::new(MemoryWal::new());
        let pool = pool_over(&store, &wal);
        let n = BufferPoolConfig::for_testing().num_frames as u64;

        let guards: Vec<BlockReadGuard> = (0..n + 4)
            .map(|i| pool.read(BlockId::new(100 + i)).unwrap())
            .collect();
        assert_eq!(pool.stats().frames as u64, n + 4);
        assert_eq!(pool.stats().pinned_frames as u64, n + 4);
        drop(guards);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_corrupt_page_is_fatal_on_load() {
        let store = MemoryStore::new(4096);
        let wal = Arc::new(MemoryWal::new());
        {
            let pool = pool_over(&store, &wal);
            write_state(&pool, BlockId::new(3), b"abc");
            pool.flush_all().unwrap();
        }
        let mut page = vec![0u8; 4096];
        store.read_block(BlockId::new(3), &mut page).unwrap();
        page[3000] ^= 0x55;
        store.write_block(BlockId::new(3), &page).unwrap();

        let pool = pool_over(&store, &wal);
        let err = pool.read(BlockId::new(3)).unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }
}
