//! Mini-transactions: atomic, logged groups of page ops.
//!
//! A [`MiniTxn`] latches every page it touches exclusively, applies each op
//! immediately through [`redo::apply`](super::redo::apply), and on commit
//! logs the whole group as one `PageOps` record and stamps its LSN on every
//! modified page. Dropping it without committing restores the before-image
//! of every modified page, so a failed operation leaves no trace.
//!
//! Pages are latched in the order they are first touched. Callers follow
//! one global order (TapeSet page, tape header, tape pages, allocator root,
//! allocator leaf) so that two mini-transactions never wait on each other
//! in a cycle. Latches are not reentrant: a page a mini-transaction may
//! hold must be accessed through it, never through a separate guard.

use parking_lot::RwLockReadGuard;
use sortheap_common::types::{BlockId, BlockType, Lsn, TxnId};
use sortheap_wal::{PageOp, WalPayload};
use tracing::{error, trace};

use super::guard::BlockWriteGuard;
use super::pool::BufferPool;
use super::redo;
use crate::error::StorageResult;
use crate::page::{expect_type, PageHeader};

struct Held {
    guard: BlockWriteGuard,
    before: Option<Vec<u8>>,
}

/// An atomic group of page changes.
pub struct MiniTxn<'p> {
    pool: &'p BufferPool,
    txn: TxnId,
    held: Vec<Held>,
    ops: Vec<PageOp>,
    done: bool,
    _checkpoint: RwLockReadGuard<'p, ()>,
}

impl<'p> MiniTxn<'p> {
    pub(crate) fn new(pool: &'p BufferPool, txn: TxnId, checkpoint: RwLockReadGuard<'p, ()>) -> Self {
        Self {
            pool,
            txn,
            held: Vec::new(),
            ops: Vec::new(),
            done: false,
            _checkpoint: checkpoint,
        }
    }

    /// Transaction the logged record is attributed to.
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// The pool this mini-transaction writes through.
    pub fn pool(&self) -> &'p BufferPool {
        self.pool
    }

    /// Number of ops applied so far.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if `block` is latched by this mini-transaction.
    pub fn holds(&self, block: BlockId) -> bool {
        self.held.iter().any(|h| h.guard.block() == block)
    }

    fn index_of(&mut self, block: BlockId) -> StorageResult<usize> {
        if let Some(index) = self.held.iter().position(|h| h.guard.block() == block) {
            return Ok(index);
        }
        let guard = self.pool.write(block)?;
        self.held.push(Held {
            guard,
            before: None,
        });
        Ok(self.held.len() - 1)
    }

    /// Latches `block` and returns its current contents.
    pub fn page(&mut self, block: BlockId) -> StorageResult<&[u8]> {
        let index = self.index_of(block)?;
        Ok(&self.held[index].guard)
    }

    /// Latches `block`, checks its type and returns its contents.
    pub fn page_typed(&mut self, block: BlockId, expected: BlockType) -> StorageResult<&[u8]> {
        let index = self.index_of(block)?;
        let page: &[u8] = &self.held[index].guard;
        expect_type(page, block, expected)?;
        Ok(page)
    }

    /// Applies an op to its page and records it for the log.
    pub fn apply(&mut self, op: PageOp) -> StorageResult<()> {
        let index = self.index_of(op.block())?;
        let held = &mut self.held[index];
        if held.before.is_none() {
            held.before = Some(held.guard.to_vec());
        }
        redo::apply(&op, &mut held.guard)?;
        trace!(op = op.name(), block = %op.block(), "applied page op");
        self.ops.push(op);
        Ok(())
    }

    /// Formats `block` as an empty page of `block_type`.
    pub fn init(&mut self, block: BlockId, block_type: BlockType) -> StorageResult<()> {
        self.apply(PageOp::Init { block, block_type })
    }

    /// Logs the group and stamps the LSN on every modified page.
    ///
    /// Returns `Lsn::INVALID` when nothing was changed. A failed append
    /// poisons the pool and rolls the pages back.
    pub fn commit(mut self) -> StorageResult<Lsn> {
        if self.ops.is_empty() {
            self.done = true;
            return Ok(Lsn::INVALID);
        }

        let ops = std::mem::take(&mut self.ops);
        let count = ops.len();
        let lsn = match self.pool.wal().append(self.txn, &WalPayload::PageOps(ops)) {
            Ok(lsn) => lsn,
            Err(err) => {
                error!(txn = %self.txn, error = %err, "log append failed, poisoning buffer pool");
                self.pool.poison();
                return Err(err.into());
            }
        };

        for held in self.held.iter_mut().filter(|h| h.before.is_some()) {
            PageHeader::new(&mut held.guard[..]).set_lsn(lsn);
            held.guard.mark_dirty();
        }
        self.done = true;
        trace!(txn = %self.txn, %lsn, ops = count, "committed mini-transaction");
        Ok(lsn)
    }
}

impl Drop for MiniTxn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for held in self.held.iter_mut() {
            if let Some(before) = held.before.take() {
                held.guard.copy_from_slice(&before);
            }
        }
    }
}

impl std::fmt::Debug for MiniTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniTxn")
            .field("txn", &self.txn)
            .field("pages", &self.held.len())
            .field("ops", &self.ops.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use sortheap_wal::{LogSink, MemoryWal, WalError, WalRecord, WalResult};

    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::page::SlottedPage;
    use crate::store::MemoryStore;

    #[derive(Debug)]
    struct FailingWal;

    impl LogSink for FailingWal {
        fn append(&self, _txn: TxnId, _payload: &WalPayload) -> WalResult<Lsn> {
            Err(WalError::append_failed("injected"))
        }
        fn flush(&self) -> WalResult<()> {
            Ok(())
        }
        fn next_lsn(&self) -> Lsn {
            Lsn::FIRST
        }
        fn durable_lsn(&self) -> Lsn {
            Lsn::INVALID
        }
        fn records_from(&self, _lsn: Lsn) -> WalResult<Vec<WalRecord>> {
            Ok(Vec::new())
        }
    }

    fn pool(wal: Arc<dyn LogSink>) -> BufferPool {
        BufferPool::new(
            BufferPoolConfig::for_testing(),
            Arc::new(MemoryStore::new(4096)),
            wal,
        )
        .unwrap()
    }

    #[test]
    fn test_commit_logs_one_record() {
        let wal = Arc::new(MemoryWal::new());
        let pool = pool(wal.clone());
        let block = BlockId::new(7);

        let mut mtr = pool.begin(TxnId::new(3)).unwrap();
        mtr.init(block, BlockType::Data).unwrap();
        mtr.apply(PageOp::SlotAppend {
            block,
            data: Bytes::from_static(b"row"),
        })
        .unwrap();
        assert_eq!(mtr.op_count(), 2);
        let lsn = mtr.commit().unwrap();

        let records = wal.records_from(Lsn::FIRST).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lsn(), lsn);
        assert_eq!(records[0].txn_id(), TxnId::new(3));

        let guard = pool.read(block).unwrap();
        assert_eq!(PageHeader::new(&guard[..]).lsn(), lsn);
        assert_eq!(SlottedPage::new(&guard[..]).get(0), Some(&b"row"[..]));
    }

    #[test]
    fn test_drop_rolls_back() {
        let wal = Arc::new(MemoryWal::new());
        let pool = pool(wal.clone());
        let block = BlockId::new(7);

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        mtr.init(block, BlockType::Data).unwrap();
        mtr.commit().unwrap();

        {
            let mut mtr = pool.begin(TxnId::new(1)).unwrap();
            mtr.apply(PageOp::SlotAppend {
                block,
                data: Bytes::from_static(b"lost"),
            })
            .unwrap();
            assert_eq!(SlottedPage::new(mtr.page(block).unwrap()).slot_count(), 1);
        }

        let guard = pool.read(block).unwrap();
        assert_eq!(SlottedPage::new(&guard[..]).slot_count(), 0);
        assert_eq!(wal.records_from(Lsn::FIRST).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_append_poisons_pool() {
        let pool = pool(Arc::new(FailingWal));
        let block = BlockId::new(4);

        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        mtr.init(block, BlockType::Data).unwrap();
        assert!(mtr.commit().is_err());
        assert!(pool.is_poisoned());
        assert!(pool.begin(TxnId::new(1)).is_err());

        let guard = pool.read(block).unwrap();
        assert!(crate::page::is_zero_page(&guard));
    }

    #[test]
    fn test_empty_commit() {
        let wal = Arc::new(MemoryWal::new());
        let pool = pool(wal.clone());
        let mut mtr = pool.begin(TxnId::new(1)).unwrap();
        mtr.page(BlockId::new(9)).unwrap();
        assert_eq!(mtr.commit().unwrap(), Lsn::INVALID);
        assert!(wal.is_empty());
    }
}
