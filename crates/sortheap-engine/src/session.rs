//! Multi-relation transactions.
//!
//! A [`Session`] runs one transaction at a time over any number of heaps
//! that share its transaction service. It keeps an insert buffer per
//! relation, flushes a relation's buffer before scanning it so the
//! transaction reads its own rows, and flushes everything on commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sortheap_common::types::{RelationId, TxnId};
use sortheap_storage::row::Row;
use sortheap_txn::{Transaction, TransactionService};
use tracing::{debug, warn};

use crate::dump::InsertBuffer;
use crate::error::{EngineError, EngineResult};
use crate::heap::SortHeap;
use crate::scan::{Scan, ScanOptions};

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transaction open.
    Idle,
    /// A transaction is open.
    InTransaction,
    /// An operation failed; only [`Session::abort`] is accepted.
    Failed,
}

struct RelationSession {
    heap: Arc<SortHeap>,
    buffer: InsertBuffer,
}

/// A client session.
pub struct Session {
    txns: Arc<dyn TransactionService>,
    txn: Option<Transaction>,
    relations: HashMap<RelationId, RelationSession>,
    state: SessionState,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("xid", &self.txn.as_ref().map(|t| t.xid))
            .field("relations", &self.relations.len())
            .finish()
    }
}

impl Session {
    /// Creates an idle session over `txns`.
    pub fn new(txns: Arc<dyn TransactionService>) -> Self {
        Self {
            txns,
            txn: None,
            relations: HashMap::new(),
            state: SessionState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the open transaction.
    pub fn xid(&self) -> Option<TxnId> {
        self.txn.as_ref().map(|t| t.xid)
    }

    /// Opens a transaction.
    pub fn begin(&mut self) -> EngineResult<TxnId> {
        match self.state {
            SessionState::Idle => {}
            SessionState::InTransaction => {
                return Err(EngineError::invalid_state("transaction already open"));
            }
            SessionState::Failed => {
                return Err(EngineError::invalid_state("failed transaction must be aborted"));
            }
        }
        let txn = self.txns.begin()?;
        let xid = txn.xid;
        self.txn = Some(txn);
        self.state = SessionState::InTransaction;
        debug!(%xid, "session transaction started");
        Ok(xid)
    }

    fn active(&self, heap: &SortHeap) -> EngineResult<&Transaction> {
        if self.state == SessionState::Failed {
            return Err(EngineError::SessionClosed {
                relation: heap.relation(),
            });
        }
        let txn = self
            .txn
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("no transaction open"))?;
        let ours = Arc::as_ptr(&self.txns) as *const ();
        let theirs = Arc::as_ptr(heap.txns()) as *const ();
        if ours != theirs {
            return Err(EngineError::invalid_argument(format!(
                "relation {} uses another transaction service",
                heap.relation()
            )));
        }
        Ok(txn)
    }

    /// Buffers `row` for `heap` in the open transaction.
    pub fn insert(&mut self, heap: &Arc<SortHeap>, row: Row) -> EngineResult<()> {
        let xid = self.active(heap)?.xid;
        let relation = self
            .relations
            .entry(heap.relation())
            .or_insert_with(|| RelationSession {
                heap: Arc::clone(heap),
                buffer: InsertBuffer::new(xid),
            });
        let result = relation.heap.insert(&mut relation.buffer, row);
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    /// Scans `heap` with the transaction's snapshot, rows buffered for it
    /// included.
    pub fn scan<'h>(&mut self, heap: &'h Arc<SortHeap>, options: ScanOptions) -> EngineResult<Scan<'h>> {
        self.active(heap)?;
        if let Some(relation) = self.relations.get_mut(&heap.relation()) {
            if let Err(err) = relation.heap.finish_insert(&mut relation.buffer) {
                self.state = SessionState::Failed;
                return Err(err);
            }
        }
        let txn = self.active(heap)?;
        heap.scan_in(txn, options)
    }

    /// Dumps every buffer and commits. On failure the transaction is
    /// aborted.
    pub fn commit(&mut self) -> EngineResult<()> {
        if self.state == SessionState::Failed {
            return Err(EngineError::invalid_state("failed transaction must be aborted"));
        }
        let Some(txn) = self.txn.take() else {
            return Err(EngineError::invalid_state("no transaction open"));
        };
        let flushed = self
            .relations
            .values_mut()
            .try_for_each(|relation| relation.heap.finish_insert(&mut relation.buffer));
        let rows: u64 = self.relations.values().map(|r| r.buffer.inserted()).sum();
        self.relations.clear();
        self.state = SessionState::Idle;
        match flushed {
            Ok(()) => {
                self.txns.commit(txn.xid)?;
                debug!(xid = %txn.xid, rows, "session transaction committed");
                Ok(())
            }
            Err(err) => {
                if let Err(abort) = self.txns.abort(txn.xid) {
                    warn!(xid = %txn.xid, error = %abort, "abort after failed commit");
                }
                Err(err)
            }
        }
    }

    /// Aborts the open transaction, discarding buffered rows.
    pub fn abort(&mut self) -> EngineResult<()> {
        self.relations.clear();
        self.state = SessionState::Idle;
        match self.txn.take() {
            Some(txn) => {
                self.txns.abort(txn.xid)?;
                debug!(xid = %txn.xid, "session transaction aborted");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Ends the session, aborting an open transaction.
    pub fn close(mut self) -> EngineResult<()> {
        self.abort()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(err) = self.txns.abort(txn.xid) {
                warn!(xid = %txn.xid, error = %err, "abort on session drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sortheap_common::config::EngineConfig;
    use sortheap_common::types::RelationId;
    use sortheap_storage::row::Value;
    use sortheap_storage::store::MemoryStore;
    use sortheap_txn::TxnManager;
    use sortheap_wal::{LogSink, MemoryWal};

    use super::*;
    use crate::heap::tests::{heap, keys, row, schema};

    fn shared_heaps() -> (Arc<dyn TransactionService>, Arc<SortHeap>, Arc<SortHeap>) {
        let config = EngineConfig::for_testing().with_sort_buffer_rows(8);
        let wal: Arc<dyn LogSink> = Arc::new(MemoryWal::new());
        let txns: Arc<dyn TransactionService> = Arc::new(TxnManager::with_log(Arc::clone(&wal)));
        let open = |id| {
            Arc::new(
                SortHeap::create_with(
                    config.clone(),
                    RelationId::new(id),
                    schema(),
                    Arc::new(MemoryStore::new(config.block_size)),
                    Arc::new(MemoryWal::new()),
                    Arc::clone(&txns),
                )
                .unwrap(),
            )
        };
        let a = open(1);
        let b = open(2);
        (txns, a, b)
    }

    #[test]
    fn test_commit_spans_relations() {
        let (txns, a, b) = shared_heaps();
        let mut session = Session::new(txns);
        session.begin().unwrap();
        for i in 0..20 {
            session.insert(&a, row(i, i)).unwrap();
            session.insert(&b, row(100 - i, i)).unwrap();
        }
        // Another transaction sees neither relation yet.
        assert_eq!(a.scan(ScanOptions::new()).unwrap().count(), 0);
        assert_eq!(b.scan(ScanOptions::new()).unwrap().count(), 0);
        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(keys(&a), (0..20).collect::<Vec<_>>());
        assert_eq!(keys(&b), (81..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_reads_own_buffered_rows() {
        let (txns, a, _) = shared_heaps();
        let mut session = Session::new(txns);
        session.begin().unwrap();
        for i in 0..3 {
            session.insert(&a, row(i, i)).unwrap();
        }
        let seen = session.scan(&a, ScanOptions::new()).unwrap().count();
        assert_eq!(seen, 3);
        session.abort().unwrap();
        assert!(keys(&a).is_empty());
    }

    #[test]
    fn test_failed_insert_poisons_session() {
        let (txns, a, _) = shared_heaps();
        let mut session = Session::new(txns);
        session.begin().unwrap();
        session.insert(&a, row(1, 1)).unwrap();
        let bad = Row::new(vec![Value::Null]);
        assert!(session.insert(&a, bad).is_err());
        assert_eq!(session.state(), SessionState::Failed);
        let err = session.insert(&a, row(2, 2)).unwrap_err();
        assert!(matches!(err, EngineError::SessionClosed { .. }));
        assert!(session.commit().is_err());
        session.abort().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        session.begin().unwrap();
        session.close().unwrap();
        assert!(keys(&a).is_empty());
    }

    #[test]
    fn test_foreign_service_rejected() {
        let (txns, _, _) = shared_heaps();
        let other = Arc::new(heap());
        let mut session = Session::new(txns);
        session.begin().unwrap();
        let err = session.insert(&other, row(1, 1)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_heap_session_and_drop_aborts() {
        let heap = Arc::new(heap());
        {
            let mut session = heap.session();
            session.begin().unwrap();
            session.insert(&heap, row(5, 5)).unwrap();
            session.scan(&heap, ScanOptions::new()).unwrap().count();
        }
        assert!(keys(&heap).is_empty());
        assert_eq!(heap.txns().oldest_active(), heap.txns().snapshot().xmax);
    }
}
