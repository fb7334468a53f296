//! Crash recovery when a relation is opened.
//!
//! Pages are rebuilt by replaying the log into the store before a buffer
//! pool exists. Transaction outcomes come from the same log: anything that
//! logged page changes without a commit record is aborted, which makes its
//! runs invisible and lets the next merge step retry cleanly.

use std::sync::Arc;

use sortheap_storage::buffer::{self, RecoveryStats};
use sortheap_storage::store::BlockStore;
use sortheap_txn::TxnManager;
use sortheap_wal::LogSink;
use tracing::info;

use crate::error::EngineResult;

/// Replays `wal` into `store`.
pub(crate) fn recover_pages(store: &dyn BlockStore, wal: &dyn LogSink) -> EngineResult<RecoveryStats> {
    let stats = buffer::recover(store, wal)?;
    info!(
        redo_lsn = %stats.redo_lsn,
        last_lsn = %stats.last_lsn,
        scanned = stats.records_scanned,
        applied = stats.records_applied,
        skipped = stats.ops_skipped,
        pages = stats.pages_written,
        "replayed log"
    );
    Ok(stats)
}

/// Rebuilds a transaction service from the commit and abort records of
/// `wal`. New transactions keep logging to it.
pub(crate) fn recover_transactions(wal: Arc<dyn LogSink>) -> EngineResult<TxnManager> {
    Ok(TxnManager::recover(wal)?)
}

#[cfg(test)]
mod tests {
    use sortheap_common::config::EngineConfig;
    use sortheap_common::types::RelationId;
    use sortheap_storage::store::MemoryStore;
    use sortheap_txn::{TransactionService, TxnStatus};
    use sortheap_wal::MemoryWal;

    use super::*;
    use crate::heap::tests::{keys, row, schema};
    use crate::heap::SortHeap;

    fn config() -> EngineConfig {
        EngineConfig::for_testing().with_sort_buffer_rows(16)
    }

    fn create(store: &Arc<MemoryStore>, wal: &Arc<MemoryWal>) -> SortHeap {
        SortHeap::create(
            config(),
            RelationId::new(3),
            schema(),
            Arc::clone(store) as Arc<dyn BlockStore>,
            Arc::clone(wal) as Arc<dyn LogSink>,
        )
        .unwrap()
    }

    fn reopen(store: &MemoryStore, wal: &MemoryWal) -> SortHeap {
        SortHeap::open(
            config(),
            Arc::new(store.fork()),
            Arc::new(MemoryWal::from_bytes(wal.to_bytes())),
        )
        .unwrap()
    }

    #[test]
    fn test_replay_rebuilds_unflushed_pages() {
        let store = Arc::new(MemoryStore::new(config().block_size));
        let wal = Arc::new(MemoryWal::new());
        let heap = create(&store, &wal);
        heap.load((0..50).rev().map(|i| row(i, i))).unwrap();

        let reopened = reopen(&store, &wal);
        let stats = reopened.recovery_stats().unwrap();
        assert!(stats.records_scanned > 0);
        assert_eq!(keys(&reopened), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_unfinished_transaction_recovers_aborted() {
        let store = Arc::new(MemoryStore::new(config().block_size));
        let wal = Arc::new(MemoryWal::new());
        let heap = create(&store, &wal);
        heap.load((0..20).map(|i| row(i, i))).unwrap();

        let txn = heap.txns().begin().unwrap();
        let mut buffer = heap.begin_insert(&txn);
        for i in 100..120 {
            heap.insert(&mut buffer, row(i, i)).unwrap();
        }
        heap.finish_insert(&mut buffer).unwrap();

        let copy: Arc<dyn LogSink> = Arc::new(MemoryWal::from_bytes(wal.to_bytes()));
        let txns = recover_transactions(Arc::clone(&copy)).unwrap();
        assert_eq!(txns.status(txn.xid), TxnStatus::Aborted);
        assert!(txns.next_xid() > txn.xid);

        let reopened = reopen(&store, &wal);
        assert_eq!(keys(&reopened), (0..20).collect::<Vec<_>>());
    }
}
