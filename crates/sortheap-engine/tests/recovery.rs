//! Reopening relations after a crash.

mod common;

use std::sync::Arc;

use sortheap_common::config::EngineConfig;
use sortheap_common::types::RelationId;
use sortheap_engine::{SortHeap, TapeSetStatus};
use sortheap_storage::store::{FileStore, MemoryStore};
use sortheap_wal::{FileWal, MemoryWal, WalConfig};

use common::{all_ids, memory_heap, row, schema};

fn config() -> EngineConfig {
    EngineConfig::for_testing()
        .with_sort_buffer_rows(50)
        .with_tapesets(1)
}

/// What a crash would leave behind: flushed blocks plus the whole log.
fn crash_copy(store: &MemoryStore, wal: &MemoryWal) -> SortHeap {
    SortHeap::open(
        config(),
        Arc::new(store.fork()),
        Arc::new(MemoryWal::from_bytes(wal.to_bytes())),
    )
    .unwrap()
}

#[test]
fn test_interrupted_merge_resumes_after_restart() {
    let (heap, store, wal) = memory_heap(config());
    heap.load((0..1000).rev().map(row)).unwrap();
    assert!(heap.merge_steps(true, 1).unwrap());

    let reopened = crash_copy(&store, &wal);
    let state = reopened.describe().unwrap();
    assert!(state.tapesets[0].merging);
    assert_eq!(state.tapesets[0].status, Some(TapeSetStatus::BuildingRuns));
    assert_eq!(all_ids(&reopened), (0..1000).collect::<Vec<_>>());

    assert!(!reopened.merge_once(true).unwrap());
    assert!(!reopened.vacuum_once().unwrap());
    assert_eq!(all_ids(&reopened), (0..1000).collect::<Vec<_>>());
    let state = reopened.describe().unwrap();
    assert_eq!(state.tapesets[0].status, Some(TapeSetStatus::MergedVacuumed));
}

#[test]
fn test_crash_before_commit_loses_only_that_load() {
    let (heap, store, wal) = memory_heap(config());
    heap.load((0..100).map(row)).unwrap();

    let txn = heap.txns().begin().unwrap();
    let mut buffer = heap.begin_insert(&txn);
    for id in 100..220 {
        heap.insert(&mut buffer, row(id)).unwrap();
    }

    let reopened = crash_copy(&store, &wal);
    assert!(reopened.recovery_stats().is_some());
    assert_eq!(all_ids(&reopened), (0..100).collect::<Vec<_>>());

    // The orphaned runs are merged away.
    reopened.load((220..230).map(row)).unwrap();
    assert!(!reopened.merge_once(true).unwrap());
    reopened.vacuum_once().unwrap();
    let mut expected: Vec<i64> = (0..100).collect();
    expected.extend(220..230);
    assert_eq!(all_ids(&reopened), expected);
}

#[test]
fn test_file_backed_relation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("relation.db");
    let wal_config = WalConfig::for_testing(dir.path().join("wal"));
    let config = config();

    {
        let heap = SortHeap::create(
            config.clone(),
            RelationId::new(7),
            schema(),
            Arc::new(FileStore::open(&db, config.block_size).unwrap()),
            Arc::new(FileWal::open(wal_config.clone()).unwrap()),
        )
        .unwrap();
        heap.load((0..300).rev().map(row)).unwrap();
        heap.merge_once(true).unwrap();
        heap.checkpoint().unwrap();
        heap.load((300..400).map(row)).unwrap();
    }

    let heap = SortHeap::open(
        config.clone(),
        Arc::new(FileStore::open(&db, config.block_size).unwrap()),
        Arc::new(FileWal::open(wal_config).unwrap()),
    )
    .unwrap();
    assert_eq!(heap.relation(), RelationId::new(7));
    assert_eq!(heap.schema(), &schema());
    assert_eq!(all_ids(&heap), (0..400).collect::<Vec<_>>());

    heap.load((400..450).map(row)).unwrap();
    heap.merge_once(true).unwrap();
    heap.vacuum_once().unwrap();
    assert_eq!(all_ids(&heap), (0..450).collect::<Vec<_>>());
}
