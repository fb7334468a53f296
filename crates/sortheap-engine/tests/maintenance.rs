//! Background maintenance, concurrent writers and sessions.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sortheap_common::config::{EngineConfig, RetryPolicy};
use sortheap_common::types::RelationId;
use sortheap_engine::{ScanOptions, Session, SessionState, SortHeap, TapeSetStatus, ThreadLauncher};
use sortheap_storage::store::MemoryStore;
use sortheap_txn::{TransactionService, TxnManager};
use sortheap_wal::{LogSink, MemoryWal};

use common::{all_ids, heap, init_tracing, row, schema};

fn settled(heap: &SortHeap) -> bool {
    heap.describe().unwrap().tapesets.iter().all(|t| {
        matches!(t.status, None | Some(TapeSetStatus::MergedVacuumed))
    })
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_background_worker_merges_and_vacuums() {
    init_tracing();
    let config = EngineConfig::for_testing()
        .with_sort_buffer_rows(32)
        .with_merge_trigger_level(1)
        .with_background_maintenance(true);
    let heap = heap(config);
    heap.load((0..400).rev().map(row)).unwrap();

    assert!(wait_until(Duration::from_secs(20), || settled(&heap)));
    heap.stop_maintenance().unwrap();
    assert_eq!(all_ids(&heap), (0..400).collect::<Vec<_>>());
    let report = heap.describe().unwrap();
    assert!(report.tapesets.iter().any(|t| t.result.is_valid()));
}

#[test]
fn test_spawned_merge_task() {
    let heap = heap(EngineConfig::for_testing().with_sort_buffer_rows(40));
    heap.load((0..200).map(row)).unwrap();
    let task = heap.spawn_merge(&ThreadLauncher, true).unwrap();
    assert_eq!(task.relation(), heap.relation());
    task.wait().unwrap();

    let report = heap.describe().unwrap();
    assert_eq!(report.tapesets[0].status, Some(TapeSetStatus::MergedUnvacuumed));
    assert_eq!(all_ids(&heap), (0..200).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_writers_and_merges() {
    let heap = Arc::new(heap(
        EngineConfig::for_testing()
            .with_sort_buffer_rows(50)
            .with_tapesets(3)
            .with_retry(RetryPolicy {
                max_attempts: 500,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
            }),
    ));
    thread::scope(|scope| {
        for writer in 0..4i64 {
            let heap = Arc::clone(&heap);
            scope.spawn(move || {
                for batch in 0..5i64 {
                    let start = writer * 1000 + batch * 200;
                    heap.load((start..start + 200).map(row)).unwrap();
                }
            });
        }
        let heap = Arc::clone(&heap);
        scope.spawn(move || {
            for _ in 0..20 {
                heap.merge_once(false).unwrap();
                heap.vacuum_once().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });
    });

    while heap.merge_once(true).unwrap() {}
    heap.vacuum_once().unwrap();
    let expected: Vec<i64> = (0..4)
        .flat_map(|writer| writer * 1000..writer * 1000 + 1000)
        .collect();
    assert_eq!(all_ids(&heap), expected);
}

#[test]
fn test_session_spans_two_relations() {
    let config = EngineConfig::for_testing().with_sort_buffer_rows(25);
    let txns: Arc<dyn TransactionService> = Arc::new(TxnManager::new());
    let open = |id| {
        Arc::new(
            SortHeap::create_with(
                config.clone(),
                RelationId::new(id),
                schema(),
                Arc::new(MemoryStore::new(config.block_size)),
                Arc::new(MemoryWal::new()) as Arc<dyn LogSink>,
                Arc::clone(&txns),
            )
            .unwrap(),
        )
    };
    let orders = open(1);
    let audit = open(2);

    let mut session = Session::new(Arc::clone(&txns));
    session.begin().unwrap();
    for id in 0..60 {
        session.insert(&orders, row(id)).unwrap();
        session.insert(&audit, row(1000 + id)).unwrap();
    }
    orders.load((100..150).map(row)).unwrap();
    // The session's runs are not committed, so the merge has to wait.
    assert!(orders.merge_once(true).unwrap());
    // The session sees its own rows but not a load committed after it began.
    assert_eq!(session.scan(&orders, ScanOptions::new()).unwrap().count(), 60);
    assert_eq!(all_ids(&orders), (100..150).collect::<Vec<_>>());
    session.commit().unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let mut expected: Vec<i64> = (0..60).collect();
    expected.extend(100..150);
    assert_eq!(all_ids(&orders), expected);
    assert_eq!(all_ids(&audit), (1000..1060).collect::<Vec<_>>());

    session.begin().unwrap();
    session.insert(&audit, row(5000)).unwrap();
    session.abort().unwrap();
    assert_eq!(all_ids(&audit).len(), 60);
    session.close().unwrap();
}
