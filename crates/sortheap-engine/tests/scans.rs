//! Bounded, filtered and backward scans.

mod common;

use sortheap_common::config::{CompressionConfig, EngineConfig};
use sortheap_engine::{Bound, EngineError, ScanOptions, SortHeap};
use sortheap_storage::index::{CompareOp, ScanPredicate};
use sortheap_storage::row::{Row, Value};
use sortheap_storage::tape::ScanDirection;

use common::{all_ids, heap, ids, row};

fn loaded(config: EngineConfig, merge: bool) -> SortHeap {
    let heap = heap(config);
    for start in (0..3000).step_by(1000) {
        heap.load((start..start + 1000).rev().map(row)).unwrap();
    }
    if merge {
        heap.merge_once(true).unwrap();
        heap.vacuum_once().unwrap();
    }
    heap
}

fn ranged() -> EngineConfig {
    EngineConfig::for_testing()
        .with_sort_buffer_rows(400)
        .with_blocks_per_range(1)
}

#[test]
fn test_predicate_matches_linear_filter() {
    for merge in [false, true] {
        let heap = loaded(ranged(), merge);
        let predicate = ScanPredicate::new()
            .and(0, CompareOp::Ge, 1234i64)
            .and(0, CompareOp::Lt, 1301i64)
            .and(1, CompareOp::Eq, 4i64);
        let expected: Vec<i64> = all_ids(&heap)
            .into_iter()
            .filter(|id| (1234..1301).contains(id) && id % 10 == 4)
            .collect();
        assert_eq!(expected.len(), 7);
        assert_eq!(
            ids(&heap, ScanOptions::new().with_predicate(predicate)),
            expected
        );
    }
}

#[test]
fn test_predicate_excluding_everything() {
    let heap = loaded(ranged(), true);
    let predicate = ScanPredicate::new().and(0, CompareOp::Gt, 5000i64);
    assert!(ids(&heap, ScanOptions::new().with_predicate(predicate)).is_empty());

    let predicate = ScanPredicate::new().and(1, CompareOp::Eq, 42i64);
    assert!(ids(&heap, ScanOptions::new().with_predicate(predicate)).is_empty());
}

#[test]
fn test_bounds_in_both_directions() {
    for merge in [false, true] {
        let heap = loaded(ranged(), merge);
        let options = ScanOptions::new()
            .with_lower(Bound::exclusive(vec![Value::Int(100)]))
            .with_upper(Bound::inclusive(vec![Value::Int(2500)]));

        let forward = ids(&heap, options.clone());
        assert_eq!(forward, (101..=2500).collect::<Vec<_>>());

        let backward = ids(&heap, options.with_direction(ScanDirection::Backward));
        assert_eq!(backward, (101..=2500).rev().collect::<Vec<_>>());
    }
}

#[test]
fn test_bound_outside_data() {
    let heap = loaded(ranged(), false);
    let above = ScanOptions::new().with_lower(Bound::inclusive(vec![Value::Int(9000)]));
    assert!(ids(&heap, above).is_empty());
    let below = ScanOptions::new()
        .with_upper(Bound::exclusive(vec![Value::Int(0)]))
        .with_direction(ScanDirection::Backward);
    assert!(ids(&heap, below).is_empty());
}

#[test]
fn test_rescan_and_direction_switch() {
    let heap = loaded(ranged(), true);
    let mut scan = heap
        .scan(ScanOptions::new().with_upper(Bound::inclusive(vec![Value::Int(9)])))
        .unwrap();
    let first: Vec<i64> = (0..3)
        .map(|_| scan.next_row().unwrap().unwrap().get(0).and_then(Value::as_int).unwrap())
        .collect();
    assert_eq!(first, vec![0, 1, 2]);

    let last = scan.next_in(ScanDirection::Backward).unwrap().unwrap();
    assert_eq!(last.get(0).and_then(Value::as_int), Some(9));
    assert_eq!(scan.direction(), ScanDirection::Backward);

    scan.rescan(ScanDirection::Forward).unwrap();
    assert_eq!(scan.by_ref().count(), 10);
    assert!(scan.next_row().unwrap().is_none());
}

#[test]
fn test_projection_keeps_requested_columns() {
    let heap = loaded(ranged(), false);
    let rows: Vec<Row> = heap
        .scan(
            ScanOptions::new()
                .with_upper(Bound::exclusive(vec![Value::Int(3)]))
                .with_projection(vec![2, 0]),
        )
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].get(0), Some(&Value::Text("payload-000001".into())));
    assert_eq!(rows[1].get(1), Some(&Value::Int(1)));

    let err = heap
        .scan(ScanOptions::new().with_projection(vec![7]))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument { .. }));
}

/// Rows sharing a key are stored column-wise once the group is large
/// enough; reading them back must not lose or reorder anything.
#[test]
fn test_compressed_relation_round_trips() {
    let config = ranged().with_compression(CompressionConfig::enabled().with_min_group_rows(4));
    let heap = heap(config);
    assert_eq!(heap.format_name(), "compressed");

    let group_row = |seq: i64| {
        Row::new(vec![
            Value::Int(seq / 25),
            Value::Int(seq),
            Value::Text(format!("member-{seq}")),
        ])
    };
    heap.load((0..1000).rev().map(group_row)).unwrap();
    heap.load((1000..1500).map(group_row)).unwrap();

    let check = |heap: &SortHeap| {
        let rows: Vec<Row> = heap
            .scan(ScanOptions::new())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(rows.len(), 1500);
        let keys: Vec<i64> = rows.iter().map(|r| r.get(0).and_then(Value::as_int).unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        let mut seqs: Vec<i64> = rows.iter().map(|r| r.get(1).and_then(Value::as_int).unwrap()).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..1500).collect::<Vec<_>>());
        assert!(rows.iter().all(|r| {
            let seq = r.get(1).and_then(Value::as_int).unwrap();
            r.get(2).and_then(Value::as_str) == Some(format!("member-{seq}").as_str())
        }));
    };
    check(&heap);
    heap.merge_once(true).unwrap();
    heap.vacuum_once().unwrap();
    check(&heap);

    let predicate = ScanPredicate::new().and(0, CompareOp::Eq, 17i64);
    let members = heap
        .scan(ScanOptions::new().with_predicate(predicate))
        .unwrap()
        .count();
    assert_eq!(members, 25);
}

#[test]
fn test_locators_survive_until_vacuum() {
    let heap = loaded(ranged(), false);
    let mut scan = heap
        .scan(ScanOptions::new().with_lower(Bound::inclusive(vec![Value::Int(2000)])))
        .unwrap();
    let (locator, row) = scan.next_entry().unwrap().unwrap();
    drop(scan);
    assert_eq!(heap.fetch_by_locator(locator).unwrap(), Some(row));
}
