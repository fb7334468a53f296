//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sortheap_common::config::EngineConfig;
use sortheap_common::types::RelationId;
use sortheap_engine::{ScanOptions, SortHeap};
use sortheap_storage::row::{Column, ColumnType, Row, Schema, SortKey, SortKeyColumn, Value};
use sortheap_storage::store::MemoryStore;
use sortheap_wal::MemoryWal;

/// `(id, bucket, payload)` sorted by `id`.
pub fn schema() -> Schema {
    Schema::new(
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("bucket", ColumnType::Int),
            Column::new("payload", ColumnType::Text),
        ],
        SortKey::new(vec![SortKeyColumn::asc(0)]),
    )
    .unwrap()
}

pub fn row(id: i64) -> Row {
    Row::new(vec![
        Value::Int(id),
        Value::Int(id % 10),
        Value::Text(format!("payload-{id:06}")),
    ])
}

/// Heap over fresh in-memory storage; also returns both for forking.
pub fn memory_heap(config: EngineConfig) -> (SortHeap, Arc<MemoryStore>, Arc<MemoryWal>) {
    let store = Arc::new(MemoryStore::new(config.block_size));
    let wal = Arc::new(MemoryWal::new());
    let heap = SortHeap::create(
        config,
        RelationId::new(42),
        schema(),
        store.clone(),
        wal.clone(),
    )
    .unwrap();
    (heap, store, wal)
}

pub fn heap(config: EngineConfig) -> SortHeap {
    memory_heap(config).0
}

pub fn ids(heap: &SortHeap, options: ScanOptions) -> Vec<i64> {
    heap.scan(options)
        .unwrap()
        .map(|row| row.unwrap().get(0).and_then(Value::as_int).unwrap())
        .collect()
}

pub fn all_ids(heap: &SortHeap) -> Vec<i64> {
    ids(heap, ScanOptions::new())
}

/// Opt-in log output: `RUST_LOG=sortheap_engine=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
