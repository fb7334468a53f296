//! Log sinks.
//!
//! A [`LogSink`] appends framed records and hands them back for recovery.
//! [`MemoryWal`] keeps the framed stream in memory; [`FileWal`] writes it to
//! a single append-only file.

mod file;
mod memory;

pub use file::FileWal;
pub use memory::MemoryWal;

use std::fmt;

use sortheap_common::types::{Lsn, TxnId};

use crate::error::WalResult;
use crate::record::{WalPayload, WalRecord};

/// Destination of WAL records.
///
/// Appends are totally ordered; the returned LSN is the record's position.
/// After `append` returns, the record is part of the readable log. Whether
/// it survives a crash depends on the sink's sync policy.
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Appends a record and returns its LSN.
    fn append(&self, txn_id: TxnId, payload: &WalPayload) -> WalResult<Lsn>;

    /// Forces every appended record to durable storage.
    fn flush(&self) -> WalResult<()>;

    /// LSN the next append will receive.
    fn next_lsn(&self) -> Lsn;

    /// Highest LSN known to be durable.
    fn durable_lsn(&self) -> Lsn;

    /// Returns every readable record with LSN >= `lsn`, in order.
    fn records_from(&self, lsn: Lsn) -> WalResult<Vec<WalRecord>>;
}
