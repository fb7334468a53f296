//! # sortheap-wal
//!
//! Write-ahead logging for SortHeap.
//!
//! Every page mutation made by the storage layer is described by a typed
//! [`PageOp`]. A mini-transaction groups the ops it applied and appends them
//! as one `PageOps` record, so a crash can never expose half of a group.
//! Transaction outcomes are logged as `Commit` / `Abort` records and
//! checkpoints record the LSN redo has to start from.
//!
//! ## Record Format
//!
//! Each record consists of a 32-byte header followed by a variable-length payload:
//!
//! ```text
//! +----------+----------+------+---------+-------+----------+--------+----------+
//! | LSN (8)  | TxnId(8) | Type | Version | Flags | Reserved | Length | Checksum |
//! +----------+----------+------+---------+-------+----------+--------+----------+
//! |                              Payload (variable)                             |
//! +-----------------------------------------------------------------------------+
//! ```
//!
//! A record whose checksum does not match, or that is cut short, ends the
//! readable log: everything before it is replayed, nothing after it is.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// WAL record types and serialization.
pub mod record;

/// Log sink trait and implementations.
pub mod sink;

// Re-exports for convenience
pub use config::{SyncPolicy, WalConfig};
pub use error::{WalError, WalResult};
pub use record::{PageOp, RecordFlags, RecordHeader, RecordType, WalPayload, WalRecord};
pub use sink::{FileWal, LogSink, MemoryWal};
