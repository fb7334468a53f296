//! # sortheap-txn
//!
//! Transaction ids, snapshots, and advisory TapeSet locks for SortHeap.
//!
//! SortHeap runs are immutable and carry the id of the transaction that
//! created them. Whether a reader sees a run is decided entirely by its
//! [`Snapshot`]; whether a merged TapeSet may be vacuumed is decided by the
//! oldest-active horizon of the [`TransactionService`].
//!
//! ## Example
//!
//! ```rust
//! use sortheap_txn::{TransactionService, TxnManager, TxnStatus};
//!
//! let txns = TxnManager::new();
//! let writer = txns.begin().unwrap();
//! let reader = txns.begin().unwrap();
//! txns.commit(writer.xid).unwrap();
//!
//! // The reader's snapshot predates the commit.
//! assert!(!reader.snapshot.is_visible(writer.xid, &txns));
//! assert_eq!(txns.status(writer.xid), TxnStatus::Committed);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod lock;
pub mod manager;
pub mod snapshot;

pub use error::{TransactionError, TxnResult};
pub use lock::{InsertGuard, MergeGuard, TapeSetLock};
pub use manager::{Transaction, TransactionService, TransactionStats, TxnManager, TxnStatus};
pub use snapshot::Snapshot;
