//! # sortheap-storage
//!
//! Storage layer of the SortHeap table engine.
//!
//! - [`page`]: 48-byte page header, slotted records and structured bodies
//! - [`store`]: block stores (in memory, single file)
//! - [`buffer`]: pinning buffer pool, mini-transactions and redo
//! - [`alloc`]: bitmap block allocator
//! - [`tape`]: tapes of sorted runs with preallocation and vacuum
//! - [`row`]: values, rows, schemas and sort keys
//! - [`index`]: per-run B-tree and block-range summaries
//! - [`columnar`]: column compression of same-key groups
//!
//! Every page change goes through a [`buffer::MiniTxn`], which applies typed
//! [`sortheap_wal::PageOp`]s and logs them as one atomic group.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

/// Block allocator.
pub mod alloc;

/// Buffer pool and mini-transactions.
pub mod buffer;

/// Column compression.
pub mod columnar;

/// Per-run indexes.
pub mod index;

/// Page layout and checksums.
pub mod page;

/// Row model.
pub mod row;

/// Block stores.
pub mod store;

/// Tape I/O.
pub mod tape;

pub use error::{StorageError, StorageResult};
