//! # sortheap-common
//!
//! Common types, errors, and configuration for SortHeap.
//!
//! This crate provides the foundational types used across every SortHeap
//! component:
//!
//! - **Types**: identifiers (`BlockId`, `TxnId`, `Lsn`, `RelationId`),
//!   row locators and block type tags
//! - **Errors**: unified error handling with `SortHeapError` and stable
//!   `ErrorCode`s
//! - **Config**: engine, compression and retry configuration
//! - **Constants**: on-disk format constants and limits
//!
//! ## Example
//!
//! ```rust
//! use sortheap_common::types::{BlockId, RowLocator};
//! use sortheap_common::error::SortHeapResult;
//!
//! fn example() -> SortHeapResult<()> {
//!     let block = BlockId::new(42);
//!     let loc = RowLocator::new(block, 3);
//!     assert_eq!(loc.block, block);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorCode, SortHeapError, SortHeapResult};
pub use types::{BlockId, BlockType, Lsn, RelationId, RowLocator, TxnId};
