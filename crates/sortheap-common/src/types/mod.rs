//! Type definitions for SortHeap.
//!
//! This module contains the identifier types shared across the workspace.

mod block;
mod ids;

pub use block::{BlockType, RowLocator};
pub use ids::{BlockId, Lsn, RelationId, TxnId};
