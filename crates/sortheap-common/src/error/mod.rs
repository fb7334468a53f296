//! Error handling for SortHeap.
//!
//! This module provides the workspace-wide error type and result alias.
//! Component crates define their own error enums and convert into
//! [`SortHeapError`] at the boundary.

mod sortheap;

pub use sortheap::{ErrorCode, SortHeapError};

/// Result type alias for SortHeap operations.
pub type SortHeapResult<T> = std::result::Result<T, SortHeapError>;
