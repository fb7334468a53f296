//! Configuration for SortHeap.
//!
//! This module provides the engine-level configuration structures. WAL and
//! buffer pool settings live next to their components.

mod engine;

pub use engine::{CompressionConfig, EngineConfig, RetryPolicy};
