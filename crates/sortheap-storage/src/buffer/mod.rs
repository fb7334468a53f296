//! Buffer pool manager for SortHeap.
//!
//! The buffer pool caches the blocks of one relation and is the only path
//! by which pages change:
//!
//! - **Guards**: [`BlockReadGuard`] pins a frame and holds its shared latch;
//!   dropping it releases both
//! - **Mini-transactions**: [`MiniTxn`] latches pages exclusively, applies
//!   [`PageOp`](sortheap_wal::PageOp)s and logs them as one atomic record
//! - **Eviction**: clock algorithm over unpinned frames
//! - **Write-ahead rule**: a dirty page is written back only after the log
//!   covering its LSN is durable
//! - **Recovery**: [`redo::recover`] replays the log into the store through
//!   the same dispatcher the forward path uses
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        BufferPool                        │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │       Block Table  HashMap<BlockId, frame>         │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                           │                              │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐     ┌─────────┐     │
//! │  │ Frame 0 │ │ Frame 1 │ │ Frame 2 │ ... │ Frame N │     │
//! │  │ block   │ │ block   │ │ block   │     │ block   │     │
//! │  │ latch   │ │ latch   │ │ latch   │     │ latch   │     │
//! │  │ pins    │ │ pins    │ │ pins    │     │ pins    │     │
//! │  └─────────┘ └─────────┘ └─────────┘     └─────────┘     │
//! │                           │                              │
//! │          BlockStore            LogSink (WAL)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use sortheap_common::types::{BlockId, BlockType, TxnId};
//! use sortheap_storage::buffer::{BufferPool, BufferPoolConfig};
//! use sortheap_storage::page::SlottedPage;
//! use sortheap_storage::store::MemoryStore;
//! use sortheap_wal::{MemoryWal, PageOp};
//!
//! let pool = BufferPool::new(
//!     BufferPoolConfig::for_testing(),
//!     Arc::new(MemoryStore::new(4096)),
//!     Arc::new(MemoryWal::new()),
//! ).unwrap();
//!
//! let block = BlockId::new(3);
//! let mut mtr = pool.begin(TxnId::new(1)).unwrap();
//! mtr.init(block, BlockType::Data).unwrap();
//! mtr.apply(PageOp::SlotAppend { block, data: Bytes::from_static(b"row") }).unwrap();
//! mtr.commit().unwrap();
//!
//! let guard = pool.read(block).unwrap();
//! assert_eq!(SlottedPage::new(&guard[..]).get(0), Some(&b"row"[..]));
//! ```

mod config;
mod frame;
mod guard;
mod mtr;
mod pool;
pub mod redo;

pub use config::BufferPoolConfig;
pub use guard::{BlockReadGuard, BlockWriteGuard};
pub use mtr::MiniTxn;
pub use pool::BufferPool;
pub use redo::{recover, RecoveryStats};

/// Buffer pool statistics.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    /// Total number of block fetches.
    pub fetches: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (required a store read).
    pub misses: u64,
    /// Number of frames evicted.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub flushes: u64,
    /// Frames currently allocated.
    pub frames: usize,
    /// Current number of pinned frames.
    pub pinned_frames: usize,
    /// Current number of dirty frames.
    pub dirty_frames: usize,
}

impl BufferPoolStats {
    /// Returns the cache hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            self.hits as f64 / self.fetches as f64
        }
    }
}
