//! Buffer frame - a slot in the buffer pool that holds a page.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use sortheap_common::types::BlockId;

/// One cached page plus its bookkeeping.
///
/// The page bytes sit behind an `Arc<RwLock<_>>` so that guards can own
/// their latch independently of the frame table.
#[derive(Debug)]
pub(crate) struct BufferFrame {
    block: AtomicU64,
    data: Arc<RwLock<Vec<u8>>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    ref_bit: AtomicBool,
}

pub(crate) type FrameReadLatch = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;
pub(crate) type FrameWriteLatch = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

impl BufferFrame {
    /// Creates an empty frame.
    pub fn new(page_size: usize) -> Self {
        Self {
            block: AtomicU64::new(BlockId::INVALID.as_u64()),
            data: Arc::new(RwLock::new(vec![0u8; page_size])),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            ref_bit: AtomicBool::new(false),
        }
    }

    /// Block currently held, `INVALID` when empty.
    #[inline]
    pub fn block(&self) -> BlockId {
        BlockId::new(self.block.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_block(&self, block: BlockId) {
        self.block.store(block.as_u64(), Ordering::Release);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.block().is_valid()
    }

    #[inline]
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        self.ref_bit.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame");
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Clears the reference bit and returns its previous value.
    #[inline]
    pub fn take_ref_bit(&self) -> bool {
        self.ref_bit.swap(false, Ordering::Relaxed)
    }

    /// Short-lived read access for write-back and loading.
    pub fn data(&self) -> &RwLock<Vec<u8>> {
        &self.data
    }

    /// Shared latch owned by a guard.
    pub fn read_latch(&self) -> FrameReadLatch {
        self.data.read_arc()
    }

    /// Exclusive latch owned by a guard.
    pub fn write_latch(&self) -> FrameWriteLatch {
        self.data.write_arc()
    }

    /// Returns the frame to the empty state.
    pub fn reset(&self) {
        self.set_block(BlockId::INVALID);
        self.set_dirty(false);
        self.ref_bit.store(false, Ordering::Relaxed);
    }
}
