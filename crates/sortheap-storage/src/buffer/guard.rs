//! Page latches (read/write guards) for safe concurrent access.
//!
//! A guard keeps its frame pinned and its latch held for as long as it
//! lives. Dropping it releases the latch first and the pin second, so a
//! frame is never chosen for eviction while someone can still touch it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sortheap_common::types::BlockId;

use super::frame::{BufferFrame, FrameReadLatch, FrameWriteLatch};

/// Shared access to a cached block.
pub struct BlockReadGuard {
    frame: Arc<BufferFrame>,
    block: BlockId,
    latch: Option<FrameReadLatch>,
}

impl BlockReadGuard {
    pub(crate) fn new(frame: Arc<BufferFrame>, block: BlockId) -> Self {
        let latch = Some(frame.read_latch());
        Self {
            frame,
            block,
            latch,
        }
    }

    /// Block this guard covers.
    #[inline]
    pub fn block(&self) -> BlockId {
        self.block
    }
}

impl Deref for BlockReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.latch {
            Some(latch) => latch,
            None => &[],
        }
    }
}

impl Drop for BlockReadGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.frame.unpin();
    }
}

impl fmt::Debug for BlockReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockReadGuard")
            .field("block", &self.block)
            .finish()
    }
}

/// Exclusive access to a cached block.
///
/// Only mini-transactions hand these out: every change to a page must be
/// described by a logged page op.
pub struct BlockWriteGuard {
    frame: Arc<BufferFrame>,
    block: BlockId,
    latch: Option<FrameWriteLatch>,
}

impl BlockWriteGuard {
    pub(crate) fn new(frame: Arc<BufferFrame>, block: BlockId) -> Self {
        let latch = Some(frame.write_latch());
        Self {
            frame,
            block,
            latch,
        }
    }

    /// Block this guard covers.
    #[inline]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Marks the page dirty.
    #[inline]
    pub(crate) fn mark_dirty(&self) {
        self.frame.set_dirty(true);
    }
}

impl Deref for BlockWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.latch {
            Some(latch) => latch,
            None => &[],
        }
    }
}

impl DerefMut for BlockWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.latch {
            Some(latch) => latch,
            None => &mut [],
        }
    }
}

impl Drop for BlockWriteGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.frame.unpin();
    }
}

impl fmt::Debug for BlockWriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockWriteGuard")
            .field("block", &self.block)
            .finish()
    }
}
