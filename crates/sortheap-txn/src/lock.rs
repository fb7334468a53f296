//! Advisory TapeSet locks.
//!
//! Inserting into a TapeSet and merging it are mutually exclusive. Many
//! inserters may hold the lock at once; a merge (or vacuum) holds it alone.
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ Insert │ Merge │
//! ─────────┼────────┼───────┤
//!  Insert  │   ✓    │   ✗   │
//!  Merge   │   ✗    │   ✗   │
//! ```
//!
//! Acquisition never blocks except through [`TapeSetLock::wait_for_merge`],
//! which waits a bounded time. Guards are owned values so a session can keep
//! its insert guard until its transaction ends.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockInner {
    inserters: usize,
    merging: bool,
}

#[derive(Debug, Default)]
struct LockState {
    inner: Mutex<LockInner>,
    released: Condvar,
}

/// Advisory lock guarding one TapeSet.
#[derive(Debug, Clone, Default)]
pub struct TapeSetLock {
    state: Arc<LockState>,
}

impl TapeSetLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a shared insert lock unless a merge holds the TapeSet.
    pub fn try_insert(&self) -> Option<InsertGuard> {
        let mut inner = self.state.inner.lock();
        if inner.merging {
            return None;
        }
        inner.inserters += 1;
        Some(InsertGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Takes the exclusive merge lock if nobody holds the TapeSet.
    pub fn try_merge(&self) -> Option<MergeGuard> {
        let mut inner = self.state.inner.lock();
        if inner.merging || inner.inserters > 0 {
            return None;
        }
        inner.merging = true;
        Some(MergeGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Waits up to `timeout` for the exclusive merge lock.
    pub fn wait_for_merge(&self, timeout: Duration) -> Option<MergeGuard> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock();
        while inner.merging || inner.inserters > 0 {
            if self
                .state
                .released
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return None;
            }
        }
        inner.merging = true;
        Some(MergeGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Returns true while a merge guard is held.
    pub fn is_merging(&self) -> bool {
        self.state.inner.lock().merging
    }

    /// Returns the number of insert guards held.
    pub fn inserters(&self) -> usize {
        self.state.inner.lock().inserters
    }
}

/// Shared insert guard; released on drop.
pub struct InsertGuard {
    state: Arc<LockState>,
}

impl Drop for InsertGuard {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.inserters -= 1;
        if inner.inserters == 0 {
            self.state.released.notify_all();
        }
    }
}

impl fmt::Debug for InsertGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InsertGuard")
    }
}

/// Exclusive merge guard; released on drop.
pub struct MergeGuard {
    state: Arc<LockState>,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.state.inner.lock().merging = false;
        self.state.released.notify_all();
    }
}

impl fmt::Debug for MergeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergeGuard")
    }
}
