//! Snapshot visibility.
//!
//! A snapshot fixes which transactions a reader considers committed:
//!
//! - its own writes are always visible;
//! - transactions at or after `xmax` had not started when it was taken;
//! - transactions listed in `active` were still running;
//! - everything else is visible exactly when it committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use sortheap_common::types::TxnId;

use crate::manager::{TransactionService, TxnStatus};

/// A consistent view of which transactions are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Owning transaction (`INVALID` for a standalone read snapshot).
    pub xid: TxnId,
    /// Lowest transaction still running when the snapshot was taken.
    pub xmin: TxnId,
    /// First transaction id not yet assigned when the snapshot was taken.
    pub xmax: TxnId,
    /// Transactions running when the snapshot was taken.
    pub active: Arc<BTreeSet<TxnId>>,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(xid: TxnId, xmax: TxnId, active: BTreeSet<TxnId>) -> Self {
        let xmin = active.iter().next().copied().unwrap_or(xmax).min(xmax);
        Self {
            xid,
            xmin,
            xmax,
            active: Arc::new(active),
        }
    }

    /// Returns true if the effects of `xid` are visible in this snapshot.
    pub fn is_visible(&self, xid: TxnId, service: &dyn TransactionService) -> bool {
        if !xid.is_valid() {
            return false;
        }
        if xid == self.xid {
            return true;
        }
        if xid >= self.xmax || self.active.contains(&xid) {
            return false;
        }
        service.status(xid) == TxnStatus::Committed
    }

    /// Returns true if `xid` was running or not yet started at snapshot time.
    pub fn is_concurrent(&self, xid: TxnId) -> bool {
        xid >= self.xmax || self.active.contains(&xid)
    }
}
