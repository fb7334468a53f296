//! Transaction manager.
//!
//! [`TransactionService`] is the seam the engine depends on; [`TxnManager`]
//! is the in-memory implementation. When constructed with a log sink it
//! writes `Commit` / `Abort` records so that [`TxnManager::recover`] can
//! rebuild transaction outcomes after a restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use sortheap_common::types::{Lsn, TxnId};
use sortheap_wal::{LogSink, WalPayload};
use tracing::{debug, info, warn};

use crate::error::{TransactionError, TxnResult};
use crate::snapshot::Snapshot;

/// The outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Still running (or not yet started).
    InProgress,
    /// Committed.
    Committed,
    /// Aborted, explicitly or by crashing.
    Aborted,
}

impl TxnStatus {
    /// Returns true if the transaction has ended.
    pub fn is_ended(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

/// A running transaction: its id and the snapshot it reads with.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Transaction id.
    pub xid: TxnId,
    /// Snapshot taken at begin.
    pub snapshot: Snapshot,
}

/// Transaction and snapshot service used by the engine.
pub trait TransactionService: Send + Sync {
    /// Starts a transaction.
    fn begin(&self) -> TxnResult<Transaction>;

    /// Commits a running transaction.
    fn commit(&self, xid: TxnId) -> TxnResult<()>;

    /// Aborts a running transaction.
    fn abort(&self, xid: TxnId) -> TxnResult<()>;

    /// Returns the status of `xid`.
    fn status(&self, xid: TxnId) -> TxnStatus;

    /// Takes a fresh snapshot not owned by any transaction.
    fn snapshot(&self) -> Snapshot;

    /// Lowest transaction id any running transaction may still consider
    /// uncommitted.
    fn oldest_active(&self) -> TxnId;

    /// Returns true if `xid` committed and every running snapshot sees it.
    fn is_visible_to_all(&self, xid: TxnId) -> bool {
        self.status(xid) == TxnStatus::Committed && xid < self.oldest_active()
    }
}

/// Statistics about the transaction manager.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Total transactions started.
    pub started: AtomicU64,
    /// Total transactions committed.
    pub committed: AtomicU64,
    /// Total transactions aborted.
    pub aborted: AtomicU64,
}

impl TransactionStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

struct State {
    next_xid: TxnId,
    /// Running transactions and the xmin of their snapshots.
    active: BTreeMap<TxnId, TxnId>,
    /// Outcomes of ended transactions.
    ended: HashMap<TxnId, TxnStatus>,
}

/// In-memory transaction manager.
pub struct TxnManager {
    state: RwLock<State>,
    log: Option<Arc<dyn LogSink>>,
    stats: TransactionStats,
}

impl TxnManager {
    /// Creates a manager that does not log outcomes.
    pub fn new() -> Self {
        Self::build(TxnId::MIN, HashMap::new(), None)
    }

    /// Creates a manager that logs commit and abort records to `log`.
    pub fn with_log(log: Arc<dyn LogSink>) -> Self {
        Self::build(TxnId::MIN, HashMap::new(), Some(log))
    }

    /// Rebuilds transaction outcomes from `log`.
    ///
    /// Transactions that appear in the log without a commit record are
    /// treated as aborted.
    pub fn recover(log: Arc<dyn LogSink>) -> TxnResult<Self> {
        let records = log
            .records_from(Lsn::FIRST)
            .map_err(|e| TransactionError::Log(e.to_string()))?;

        let mut ended = HashMap::new();
        let mut max_xid = TxnId::INVALID;
        let mut seen = BTreeSet::new();
        for record in &records {
            let xid = record.txn_id();
            if xid.is_valid() {
                seen.insert(xid);
                max_xid = max_xid.max(xid);
            }
            match &record.payload {
                WalPayload::Commit => {
                    ended.insert(xid, TxnStatus::Committed);
                }
                WalPayload::Abort => {
                    ended.insert(xid, TxnStatus::Aborted);
                }
                WalPayload::Checkpoint { next_xid, .. } => {
                    if next_xid.is_valid() {
                        max_xid = max_xid.max(TxnId::new(next_xid.as_u64() - 1));
                    }
                }
                WalPayload::PageOps(_) => {}
            }
        }

        let mut crashed = 0usize;
        for xid in seen {
            if !ended.contains_key(&xid) {
                ended.insert(xid, TxnStatus::Aborted);
                crashed += 1;
            }
        }

        let next_xid = max_xid.next().max(TxnId::MIN);
        info!(
            records = records.len(),
            next_xid = %next_xid,
            crashed,
            "recovered transaction state"
        );
        Ok(Self::build(next_xid, ended, Some(log)))
    }

    fn build(
        next_xid: TxnId,
        ended: HashMap<TxnId, TxnStatus>,
        log: Option<Arc<dyn LogSink>>,
    ) -> Self {
        Self {
            state: RwLock::new(State {
                next_xid,
                active: BTreeMap::new(),
                ended,
            }),
            log,
            stats: TransactionStats::new(),
        }
    }

    /// Returns the number of running transactions.
    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    /// Returns the next transaction id that `begin` will assign.
    pub fn next_xid(&self) -> TxnId {
        self.state.read().next_xid
    }

    /// Returns statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    fn log_outcome(&self, xid: TxnId, payload: WalPayload) -> TxnResult<()> {
        if let Some(log) = &self.log {
            log.append(xid, &payload)
                .map_err(|e| TransactionError::Log(e.to_string()))?;
        }
        Ok(())
    }

    fn finish(&self, xid: TxnId, status: TxnStatus) -> TxnResult<()> {
        let mut state = self.state.write();
        if state.active.remove(&xid).is_none() {
            return match state.ended.get(&xid) {
                Some(current) => Err(TransactionError::NotActive {
                    txn_id: xid,
                    status: *current,
                }),
                None => Err(TransactionError::NotFound(xid)),
            };
        }
        state.ended.insert(xid, status);
        Ok(())
    }

    fn ensure_active(&self, xid: TxnId) -> TxnResult<()> {
        let state = self.state.read();
        if state.active.contains_key(&xid) {
            return Ok(());
        }
        match state.ended.get(&xid) {
            Some(status) => Err(TransactionError::NotActive {
                txn_id: xid,
                status: *status,
            }),
            None => Err(TransactionError::NotFound(xid)),
        }
    }
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TxnManager")
            .field("next_xid", &state.next_xid)
            .field("active", &state.active.len())
            .field("logged", &self.log.is_some())
            .finish()
    }
}

impl TransactionService for TxnManager {
    fn begin(&self) -> TxnResult<Transaction> {
        let mut state = self.state.write();
        let xid = state.next_xid;
        state.next_xid = xid.next();
        let running: BTreeSet<TxnId> = state.active.keys().copied().collect();
        let snapshot = Snapshot::new(xid, xid, running);
        state.active.insert(xid, snapshot.xmin);
        drop(state);

        self.stats.started.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(xid = %xid, "begin transaction");
        Ok(Transaction { xid, snapshot })
    }

    fn commit(&self, xid: TxnId) -> TxnResult<()> {
        self.ensure_active(xid)?;
        self.log_outcome(xid, WalPayload::Commit)?;
        self.finish(xid, TxnStatus::Committed)?;
        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(xid = %xid, "commit transaction");
        Ok(())
    }

    fn abort(&self, xid: TxnId) -> TxnResult<()> {
        self.ensure_active(xid)?;
        if let Err(err) = self.log_outcome(xid, WalPayload::Abort) {
            // Unfinished transactions recover as aborted anyway.
            warn!(xid = %xid, error = %err, "abort record not logged");
        }
        self.finish(xid, TxnStatus::Aborted)?;
        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(xid = %xid, "abort transaction");
        Ok(())
    }

    fn status(&self, xid: TxnId) -> TxnStatus {
        let state = self.state.read();
        if state.active.contains_key(&xid) || xid >= state.next_xid {
            return TxnStatus::InProgress;
        }
        state.ended.get(&xid).copied().unwrap_or(TxnStatus::Aborted)
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let running: BTreeSet<TxnId> = state.active.keys().copied().collect();
        Snapshot::new(TxnId::INVALID, state.next_xid, running)
    }

    fn oldest_active(&self) -> TxnId {
        let state = self.state.read();
        state
            .active
            .iter()
            .map(|(xid, xmin)| (*xid).min(*xmin))
            .min()
            .unwrap_or(state.next_xid)
    }
}
