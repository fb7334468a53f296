//! Background tasks.
//!
//! Maintenance runs on a worker started through a [`TaskLauncher`]. A dump
//! that raises its TapeSet to the merge trigger level wakes the worker,
//! which merges and then vacuums, backing off while a transaction it
//! depends on is still running. The [`WorkerGuard`] owned by the heap stops
//! and joins the worker when the heap is dropped.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sortheap_common::types::RelationId;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::heap::HeapCore;

/// Work handed to a launcher.
pub type Task = Box<dyn FnOnce() -> EngineResult<()> + Send + 'static>;

/// Starts detached tasks on behalf of a relation.
pub trait TaskLauncher: Send + Sync + fmt::Debug {
    /// Starts `task`; `name` identifies it in logs.
    fn launch(&self, relation: RelationId, name: &str, task: Task) -> EngineResult<TaskHandle>;
}

/// Runs every task on its own OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl TaskLauncher for ThreadLauncher {
    fn launch(&self, relation: RelationId, name: &str, task: Task) -> EngineResult<TaskHandle> {
        let join = thread::Builder::new()
            .name(format!("sortheap-{name}-{}", relation.as_u32()))
            .spawn(task)
            .map_err(|err| EngineError::Worker {
                message: format!("failed to spawn {name}: {err}"),
            })?;
        debug!(%relation, task = name, "launched task");
        Ok(TaskHandle {
            relation,
            name: name.to_string(),
            join: Some(join),
        })
    }
}

/// Handle to a launched task. Dropping it detaches the task.
pub struct TaskHandle {
    relation: RelationId,
    name: String,
    join: Option<JoinHandle<EngineResult<()>>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("relation", &self.relation)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl TaskHandle {
    /// Relation the task works on.
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// Returns true once the task has returned.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the task and returns its result.
    pub fn wait(mut self) -> EngineResult<()> {
        self.join_task()
    }

    /// Lets the task run on without anyone waiting for it.
    pub fn detach(mut self) {
        self.join.take();
    }

    fn join_task(&mut self) -> EngineResult<()> {
        match self.join.take() {
            None => Ok(()),
            Some(join) => join.join().unwrap_or_else(|_| {
                Err(EngineError::Worker {
                    message: format!("task {} panicked", self.name),
                })
            }),
        }
    }
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    stopped: bool,
}

/// Why a waiting worker woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Work,
    Idle,
    Stop,
}

/// Wakes the maintenance worker.
#[derive(Debug, Default)]
pub(crate) struct MaintenanceSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl MaintenanceSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        self.state.lock().pending = true;
        self.cond.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.pending && !state.stopped {
            self.cond.wait_for(&mut state, timeout);
        }
        if state.stopped {
            Wake::Stop
        } else if std::mem::take(&mut state.pending) {
            Wake::Work
        } else {
            Wake::Idle
        }
    }
}

/// Stops and joins the maintenance worker when dropped.
pub struct WorkerGuard {
    signal: Arc<MaintenanceSignal>,
    handle: Option<TaskHandle>,
}

impl fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl WorkerGuard {
    /// Stops the worker and returns its result.
    pub fn stop(mut self) -> EngineResult<()> {
        self.signal.stop();
        match self.handle.take() {
            Some(handle) => handle.wait(),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.wait() {
                warn!(error = %err, "maintenance worker failed");
            }
        }
    }
}

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Starts the maintenance worker of `core`.
pub(crate) fn spawn_maintenance(
    core: Arc<HeapCore>,
    launcher: &dyn TaskLauncher,
) -> EngineResult<WorkerGuard> {
    let signal = Arc::clone(&core.signal);
    let task_signal = Arc::clone(&signal);
    let relation = core.relation;
    let handle = launcher.launch(
        relation,
        "maintenance",
        Box::new(move || {
            maintenance_loop(&core, &task_signal);
            Ok(())
        }),
    )?;
    Ok(WorkerGuard {
        signal,
        handle: Some(handle),
    })
}

fn maintenance_loop(core: &HeapCore, signal: &MaintenanceSignal) {
    let policy = core.config.retry.clone();
    let mut retrying = 0u32;
    info!(relation = %core.relation, "maintenance worker started");
    loop {
        let timeout = if retrying == 0 {
            IDLE_WAIT
        } else {
            policy.backoff(retrying)
        };
        match signal.wait(timeout) {
            Wake::Stop => break,
            Wake::Idle if retrying == 0 => continue,
            Wake::Work | Wake::Idle => {}
        }
        match core.maintain() {
            Ok(false) => retrying = 0,
            Ok(true) => retrying += 1,
            Err(err) if err.is_retryable() => {
                debug!(relation = %core.relation, error = %err, attempt = retrying, "maintenance retry");
                retrying += 1;
            }
            Err(err) => {
                error!(relation = %core.relation, error = %err, "maintenance failed");
                retrying = 0;
            }
        }
        if retrying >= policy.max_attempts {
            warn!(
                relation = %core.relation,
                attempts = retrying,
                "maintenance still blocked, waiting for the next dump"
            );
            retrying = 0;
        }
    }
    info!(relation = %core.relation, "maintenance worker stopped");
}
