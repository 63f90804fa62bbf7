use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::BoxFuture;
use jobhost_core::JobId;
use tokio::{sync::broadcast, task::AbortHandle};

use crate::error::{JobError, Result};

const EVENT_CAPACITY: usize = 1024;

/// Opaque handle to a supervisor run by a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SupervisorRef {
    id: u64,
    job_id: JobId,
}

impl SupervisorRef {
    pub fn new(id: u64, job_id: JobId) -> Self {
        Self { id, job_id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExitKind {
    /// The supervisor ran to completion.
    Completed,
    /// Killed out-of-band via `kill_supervisor` (or runtime shutdown).
    Killed,
    Panicked,
}

#[derive(Debug, Clone)]
pub struct SupervisorExit {
    pub supervisor: SupervisorRef,
    pub kind: SupervisorExitKind,
}

/// Substrate that runs one supervisor per job and reports when it goes away.
pub trait Dispatcher: Send + Sync + 'static {
    fn run_supervisor(&self, job_id: &JobId, work: BoxFuture<'static, ()>) -> Result<SupervisorRef>;

    /// Terminate a supervisor without letting it clean up.
    fn kill_supervisor(&self, supervisor: &SupervisorRef, allow_restart: bool);

    fn is_alive(&self, supervisor: &SupervisorRef) -> bool;

    /// Every supervisor exit, including normal completion.
    fn subscribe(&self) -> broadcast::Receiver<SupervisorExit>;
}

/// Runs supervisors as tokio tasks in the current process.
#[derive(Clone)]
pub struct LocalDispatcher {
    next_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    events: broadcast::Sender<SupervisorExit>,
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDispatcher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn running(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Dispatcher for LocalDispatcher {
    fn run_supervisor(&self, job_id: &JobId, work: BoxFuture<'static, ()>) -> Result<SupervisorRef> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| JobError::Dispatch(format!("no tokio runtime: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let supervisor = SupervisorRef::new(id, job_id.clone());

        // Hold the table lock across spawn + insert so the watcher below can
        // never remove the entry before it exists.
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = runtime.spawn(work);
        tasks.insert(id, handle.abort_handle());
        drop(tasks);

        let table = self.tasks.clone();
        let events = self.events.clone();
        let watched = supervisor.clone();
        runtime.spawn(async move {
            let kind = match handle.await {
                Ok(()) => SupervisorExitKind::Completed,
                Err(e) if e.is_panic() => SupervisorExitKind::Panicked,
                Err(_) => SupervisorExitKind::Killed,
            };
            table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&watched.id);
            if kind != SupervisorExitKind::Completed {
                tracing::warn!(job_id = %watched.job_id, supervisor = watched.id, ?kind, "job supervisor exited abnormally");
            }
            // No subscribers is fine.
            let _ = events.send(SupervisorExit {
                supervisor: watched,
                kind,
            });
        });

        Ok(supervisor)
    }

    fn kill_supervisor(&self, supervisor: &SupervisorRef, allow_restart: bool) {
        if allow_restart {
            tracing::warn!(job_id = %supervisor.job_id, "local dispatcher never restarts supervisors; killing only");
        }
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = tasks.get(&supervisor.id) {
            tracing::info!(job_id = %supervisor.job_id, supervisor = supervisor.id, "killing job supervisor");
            h.abort();
        }
    }

    fn is_alive(&self, supervisor: &SupervisorRef) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&supervisor.id)
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorExit> {
        self.events.subscribe()
    }
}
