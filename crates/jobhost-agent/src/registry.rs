use std::{collections::HashMap, sync::Arc};

use jobhost_core::{EnvironmentSpec, JobId, JobInfo, JobStatus};
use tokio::sync::{Mutex, RwLock, watch};

use crate::dispatcher::SupervisorRef;
use crate::error::{JobError, Result};
use crate::log_sink::LogSink;

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fields a record starts with; everything else is filled in by the lifecycle.
#[derive(Debug)]
pub struct NewJob {
    pub entrypoint: String,
    pub environment: EnvironmentSpec,
    pub log: LogSink,
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    entrypoint: String,
    environment: EnvironmentSpec,
    message: Option<String>,
    supervisor: Option<SupervisorRef>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    created_at_unix_ms: u64,
    started_at_unix_ms: Option<u64>,
    finished_at_unix_ms: Option<u64>,
    stop_requested: bool,
    stop_tx: watch::Sender<bool>,
    log: LogSink,
}

impl JobEntry {
    fn info(&self, id: &JobId) -> JobInfo {
        JobInfo {
            id: id.clone(),
            status: self.status,
            entrypoint: self.entrypoint.clone(),
            environment: self.environment.clone(),
            message: self.message.clone(),
            pid: self.pid,
            exit_code: self.exit_code,
            created_at_unix_ms: self.created_at_unix_ms,
            started_at_unix_ms: self.started_at_unix_ms,
            finished_at_unix_ms: self.finished_at_unix_ms,
        }
    }

    fn transition(&mut self, id: &JobId, to: JobStatus, message: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if message.is_some() {
            self.message = message;
        }
        let now = now_unix_ms();
        if to == JobStatus::Running {
            self.started_at_unix_ms = Some(now);
        }
        if to.is_terminal() {
            self.finished_at_unix_ms = Some(now);
            self.supervisor = None;
        }
        Ok(())
    }
}

/// Result of a reconciliation write that actually changed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Last known process group leader of the job, if one was launched.
    pub pid: Option<u32>,
}

/// Shared store of every job record, keyed by id.
///
/// The map lock is only held to find or insert an entry; all mutation of a
/// record happens under that record's own lock, so jobs never serialize
/// against each other.
#[derive(Clone, Debug, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<JobId, Arc<Mutex<JobEntry>>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &JobId) -> Result<Arc<Mutex<JobEntry>>> {
        let map = self.inner.read().await;
        map.get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    /// Inserts a PENDING record. Fails without touching the existing record
    /// if `id` is already taken.
    pub async fn create(&self, id: &JobId, job: NewJob) -> Result<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(id) {
            return Err(JobError::DuplicateJob(id.clone()));
        }
        let (stop_tx, _) = watch::channel(false);
        map.insert(
            id.clone(),
            Arc::new(Mutex::new(JobEntry {
                status: JobStatus::Pending,
                entrypoint: job.entrypoint,
                environment: job.environment,
                message: None,
                supervisor: None,
                pid: None,
                exit_code: None,
                created_at_unix_ms: now_unix_ms(),
                started_at_unix_ms: None,
                finished_at_unix_ms: None,
                stop_requested: false,
                stop_tx,
                log: job.log,
            })),
        );
        Ok(())
    }

    pub async fn get(&self, id: &JobId) -> Result<JobInfo> {
        let entry = self.entry(id).await?;
        let e = entry.lock().await;
        Ok(e.info(id))
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        let entry = self.entry(id).await?;
        let status = entry.lock().await.status;
        Ok(status)
    }

    /// Moves a job along the lifecycle. Leaving a terminal state, or skipping
    /// RUNNING on the way to SUCCEEDED, is an `InvalidTransition`.
    pub async fn update_status(
        &self,
        id: &JobId,
        to: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut e = entry.lock().await;
        e.transition(id, to, message)
    }

    /// Force FAILED on a job whose supervisor vanished. No-op when the job is
    /// already terminal.
    pub async fn fail_if_active(&self, id: &JobId, message: &str) -> Result<Option<Reconciled>> {
        let entry = self.entry(id).await?;
        let mut e = entry.lock().await;
        if e.status.is_terminal() {
            return Ok(None);
        }
        e.transition(id, JobStatus::Failed, Some(message.to_string()))?;
        Ok(Some(Reconciled { pid: e.pid }))
    }

    /// Returns `false` (and stores nothing) once the job is terminal.
    pub async fn set_supervisor_ref(&self, id: &JobId, supervisor: SupervisorRef) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut e = entry.lock().await;
        if e.status.is_terminal() {
            return Ok(false);
        }
        e.supervisor = Some(supervisor);
        Ok(true)
    }

    pub async fn clear_supervisor_ref(&self, id: &JobId) -> Result<()> {
        let entry = self.entry(id).await?;
        entry.lock().await.supervisor = None;
        Ok(())
    }

    pub async fn supervisor_ref(&self, id: &JobId) -> Result<Option<SupervisorRef>> {
        let entry = self.entry(id).await?;
        let supervisor = entry.lock().await.supervisor.clone();
        Ok(supervisor)
    }

    /// Runs `launch` and moves the job to RUNNING with the pid it reports,
    /// all under the record lock, so a concurrent `request_stop` lands either
    /// before the launch or after the job is RUNNING.
    ///
    /// Returns `Ok(None)` without calling `launch` when a stop was already
    /// requested; the record is left untouched.
    pub async fn launch_unless_stopped<T>(
        &self,
        id: &JobId,
        launch: impl FnOnce() -> Result<(T, u32)>,
    ) -> Result<Option<T>> {
        let entry = self.entry(id).await?;
        let mut e = entry.lock().await;
        if e.stop_requested {
            return Ok(None);
        }
        if !e.status.can_transition_to(JobStatus::Running) {
            return Err(JobError::InvalidTransition {
                id: id.clone(),
                from: e.status,
                to: JobStatus::Running,
            });
        }
        let (launched, pid) = launch()?;
        e.pid = Some(pid);
        e.transition(id, JobStatus::Running, None)?;
        Ok(Some(launched))
    }

    pub async fn set_exit_code(&self, id: &JobId, code: Option<i32>) -> Result<()> {
        let entry = self.entry(id).await?;
        entry.lock().await.exit_code = code;
        Ok(())
    }

    pub async fn log_sink(&self, id: &JobId) -> Result<LogSink> {
        let entry = self.entry(id).await?;
        let log = entry.lock().await.log.clone();
        Ok(log)
    }

    /// Receiver that flips to `true` once a stop has been requested.
    pub async fn stop_receiver(&self, id: &JobId) -> Result<watch::Receiver<bool>> {
        let entry = self.entry(id).await?;
        let rx = entry.lock().await.stop_tx.subscribe();
        Ok(rx)
    }

    /// Marks a live job as stop-requested and wakes its supervisor.
    ///
    /// Only the first call for a non-terminal job returns `true`; unknown ids,
    /// terminal jobs and repeated requests return `false`.
    pub async fn request_stop(&self, id: &JobId) -> bool {
        let Ok(entry) = self.entry(id).await else {
            return false;
        };
        let mut e = entry.lock().await;
        if e.status.is_terminal() || e.stop_requested {
            return false;
        }
        e.stop_requested = true;
        // `send_replace` stores the value even when no supervisor listens yet.
        e.stop_tx.send_replace(true);
        true
    }

    pub async fn list_ids(&self) -> Vec<JobId> {
        let map = self.inner.read().await;
        let mut ids: Vec<JobId> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list(&self) -> Vec<JobInfo> {
        let entries: Vec<(JobId, Arc<Mutex<JobEntry>>)> = {
            let map = self.inner.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            out.push(entry.lock().await.info(&id));
        }
        out.sort_by(|a, b| {
            a.created_at_unix_ms
                .cmp(&b.created_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Non-terminal jobs with their current supervisor reference.
    pub async fn active(&self) -> Vec<(JobId, Option<SupervisorRef>)> {
        let entries: Vec<(JobId, Arc<Mutex<JobEntry>>)> = {
            let map = self.inner.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = Vec::new();
        for (id, entry) in entries {
            let e = entry.lock().await;
            if !e.status.is_terminal() {
                out.push((id, e.supervisor.clone()));
            }
        }
        out
    }
}
