use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use jobhost_core::{EnvironmentSpec, JobId, JobInfo, JobStatus};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::barrier::StartBarrier;
use crate::config::{AgentConfig, LogFileLimits};
use crate::dispatcher::{Dispatcher, LocalDispatcher, SupervisorExit, SupervisorExitKind, SupervisorRef};
use crate::error::{JobError, Result};
use crate::log_sink::{LogSink, job_log_path};
use crate::materializer::{LocalMaterializer, Materializer, validate_environment};
use crate::process_runner::{ProcessRunner, kill_group};
use crate::registry::{JobRegistry, NewJob, Reconciled};
use crate::supervisor::{JobSupervisor, SupervisorContext};

const MAX_JOB_ID_LEN: usize = 128;
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Optional submission parameters.
#[derive(Debug, Default, Clone)]
pub struct SubmitOptions {
    /// Generated (UUIDv4) when absent.
    pub job_id: Option<JobId>,
    pub environment: Option<EnvironmentSpec>,
    /// Merged over `environment.metadata`.
    pub metadata: BTreeMap<String, String>,
    /// Holds the job in PENDING until released.
    pub start_barrier: Option<StartBarrier>,
}

impl SubmitOptions {
    pub fn with_job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentSpec) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_start_barrier(mut self, barrier: StartBarrier) -> Self {
        self.start_barrier = Some(barrier);
        self
    }
}

/// A slice of a job's output for incremental readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Vec<u8>,
    pub next_offset: u64,
    /// The job is terminal and `next_offset` is the end of its output.
    pub finished: bool,
}

struct ManagerInner {
    registry: JobRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    ctx: Arc<SupervisorContext>,
    log_dir: Option<PathBuf>,
    log_file_limits: LogFileLimits,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(task) = self.reconciler.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Public entry point: submission, queries, stop, and reconciliation of jobs
/// whose supervisor died.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").finish_non_exhaustive()
    }
}

impl JobManager {
    /// Manager backed by the in-process dispatcher and local materializer.
    pub fn new(config: AgentConfig) -> Self {
        let materializer = Arc::new(LocalMaterializer::new(
            config.data_root.clone(),
            config.download_timeout,
        ));
        Self::with_parts(config, Arc::new(LocalDispatcher::new()), materializer)
    }

    pub fn with_parts(
        config: AgentConfig,
        dispatcher: Arc<dyn Dispatcher>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        let registry = JobRegistry::new();
        let ctx = Arc::new(SupervisorContext {
            registry: registry.clone(),
            materializer,
            runner: ProcessRunner::new(config.output_drain_timeout),
            stop_grace: config.stop_grace,
            pending_timeout: config.pending_timeout,
        });

        // Subscribe before anything can be dispatched so no exit is missed.
        let events = dispatcher.subscribe();
        let reconciler = tokio::spawn(reconcile_loop(
            registry.clone(),
            dispatcher.clone(),
            events,
            config.reconcile_interval,
        ));

        Self {
            inner: Arc::new(ManagerInner {
                registry,
                dispatcher,
                ctx,
                log_dir: config.log_dir,
                log_file_limits: config.log_file_limits,
                reconciler: Mutex::new(Some(reconciler)),
            }),
        }
    }

    pub async fn submit(&self, entrypoint: &str, options: SubmitOptions) -> Result<JobId> {
        if entrypoint.trim().is_empty() {
            return Err(JobError::InvalidInput("entrypoint must not be empty".into()));
        }
        let job_id = match options.job_id {
            Some(id) => {
                validate_job_id(&id)?;
                id
            }
            None => JobId::new(),
        };
        let mut environment = options.environment.unwrap_or_default();
        environment.metadata.extend(options.metadata);
        validate_environment(&environment)?;

        let inner = &self.inner;
        // Checked up front so a rejected duplicate never touches the
        // existing job's mirrored log file. `create` still decides races.
        if inner.registry.get(&job_id).await.is_ok() {
            return Err(JobError::DuplicateJob(job_id));
        }
        let log = self.open_log(&job_id);

        inner
            .registry
            .create(
                &job_id,
                NewJob {
                    entrypoint: entrypoint.to_string(),
                    environment: environment.clone(),
                    log: log.clone(),
                },
            )
            .await?;
        let stop_rx = inner.registry.stop_receiver(&job_id).await?;

        let supervisor = JobSupervisor::new(
            inner.ctx.clone(),
            job_id.clone(),
            entrypoint.to_string(),
            environment,
            options.start_barrier,
            log.clone(),
            stop_rx,
        );

        match inner.dispatcher.run_supervisor(&job_id, Box::pin(supervisor.run())) {
            Ok(sref) => {
                // Refused (harmlessly) when the job already finished.
                let _ = inner.registry.set_supervisor_ref(&job_id, sref).await;
                tracing::info!(job_id = %job_id, "job submitted");
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "supervisor dispatch failed");
                let _ = inner.registry.fail_if_active(&job_id, &err.to_string()).await;
                log.close();
            }
        }

        Ok(job_id)
    }

    fn open_log(&self, job_id: &JobId) -> LogSink {
        let Some(dir) = self.inner.log_dir.as_ref() else {
            return LogSink::in_memory();
        };
        LogSink::with_file(job_log_path(dir, job_id.as_str()), self.inner.log_file_limits)
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobStatus> {
        self.inner.registry.status(id).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<JobInfo> {
        self.inner.registry.get(id).await
    }

    /// Every job, oldest first.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.inner.registry.list().await
    }

    /// Everything the job has written so far. Empty before the first byte.
    pub async fn get_logs(&self, id: &JobId) -> Result<String> {
        Ok(self.inner.registry.log_sink(id).await?.read_to_string())
    }

    pub async fn tail_logs(&self, id: &JobId, offset: u64, limit: usize) -> Result<LogChunk> {
        // Status first: once terminal, the sink has already received all output.
        let terminal = self.inner.registry.status(id).await?.is_terminal();
        let sink = self.inner.registry.log_sink(id).await?;
        let (data, next_offset) = sink.read_from(offset, limit);
        Ok(LogChunk {
            finished: terminal && next_offset >= sink.len(),
            data,
            next_offset,
        })
    }

    /// Requests a stop. `true` only for the first request against a job that
    /// was not yet terminal; the job reaches STOPPED asynchronously.
    pub async fn stop(&self, id: &JobId) -> bool {
        let inner = &self.inner;
        if !inner.registry.request_stop(id).await {
            return false;
        }
        tracing::info!(job_id = %id, "stop requested");

        // No ref yet means dispatch is still in flight; the supervisor will
        // see the flag as soon as it starts.
        if let Ok(Some(sref)) = inner.registry.supervisor_ref(id).await
            && !inner.dispatcher.is_alive(&sref)
        {
            reconcile_lost(&inner.registry, id, "supervisor gone when stop was requested").await;
        }
        true
    }

    /// Kills the job's supervisor out-of-band, without letting it clean up.
    /// Returns `false` if the job has no live supervisor.
    pub async fn kill_supervisor(&self, id: &JobId, allow_restart: bool) -> Result<bool> {
        let Some(sref) = self.inner.registry.supervisor_ref(id).await? else {
            return Ok(false);
        };
        if !self.inner.dispatcher.is_alive(&sref) {
            return Ok(false);
        }
        self.inner.dispatcher.kill_supervisor(&sref, allow_restart);
        Ok(true)
    }

    pub async fn supervisor_ref(&self, id: &JobId) -> Result<Option<SupervisorRef>> {
        self.inner.registry.supervisor_ref(id).await
    }

    pub async fn active_jobs(&self) -> usize {
        self.inner.registry.active().await.len()
    }

    /// Stops every live job and waits (bounded) until they are all terminal.
    pub async fn shutdown(&self) {
        let active = self.inner.registry.active().await;
        if !active.is_empty() {
            tracing::info!(jobs = active.len(), "stopping live jobs");
        }
        for (id, _) in &active {
            self.stop(id).await;
        }

        let deadline = self.inner.ctx.stop_grace * 2 + SHUTDOWN_SLACK;
        let drained = tokio::time::timeout(deadline, async {
            while !self.inner.registry.active().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = self.inner.registry.active().await.len(),
                "jobs still live at shutdown deadline"
            );
        }

        if let Some(task) = self
            .inner
            .reconciler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn validate_job_id(id: &JobId) -> Result<()> {
    let s = id.as_str();
    if s.is_empty() {
        return Err(JobError::InvalidInput("job_id must not be empty".into()));
    }
    if s.len() > MAX_JOB_ID_LEN {
        return Err(JobError::InvalidInput(format!(
            "job_id longer than {MAX_JOB_ID_LEN} bytes"
        )));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(JobError::InvalidInput(format!(
            "job_id {s:?} may only contain [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

/// Forces FAILED on a job whose supervisor is gone, then clears out its
/// process group in case the supervisor could not.
async fn reconcile_lost(registry: &JobRegistry, id: &JobId, reason: &str) {
    let message = JobError::SupervisorLost(reason.to_string()).to_string();
    match registry.fail_if_active(id, &message).await {
        Ok(Some(Reconciled { pid })) => {
            tracing::warn!(job_id = %id, reason, "job marked failed after supervisor loss");
            if let Some(pid) = pid
                && let Err(err) = kill_group(pid)
            {
                tracing::warn!(job_id = %id, pid, error = %err, "failed to kill orphaned process group");
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(job_id = %id, error = %err, "reconciliation write failed");
        }
    }
}

fn exit_reason(kind: SupervisorExitKind) -> &'static str {
    match kind {
        SupervisorExitKind::Completed => "supervisor exited without a terminal status",
        SupervisorExitKind::Killed => "supervisor was killed",
        SupervisorExitKind::Panicked => "supervisor panicked",
    }
}

async fn sweep(registry: &JobRegistry, dispatcher: &Arc<dyn Dispatcher>) {
    for (id, sref) in registry.active().await {
        // Jobs without a ref are still being dispatched.
        let Some(sref) = sref else { continue };
        if !dispatcher.is_alive(&sref) {
            reconcile_lost(registry, &id, "supervisor no longer running").await;
        }
    }
}

async fn reconcile_loop(
    registry: JobRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    mut events: broadcast::Receiver<SupervisorExit>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(exit) => {
                    reconcile_lost(&registry, exit.supervisor.job_id(), exit_reason(exit.kind)).await;
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "supervisor exit events lagged; sweeping");
                    sweep(&registry, &dispatcher).await;
                }
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => sweep(&registry, &dispatcher).await,
        }
    }
}
