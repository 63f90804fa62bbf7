use std::{collections::BTreeMap, sync::Arc, time::Duration};

use jobhost_core::{EnvironmentSpec, JobId, JobStatus};
use tokio::sync::watch;

use crate::barrier::StartBarrier;
use crate::error::JobError;
use crate::log_sink::LogSink;
use crate::materializer::{JOB_CONFIG_FILE, MaterializedEnv, Materializer};
use crate::process_runner::{ExitOutcome, ProcessHandle, ProcessRunner};
use crate::registry::JobRegistry;

/// Set to the job id in every job's environment.
pub const JOB_ID_ENV_VAR: &str = "JOBHOST_JOB_ID";
/// JSON object of the job's metadata, always including [`JOB_ID_METADATA_KEY`].
pub const JOB_METADATA_ENV_VAR: &str = "JOBHOST_JOB_METADATA";
pub const JOB_ID_METADATA_KEY: &str = "job_id";

/// Shared, read-only collaborators of every supervisor.
pub(crate) struct SupervisorContext {
    pub(crate) registry: JobRegistry,
    pub(crate) materializer: Arc<dyn Materializer>,
    pub(crate) runner: ProcessRunner,
    pub(crate) stop_grace: Duration,
    pub(crate) pending_timeout: Option<Duration>,
}

/// Terminal decision of one supervisor run.
#[derive(Debug, PartialEq, Eq)]
struct Finish {
    status: JobStatus,
    message: Option<String>,
}

impl Finish {
    fn stopped() -> Self {
        Self {
            status: JobStatus::Stopped,
            message: Some("stopped".to_string()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            message: Some(message.into()),
        }
    }
}

enum Waited {
    Exited(std::io::Result<ExitOutcome>),
    StopRequested,
}

/// Owns one job from the start barrier to its terminal status.
pub(crate) struct JobSupervisor {
    ctx: Arc<SupervisorContext>,
    job_id: JobId,
    entrypoint: String,
    spec: EnvironmentSpec,
    barrier: Option<StartBarrier>,
    log: LogSink,
    stop_rx: watch::Receiver<bool>,
}

impl JobSupervisor {
    pub(crate) fn new(
        ctx: Arc<SupervisorContext>,
        job_id: JobId,
        entrypoint: String,
        spec: EnvironmentSpec,
        barrier: Option<StartBarrier>,
        log: LogSink,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            job_id,
            entrypoint,
            spec,
            barrier,
            log,
            stop_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut guard = ExitGuard::new(self.ctx.registry.clone(), self.job_id.clone());
        let finish = self.drive().await;

        tracing::info!(
            job_id = %self.job_id,
            status = %finish.status,
            message = finish.message.as_deref().unwrap_or(""),
            "job finished"
        );
        if let Err(err) = self
            .ctx
            .registry
            .update_status(&self.job_id, finish.status, finish.message)
            .await
        {
            // Someone else finalized the record; never overwrite it.
            tracing::error!(job_id = %self.job_id, error = %err, "final status write rejected");
        }

        self.log.close();
        let _ = self.ctx.registry.clear_supervisor_ref(&self.job_id).await;
        guard.disarm();
    }

    async fn drive(&mut self) -> Finish {
        if let Some(barrier) = self.barrier.take() {
            tracing::debug!(job_id = %self.job_id, "waiting for start barrier");
            let pending_timeout = self.ctx.pending_timeout;
            let released = tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop_rx) => return Finish::stopped(),
                released = wait_for_barrier(&barrier, pending_timeout) => released,
            };
            if !released {
                let ms = pending_timeout.map(|d| d.as_millis()).unwrap_or_default();
                return Finish::failed(format!("start barrier not released within {ms}ms"));
            }
        }

        let materialized = tokio::select! {
            biased;
            _ = wait_for_stop(&mut self.stop_rx) => return Finish::stopped(),
            res = self.ctx.materializer.materialize(&self.job_id, &self.spec) => res,
        };
        let env = match materialized {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "environment setup failed");
                return Finish::failed(err.to_string());
            }
        };

        let (env_vars, warnings) = build_process_env(&self.job_id, &self.spec.metadata, &env);
        for w in &warnings {
            self.log.append_line(w);
        }

        // Spawn and the RUNNING write share the record lock with
        // `request_stop`, so a stop accepted while PENDING always wins.
        let runner = self.ctx.runner;
        let launched = self
            .ctx
            .registry
            .launch_unless_stopped(&self.job_id, || {
                let handle =
                    runner.start(&self.entrypoint, &env.working_dir, &env_vars, self.log.clone())?;
                let pid = handle.pid();
                Ok((handle, pid))
            })
            .await;
        let handle = match launched {
            Ok(Some(handle)) => handle,
            Ok(None) => return Finish::stopped(),
            Err(err @ JobError::Spawn(_)) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "entrypoint launch failed");
                return Finish::failed(err.to_string());
            }
            Err(err) => {
                tracing::error!(job_id = %self.job_id, error = %err, "cannot mark job running");
                return Finish::failed(err.to_string());
            }
        };
        tracing::info!(
            job_id = %self.job_id,
            pid = handle.pid(),
            cwd = %env.working_dir.display(),
            "job started"
        );

        self.monitor(handle).await
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn monitor(&mut self, mut handle: ProcessHandle) -> Finish {
        let waited = tokio::select! {
            res = handle.wait() => Waited::Exited(res),
            _ = wait_for_stop(&mut self.stop_rx) => Waited::StopRequested,
        };

        match waited {
            Waited::StopRequested => self.stop_running(handle).await,
            Waited::Exited(Err(err)) => Finish::failed(format!("wait failed: {err}")),
            Waited::Exited(Ok(outcome)) => {
                let _ = self
                    .ctx
                    .registry
                    .set_exit_code(&self.job_id, outcome.code())
                    .await;
                // A stop that raced with a natural exit still wins.
                if self.stop_requested() {
                    return Finish::stopped();
                }
                if outcome.success() {
                    Finish {
                        status: JobStatus::Succeeded,
                        message: None,
                    }
                } else {
                    let msg = self.log.last_line().unwrap_or_else(|| outcome.describe());
                    Finish::failed(msg)
                }
            }
        }
    }

    /// SIGTERM, bounded grace, then SIGKILL; returns once the leader is reaped.
    async fn stop_running(&mut self, mut handle: ProcessHandle) -> Finish {
        let pid = handle.pid();
        tracing::info!(job_id = %self.job_id, pid, grace_ms = self.ctx.stop_grace.as_millis() as u64, "stopping job");

        if let Err(err) = handle.terminate() {
            tracing::warn!(job_id = %self.job_id, pid, error = %err, "SIGTERM failed");
        }

        let res = match tokio::time::timeout(self.ctx.stop_grace, handle.wait()).await {
            Ok(res) => res,
            Err(_) => {
                tracing::info!(job_id = %self.job_id, pid, "grace period elapsed; sending SIGKILL");
                if let Err(err) = handle.kill() {
                    tracing::warn!(job_id = %self.job_id, pid, error = %err, "SIGKILL failed");
                }
                handle.wait().await
            }
        };

        match res {
            Ok(outcome) => {
                let _ = self
                    .ctx
                    .registry
                    .set_exit_code(&self.job_id, outcome.code())
                    .await;
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, pid, error = %err, "wait after stop failed");
            }
        }
        Finish::stopped()
    }
}

/// Fails the job and clears its supervisor ref when the supervisor future is
/// dropped before `run` completes, whether aborted or unwinding from a panic.
/// The job's process group dies with its `ProcessHandle`.
struct ExitGuard {
    registry: JobRegistry,
    job_id: JobId,
    armed: bool,
}

impl ExitGuard {
    fn new(registry: JobRegistry, job_id: JobId) -> Self {
        Self {
            registry,
            job_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // No runtime left means the whole agent is going away.
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let job_id = self.job_id.clone();
        rt.spawn(async move {
            let message =
                JobError::SupervisorLost("supervisor ended before recording a final status".into())
                    .to_string();
            if let Ok(Some(_)) = registry.fail_if_active(&job_id, &message).await {
                tracing::warn!(job_id = %job_id, "supervisor dropped mid-run; job marked failed");
            }
            let _ = registry.clear_supervisor_ref(&job_id).await;
        });
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Record gone: nobody can ask for a stop any more.
        std::future::pending::<()>().await;
    }
}

async fn wait_for_barrier(barrier: &StartBarrier, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(t) => tokio::time::timeout(t, barrier.wait()).await.is_ok(),
        None => {
            barrier.wait().await;
            true
        }
    }
}

/// Variables applied on top of the agent's environment, plus warning lines
/// for settings the job would otherwise lose silently.
///
/// Precedence: working-dir config < submitted env vars < injected variables.
pub(crate) fn build_process_env(
    job_id: &JobId,
    metadata: &BTreeMap<String, String>,
    env: &MaterializedEnv,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut out = env.config_env.clone();
    let mut warnings = Vec::new();

    for (k, v) in &env.env_vars {
        if env.config_env.contains_key(k) {
            warnings.push(format!(
                "Both {JOB_CONFIG_FILE} [env] and submitted env_vars set {k}; using the submitted value"
            ));
        }
        out.insert(k.clone(), v.clone());
    }

    let mut meta = metadata.clone();
    meta.insert(JOB_ID_METADATA_KEY.to_string(), job_id.to_string());
    let meta_json = serde_json::to_string(&meta).unwrap_or_else(|_| "{}".to_string());

    for (k, v) in [
        (JOB_ID_ENV_VAR, job_id.to_string()),
        (JOB_METADATA_ENV_VAR, meta_json),
    ] {
        if env.env_vars.contains_key(k) || env.config_env.contains_key(k) {
            warnings.push(format!(
                "{k} is reserved and set by the agent; ignoring the configured value"
            ));
        }
        out.insert(k.to_string(), v);
    }

    (out, warnings)
}
