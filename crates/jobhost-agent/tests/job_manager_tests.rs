use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use jobhost_agent::{
    AgentConfig, JobError, JobManager, StartBarrier, SubmitOptions, process_runner::is_alive,
};
use jobhost_core::{EnvironmentSpec, JobId, JobStatus};

const WAIT: Duration = Duration::from_secs(15);

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jobhost-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(root: &Path) -> AgentConfig {
    AgentConfig {
        data_root: root.join("data"),
        stop_grace: Duration::from_secs(1),
        reconcile_interval: Duration::from_millis(200),
        ..AgentConfig::default()
    }
}

fn manager() -> (JobManager, PathBuf) {
    let root = scratch_dir();
    (JobManager::new(test_config(&root)), root)
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_status(manager: &JobManager, id: &JobId, status: JobStatus) {
    wait_for(&format!("{id} to be {status}"), || async {
        manager.get_status(id).await.ok() == Some(status)
    })
    .await;
}

async fn wait_for_terminal(manager: &JobManager, id: &JobId) -> JobStatus {
    wait_for(&format!("{id} to finish"), || async {
        manager
            .get_status(id)
            .await
            .map(JobStatus::is_terminal)
            .unwrap_or(false)
    })
    .await;
    manager.get_status(id).await.unwrap()
}

async fn read_pid_file(path: &Path) -> u32 {
    wait_for("pid file", || async {
        std::fs::read_to_string(path)
            .map(|s| s.trim().parse::<u32>().is_ok())
            .unwrap_or(false)
    })
    .await;
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

async fn assert_dead(pid: u32) {
    wait_for(&format!("pid {pid} to exit"), || async { !is_alive(pid) }).await;
}

#[tokio::test]
async fn duplicate_job_id_is_rejected() {
    let (manager, _root) = manager();
    let id = manager
        .submit("echo 1", SubmitOptions::default().with_job_id("dup"))
        .await
        .unwrap();
    assert_eq!(id, JobId::from("dup"));

    let err = manager
        .submit("echo 2", SubmitOptions::default().with_job_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::DuplicateJob(_)));

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_job(&id).await.unwrap().entrypoint, "echo 1");
    assert_eq!(manager.get_logs(&id).await.unwrap(), "1\n");
    assert_eq!(manager.list_jobs().await.len(), 1);
}

#[tokio::test]
async fn echo_hello_succeeds() {
    let (manager, _root) = manager();
    let id = manager
        .submit("echo hello", SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "hello\n");

    let info = manager.get_job(&id).await.unwrap();
    assert_eq!(info.exit_code, Some(0));
    assert!(info.started_at_unix_ms.is_some());
    assert!(info.finished_at_unix_ms >= info.started_at_unix_ms);
    assert!(manager.supervisor_ref(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn stderr_is_captured() {
    let (manager, _root) = manager();
    let id = manager
        .submit("echo error 1>&2", SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "error\n");
}

#[tokio::test]
async fn failing_entrypoint_reports_its_error() {
    let (manager, _root) = manager();
    let id = manager
        .submit(
            "echo 'Exception: Script failed with exception !' 1>&2; exit 1",
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Failed);
    let logs = manager.get_logs(&id).await.unwrap();
    assert_eq!(
        logs.trim().lines().last(),
        Some("Exception: Script failed with exception !")
    );

    let info = manager.get_job(&id).await.unwrap();
    assert_eq!(
        info.message.as_deref(),
        Some("Exception: Script failed with exception !")
    );
    assert_eq!(info.exit_code, Some(1));
    assert!(manager.supervisor_ref(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn submitted_env_vars_reach_the_process() {
    let (manager, _root) = manager();
    let env = EnvironmentSpec::default().with_env_var("TEST_SUBPROCESS_JOB_CONFIG_ENV_VAR", "233");
    let id = manager
        .submit(
            "echo $TEST_SUBPROCESS_JOB_CONFIG_ENV_VAR",
            SubmitOptions::default().with_environment(env),
        )
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "233\n");
}

#[tokio::test]
async fn job_id_and_metadata_are_injected() {
    let (manager, _root) = manager();
    let id = manager
        .submit(
            "echo $JOBHOST_JOB_ID; echo $JOBHOST_JOB_METADATA",
            SubmitOptions::default()
                .with_job_id("meta-job")
                .with_metadata("key1", "val1"),
        )
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(
        manager.get_logs(&id).await.unwrap(),
        "meta-job\n{\"job_id\":\"meta-job\",\"key1\":\"val1\"}\n"
    );
}

#[tokio::test]
async fn metadata_always_carries_job_id() {
    let (manager, _root) = manager();
    let id = manager
        .submit("echo $JOBHOST_JOB_METADATA", SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    let logs = manager.get_logs(&id).await.unwrap();
    let meta: serde_json::Value = serde_json::from_str(logs.trim()).unwrap();
    assert_eq!(meta["job_id"], serde_json::Value::String(id.to_string()));
}

#[tokio::test]
async fn working_dir_config_conflict_is_warned() {
    let (manager, root) = manager();
    let work = root.join("work");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(
        work.join("jobhost.toml"),
        "[env]\nMODE = \"config\"\nFROM_CONFIG = \"yes\"\n",
    )
    .unwrap();

    let env = EnvironmentSpec::default()
        .with_working_dir(work.display().to_string())
        .with_env_var("MODE", "submitted");
    let id = manager
        .submit(
            "echo $MODE $FROM_CONFIG",
            SubmitOptions::default().with_environment(env),
        )
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    let logs = manager.get_logs(&id).await.unwrap();
    assert!(
        logs.starts_with("Both jobhost.toml [env] and submitted env_vars set MODE; using the submitted value\n"),
        "{logs}"
    );
    assert!(logs.ends_with("submitted yes\n"), "{logs}");
}

#[tokio::test]
async fn entrypoint_runs_in_working_dir() {
    let (manager, root) = manager();
    let work = root.join("cwd");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("marker.txt"), "found\n").unwrap();

    let env = EnvironmentSpec::default().with_working_dir(work.display().to_string());
    let id = manager
        .submit("cat marker.txt", SubmitOptions::default().with_environment(env))
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "found\n");
}

#[tokio::test]
async fn materialization_failure_fails_without_a_process() {
    let (manager, root) = manager();
    let env = EnvironmentSpec::default()
        .with_working_dir(root.join("path_not_exist").display().to_string());
    let id = manager
        .submit("echo never", SubmitOptions::default().with_environment(env))
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Failed);
    let info = manager.get_job(&id).await.unwrap();
    assert!(info.pid.is_none());
    assert!(info.started_at_unix_ms.is_none());
    assert!(
        info.message.as_deref().unwrap_or("").contains("path_not_exist"),
        "{:?}",
        info.message
    );
    assert_eq!(manager.get_logs(&id).await.unwrap(), "");
}

#[tokio::test]
async fn stop_running_job_kills_the_whole_group() {
    let (manager, root) = manager();
    let pid_file = root.join("child.pid");
    let cmd = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let id = manager.submit(&cmd, SubmitOptions::default()).await.unwrap();

    wait_for_status(&manager, &id, JobStatus::Running).await;
    let leader = manager.get_job(&id).await.unwrap().pid.unwrap();
    let child = read_pid_file(&pid_file).await;
    assert!(is_alive(leader));
    assert!(is_alive(child));

    assert!(manager.stop(&id).await);
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Stopped);
    assert_dead(leader).await;
    assert_dead(child).await;

    assert!(!manager.stop(&id).await);
    assert!(manager.supervisor_ref(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn stop_unknown_job_returns_false() {
    let (manager, _root) = manager();
    assert!(!manager.stop(&JobId::from("fake_job_id")).await);
}

#[tokio::test]
async fn stop_finished_job_returns_false() {
    let (manager, _root) = manager();
    let id = manager.submit("true", SubmitOptions::default()).await.unwrap();
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert!(!manager.stop(&id).await);
    assert_eq!(manager.get_status(&id).await.unwrap(), JobStatus::Succeeded);
}

#[tokio::test]
async fn concurrent_stops_have_exactly_one_winner() {
    let (manager, _root) = manager();
    let id = manager.submit("sleep 30", SubmitOptions::default()).await.unwrap();
    wait_for_status(&manager, &id, JobStatus::Running).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let m = manager.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move { m.stop(&id).await }));
    }
    let mut winners = 0;
    for t in tasks {
        if t.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Stopped);
}

#[tokio::test]
async fn stop_while_pending_never_spawns() {
    let (manager, root) = manager();
    let pid_file = root.join("pending.pid");
    let barrier = StartBarrier::new();
    let cmd = format!("echo $$ > {}", pid_file.display());
    let id = manager
        .submit(
            &cmd,
            SubmitOptions::default().with_start_barrier(barrier.clone()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.get_status(&id).await.unwrap(), JobStatus::Pending);

    assert!(manager.stop(&id).await);
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Stopped);

    // A late release must not resurrect the job.
    barrier.release();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.get_status(&id).await.unwrap(), JobStatus::Stopped);
    assert!(!pid_file.exists());
    let info = manager.get_job(&id).await.unwrap();
    assert!(info.pid.is_none());
    assert!(info.started_at_unix_ms.is_none());
}

#[tokio::test]
async fn released_barrier_lets_job_run() {
    let (manager, _root) = manager();
    let barrier = StartBarrier::new();
    let id = manager
        .submit(
            "echo released",
            SubmitOptions::default().with_start_barrier(barrier.clone()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.get_status(&id).await.unwrap(), JobStatus::Pending);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "");

    barrier.release();
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    assert_eq!(manager.get_logs(&id).await.unwrap(), "released\n");
}

#[tokio::test]
async fn unreleased_barrier_times_out() {
    let root = scratch_dir();
    let config = AgentConfig {
        pending_timeout: Some(Duration::from_millis(200)),
        ..test_config(&root)
    };
    let manager = JobManager::new(config);
    let id = manager
        .submit(
            "echo never",
            SubmitOptions::default().with_start_barrier(StartBarrier::new()),
        )
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Failed);
    let info = manager.get_job(&id).await.unwrap();
    assert!(info.pid.is_none());
    assert!(info.message.unwrap().contains("start barrier"));
}

#[tokio::test]
async fn killed_supervisor_fails_job_and_leaves_no_orphan() {
    let (manager, root) = manager();
    let pid_file = root.join("orphan.pid");
    let cmd = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let id = manager.submit(&cmd, SubmitOptions::default()).await.unwrap();

    wait_for_status(&manager, &id, JobStatus::Running).await;
    let leader = manager.get_job(&id).await.unwrap().pid.unwrap();
    let child = read_pid_file(&pid_file).await;

    assert!(manager.kill_supervisor(&id, false).await.unwrap());
    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Failed);
    let info = manager.get_job(&id).await.unwrap();
    assert!(
        info.message.as_deref().unwrap_or("").contains("supervisor lost"),
        "{:?}",
        info.message
    );
    assert!(manager.supervisor_ref(&id).await.unwrap().is_none());

    assert_dead(leader).await;
    assert_dead(child).await;
    assert!(!manager.stop(&id).await);
}

#[tokio::test]
async fn killed_pending_supervisor_fails_job() {
    let (manager, root) = manager();
    let pid_file = root.join("never.pid");
    let cmd = format!("echo $$ > {}", pid_file.display());
    let barrier = StartBarrier::new();
    let id = manager
        .submit(
            &cmd,
            SubmitOptions::default().with_start_barrier(barrier.clone()),
        )
        .await
        .unwrap();

    wait_for("supervisor ref", || async {
        manager.supervisor_ref(&id).await.unwrap().is_some()
    })
    .await;
    // No restart is available in-process; the job is failed either way.
    assert!(manager.kill_supervisor(&id, true).await.unwrap());

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Failed);
    barrier.release();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pid_file.exists());
    assert!(!manager.kill_supervisor(&id, false).await.unwrap());
}

#[tokio::test]
async fn log_reads_only_grow() {
    let (manager, _root) = manager();
    let id = manager
        .submit(
            "for i in 1 2 3 4 5; do echo line$i; sleep 0.05; done",
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    let mut previous = String::new();
    loop {
        let terminal = manager.get_status(&id).await.unwrap().is_terminal();
        let logs = manager.get_logs(&id).await.unwrap();
        assert!(logs.starts_with(&previous), "{previous:?} then {logs:?}");
        previous = logs;
        if terminal {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(previous, "line1\nline2\nline3\nline4\nline5\n");
}

#[tokio::test]
async fn tail_logs_pages_until_finished() {
    let (manager, _root) = manager();
    let id = manager
        .submit("printf 'abcdefghij'", SubmitOptions::default())
        .await
        .unwrap();
    wait_for_terminal(&manager, &id).await;

    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let chunk = manager.tail_logs(&id, offset, 4).await.unwrap();
        out.extend_from_slice(&chunk.data);
        offset = chunk.next_offset;
        if chunk.finished {
            break;
        }
    }
    assert_eq!(out, b"abcdefghij");
    assert!(matches!(
        manager.tail_logs(&JobId::from("missing"), 0, 4).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn logs_are_mirrored_to_file() {
    let root = scratch_dir();
    let log_dir = root.join("logs");
    let config = AgentConfig {
        log_dir: Some(log_dir.clone()),
        ..test_config(&root)
    };
    let manager = JobManager::new(config);
    let id = manager
        .submit("echo mirrored", SubmitOptions::default().with_job_id("mirror-1"))
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&manager, &id).await, JobStatus::Succeeded);
    let path = log_dir.join("job-mirror-1.log");
    wait_for("log file to be written", || async {
        std::fs::read_to_string(&path).ok().as_deref() == Some("mirrored\n")
    })
    .await;
}

#[tokio::test]
async fn shutdown_stops_live_jobs() {
    let (manager, _root) = manager();
    let running = manager.submit("sleep 30", SubmitOptions::default()).await.unwrap();
    let pending = manager
        .submit(
            "echo never",
            SubmitOptions::default().with_start_barrier(StartBarrier::new()),
        )
        .await
        .unwrap();
    wait_for_status(&manager, &running, JobStatus::Running).await;
    let pid = manager.get_job(&running).await.unwrap().pid.unwrap();

    manager.shutdown().await;
    assert_eq!(manager.get_status(&running).await.unwrap(), JobStatus::Stopped);
    assert_eq!(manager.get_status(&pending).await.unwrap(), JobStatus::Stopped);
    assert_dead(pid).await;
    assert_eq!(manager.active_jobs().await, 0);
}

#[tokio::test]
async fn many_jobs_run_concurrently() {
    let (manager, _root) = manager();
    let mut ids = Vec::new();
    for i in 0..10 {
        let id = manager
            .submit(&format!("sleep 0.2; echo job{i}"), SubmitOptions::default())
            .await
            .unwrap();
        ids.push((i, id));
    }
    let started = tokio::time::Instant::now();
    for (i, id) in &ids {
        assert_eq!(wait_for_terminal(&manager, id).await, JobStatus::Succeeded);
        assert_eq!(manager.get_logs(id).await.unwrap(), format!("job{i}\n"));
    }
    // Ten serial runs would take at least two seconds.
    assert!(started.elapsed() < Duration::from_secs(2));
}
