use std::{
    collections::BTreeMap,
    io::Read,
    os::fd::{FromRawFd, OwnedFd},
    os::unix::process::ExitStatusExt,
    path::Path,
    process::Stdio,
    time::Duration,
};

use tokio::process::{Child, Command};

use crate::error::JobError;
use crate::log_sink::LogSink;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How a job's process left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(c) => Some(c),
            Self::Signaled(_) => None,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(c), _) => Self::Exited(c),
            (None, Some(sig)) => Self::Signaled(sig),
            // Neither code nor signal: treat as a generic failure.
            (None, None) => Self::Exited(-1),
        }
    }

    pub fn describe(self) -> String {
        match self {
            Self::Exited(c) => format!("exited with code {c}"),
            Self::Signaled(sig) => format!("killed by signal {sig}"),
        }
    }
}

/// Launches entrypoints as process-group leaders with merged stdout/stderr.
#[derive(Clone, Copy, Debug)]
pub struct ProcessRunner {
    drain_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { drain_timeout }
    }

    /// Runs `command` through `/bin/sh -c` in `working_dir`.
    ///
    /// `env_vars` are applied on top of the agent's own environment. Both
    /// output streams of the child go into `sink` through a single pipe.
    pub fn start(
        &self,
        command: &str,
        working_dir: &Path,
        env_vars: &BTreeMap<String, String>,
        sink: LogSink,
    ) -> Result<ProcessHandle, JobError> {
        let (read_end, write_end) = output_pipe().map_err(JobError::Spawn)?;
        let child = spawn_group_leader(command, working_dir, env_vars, write_end)
            .map_err(JobError::Spawn)?;
        // `spawn_group_leader` dropped the parent's write end, so the reader
        // sees EOF once every process in the group has exited.

        let Some(pid) = child.id() else {
            return Err(JobError::Spawn(std::io::Error::other(
                "child exited before its pid could be read",
            )));
        };

        let pump = tokio::task::spawn_blocking(move || pump_output(read_end, sink));

        Ok(ProcessHandle {
            child,
            pid,
            reaped: false,
            pump: Some(pump),
            drain_timeout: self.drain_timeout,
        })
    }
}

fn spawn_group_leader(
    command: &str,
    working_dir: &Path,
    env_vars: &BTreeMap<String, String>,
    write_end: OwnedFd,
) -> std::io::Result<Child> {
    let stderr_end = write_end.try_clone()?;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .envs(env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .kill_on_drop(true);

    unsafe {
        cmd.pre_exec(|| {
            // New session: the child leads a fresh process group whose id is
            // its pid, so the whole tree can be signaled at once.
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}

fn pump_output(read_end: OwnedFd, sink: LogSink) {
    let mut file = std::fs::File::from(read_end);
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => sink.append(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "job output pipe read failed");
                break;
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn output_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // O_CLOEXEC at creation so concurrent spawns never inherit our ends.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(target_os = "linux"))]
fn output_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::AsRawFd;

    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&pair.0, &pair.1] {
        let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(pair)
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies (crash/kill), the kernel kills the job's leader too.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Group already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// SIGKILL every process in the group led by `pgid`.
///
/// Used by reconciliation when the supervisor that owned the handle is gone.
pub fn kill_group(pgid: u32) -> std::io::Result<()> {
    signal_group(pgid, libc::SIGKILL)
}

/// Whether a process with `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // EPERM: exists but owned by someone else.
        if err.raw_os_error() != Some(libc::EPERM) {
            return false;
        }
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        // Vanished between the two checks.
        return true;
    };
    let Some(end) = s.rfind(')') else {
        return false;
    };
    matches!(s.get(end + 2..end + 3), Some("Z") | Some("X"))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Exclusive owner of one running entrypoint.
///
/// Dropping a handle whose process was never reaped SIGKILLs the whole group,
/// so aborting the owning task cannot leave the tree behind.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    reaped: bool,
    pump: Option<tokio::task::JoinHandle<()>>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("reaped", &self.reaped)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits for the group leader to exit, then clears out the rest of the
    /// group and drains the remaining output into the sink.
    ///
    /// Cancel-safe: dropping the future before completion leaves the handle
    /// usable (and still responsible for cleanup on drop).
    pub async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        self.reaped = true;

        // Leftover grandchildren would otherwise hold the pipe open.
        if let Err(err) = signal_group(self.pid, libc::SIGKILL) {
            tracing::debug!(pid = self.pid, error = %err, "group cleanup after exit failed");
        }

        if let Some(pump) = self.pump.take()
            && tokio::time::timeout(self.drain_timeout, pump).await.is_err()
        {
            tracing::warn!(pid = self.pid, "job output not drained before timeout");
        }

        Ok(ExitOutcome::from_status(status))
    }

    /// SIGTERM to the whole group.
    pub fn terminate(&self) -> std::io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal_group(self.pid, libc::SIGTERM)
    }

    /// SIGKILL to the whole group.
    pub fn kill(&self) -> std::io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal_group(self.pid, libc::SIGKILL)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal_group(self.pid, libc::SIGKILL);
        }
    }
}
