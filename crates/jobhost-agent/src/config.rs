use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_AGENT_ADDR: &str = "0.0.0.0:50061";
const DEFAULT_DATA_ROOT: &str = "./jobhost-data";
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_STOP_GRACE_MS: u64 = 3000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5000;
const DEFAULT_DOWNLOAD_TIMEOUT_SEC: u64 = 30 * 60;
const DEFAULT_OUTPUT_DRAIN_MS: u64 = 2000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Size-based rotation for mirrored job log files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogFileLimits {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogFileLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Root for materialized working directories (`<data_root>/jobs/<id>`).
    pub data_root: PathBuf,
    /// When set, every job log is mirrored to `<log_dir>/job-<id>.log`.
    pub log_dir: Option<PathBuf>,
    pub log_file_limits: LogFileLimits,
    /// Time between SIGTERM and SIGKILL when stopping a running job.
    pub stop_grace: Duration,
    pub reconcile_interval: Duration,
    /// How long a job may sit behind an unreleased start barrier.
    /// `None` waits forever.
    pub pending_timeout: Option<Duration>,
    pub download_timeout: Duration,
    /// Upper bound for draining buffered output after the process exits.
    pub output_drain_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_AGENT_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 50061))),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            log_dir: None,
            log_file_limits: LogFileLimits::default(),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            pending_timeout: None,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
            output_drain_timeout: Duration::from_millis(DEFAULT_OUTPUT_DRAIN_MS),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env_nonempty("JOBHOST_AGENT_ADDR") {
            Some(v) => v
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid JOBHOST_AGENT_ADDR {v:?}: {e}"))?,
            None => defaults.listen_addr,
        };

        let data_root = env_nonempty("JOBHOST_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);
        let log_dir = env_nonempty("JOBHOST_LOG_DIR").map(PathBuf::from);

        let log_file_limits = LogFileLimits {
            max_bytes: env_u64("JOBHOST_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            max_files: env_usize("JOBHOST_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
        };

        let stop_grace = Duration::from_millis(
            env_u64("JOBHOST_STOP_GRACE_MS")
                .map(|v| v.clamp(100, 10 * 60 * 1000))
                .unwrap_or(DEFAULT_STOP_GRACE_MS),
        );
        let reconcile_interval = Duration::from_millis(
            env_u64("JOBHOST_RECONCILE_INTERVAL_MS")
                .map(|v| v.clamp(100, 60 * 60 * 1000))
                .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
        );
        // 0 (the default) disables the timeout.
        let pending_timeout = env_u64("JOBHOST_PENDING_TIMEOUT_MS")
            .filter(|v| *v > 0)
            .map(Duration::from_millis);
        let download_timeout = Duration::from_secs(
            env_u64("JOBHOST_DOWNLOAD_TIMEOUT_SEC")
                .map(|v| v.clamp(10, 24 * 60 * 60))
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
        );
        let output_drain_timeout = Duration::from_millis(
            env_u64("JOBHOST_OUTPUT_DRAIN_MS")
                .map(|v| v.clamp(50, 60_000))
                .unwrap_or(DEFAULT_OUTPUT_DRAIN_MS),
        );

        Ok(Self {
            listen_addr,
            data_root,
            log_dir,
            log_file_limits,
            stop_grace,
            reconcile_interval,
            pending_timeout,
            download_timeout,
            output_drain_timeout,
        })
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn defaults_without_env() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.stop_grace, Duration::from_secs(3));
        assert!(cfg.pending_timeout.is_none());
        assert!(cfg.log_dir.is_none());
        assert_eq!(cfg.listen_addr.port(), 50061);
    }

    #[test]
    fn error_chain_is_flattened_and_deduplicated() {
        let base: anyhow::Result<()> = Err(anyhow::anyhow!("no such file"));
        let err = base
            .context("open archive")
            .context("open archive")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "open archive: no such file");
    }
}
