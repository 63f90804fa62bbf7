use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use jobhost_core::{EnvironmentSpec, JobId};
use serde::Deserialize;

use crate::config::format_error_chain;
use crate::error::{JobError, Result};

/// File in a working directory whose `[env]` table the entrypoint itself
/// relies on.
pub const JOB_CONFIG_FILE: &str = "jobhost.toml";

const MAX_DOWNLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// A resolved, local execution environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedEnv {
    pub working_dir: PathBuf,
    /// Caller-supplied variables, as they should reach the process.
    pub env_vars: BTreeMap<String, String>,
    /// Variables declared by the working directory's own `jobhost.toml`.
    pub config_env: BTreeMap<String, String>,
}

#[async_trait]
pub trait Materializer: Send + Sync + 'static {
    /// Fails with [`JobError::Materialization`].
    async fn materialize(&self, job_id: &JobId, spec: &EnvironmentSpec) -> Result<MaterializedEnv>;
}

/// Structural checks done before a job is accepted.
pub fn validate_environment(spec: &EnvironmentSpec) -> Result<()> {
    if let Some(dir) = &spec.working_dir
        && dir.trim().is_empty()
    {
        return Err(JobError::InvalidEnvironment(
            "working_dir must not be empty when set".to_string(),
        ));
    }
    for (k, v) in &spec.env_vars {
        if k.is_empty() || k.contains('=') || k.contains('\0') {
            return Err(JobError::InvalidEnvironment(format!(
                "invalid env var name {k:?}"
            )));
        }
        if v.contains('\0') {
            return Err(JobError::InvalidEnvironment(format!(
                "env var {k} contains a NUL byte"
            )));
        }
    }
    Ok(())
}

/// Resolves working directories on the local filesystem.
///
/// Accepted sources: an existing directory, a `.zip` archive on disk, or an
/// `http(s)://` URL of a `.zip` archive. Archives are unpacked into
/// `<data_root>/jobs/<job_id>/working_dir`.
#[derive(Debug, Clone)]
pub struct LocalMaterializer {
    data_root: PathBuf,
    download_timeout: Duration,
}

impl LocalMaterializer {
    pub fn new(data_root: PathBuf, download_timeout: Duration) -> Self {
        Self {
            data_root,
            download_timeout,
        }
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.data_root.join("jobs").join(job_id.as_str())
    }

    async fn resolve(&self, job_id: &JobId, spec: &EnvironmentSpec) -> anyhow::Result<MaterializedEnv> {
        let Some(source) = spec.working_dir.as_deref().map(str::trim) else {
            let cwd = std::env::current_dir().context("resolve agent working directory")?;
            return Ok(MaterializedEnv {
                working_dir: cwd,
                env_vars: spec.env_vars.clone(),
                config_env: BTreeMap::new(),
            });
        };

        let working_dir = if is_http_url(source) {
            let url = reqwest::Url::parse(source).context("invalid working_dir url")?;
            let job_dir = self.job_dir(job_id);
            tokio::fs::create_dir_all(&job_dir)
                .await
                .with_context(|| format!("create {}", job_dir.display()))?;
            let nonce = uuid::Uuid::new_v4();
            let zip_path = job_dir.join(format!("archive-{nonce}.zip"));
            download_to_path(url, &zip_path, self.download_timeout).await?;
            let out = unpack_archive(&zip_path, &job_dir).await;
            let _ = tokio::fs::remove_file(&zip_path).await;
            out?
        } else if let Some((scheme, _)) = source.split_once("://") {
            anyhow::bail!("unsupported working_dir scheme {scheme:?} (expected a local path or http(s) url)");
        } else {
            let path = PathBuf::from(source);
            let meta = tokio::fs::metadata(&path)
                .await
                .with_context(|| format!("working_dir not found: {}", path.display()))?;
            if meta.is_dir() {
                tokio::fs::canonicalize(&path)
                    .await
                    .with_context(|| format!("resolve {}", path.display()))?
            } else if meta.is_file() && is_zip_path(&path) {
                let job_dir = self.job_dir(job_id);
                unpack_archive(&path, &job_dir).await?
            } else {
                anyhow::bail!(
                    "working_dir must be a directory or a .zip archive: {}",
                    path.display()
                );
            }
        };

        let config_env = read_config_env(&working_dir).await?;
        Ok(MaterializedEnv {
            working_dir,
            env_vars: spec.env_vars.clone(),
            config_env,
        })
    }
}

#[async_trait]
impl Materializer for LocalMaterializer {
    async fn materialize(&self, job_id: &JobId, spec: &EnvironmentSpec) -> Result<MaterializedEnv> {
        self.resolve(job_id, spec)
            .await
            .map_err(|e| JobError::Materialization(format_error_chain(&e)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobConfigFile {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

async fn read_config_env(dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let path = dir.join(JOB_CONFIG_FILE);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let parsed: JobConfigFile =
        toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(parsed.env)
}

fn is_http_url(s: &str) -> bool {
    let lower = s.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_zip_path(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

async fn unpack_archive(zip_path: &Path, job_dir: &Path) -> anyhow::Result<PathBuf> {
    let nonce = uuid::Uuid::new_v4();
    let extracted = job_dir.join(format!("extracted-{nonce}"));
    tokio::task::spawn_blocking({
        let zip_path = zip_path.to_path_buf();
        let extracted = extracted.clone();
        move || unpack_zip(&zip_path, &extracted)
    })
    .await
    .context("extract task failed")??;

    let root = single_top_dir(&extracted).unwrap_or_else(|| extracted.clone());
    let working_dir = job_dir.join("working_dir");
    if tokio::fs::metadata(&working_dir).await.is_ok() {
        tokio::fs::remove_dir_all(&working_dir)
            .await
            .with_context(|| format!("clear {}", working_dir.display()))?;
    }
    tokio::fs::rename(&root, &working_dir)
        .await
        .with_context(|| format!("install {}", working_dir.display()))?;
    let _ = tokio::fs::remove_dir_all(&extracted).await;
    Ok(working_dir)
}

/// Writes every entry of the archive below `out_dir`. An entry whose name
/// would land outside `out_dir` fails the whole unpack.
fn unpack_zip(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(f).context("read zip archive")?;
    fs::create_dir_all(out_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            anyhow::bail!("zip entry {:?} escapes the archive root", entry.name());
        };
        let target = out_dir.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)?;

        // Keep the executable bit on job scripts.
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777));
        }
    }
    Ok(())
}

/// The lone top-level directory of an unpacked archive, if that is all it holds.
fn single_top_dir(extracted: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(extracted).ok()?.flatten();
    let only = entries.next()?.path();
    (entries.next().is_none() && only.is_dir()).then_some(only)
}

async fn download_to_path(url: reqwest::Url, path: &Path, timeout: Duration) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let client = reqwest::Client::builder()
        .user_agent("jobhost-agent")
        .timeout(timeout)
        .build()
        .context("build http client")?;
    let resp = client
        .get(url)
        .send()
        .await
        .context("download")?
        .error_for_status()
        .context("download (status)")?;

    let mut f = tokio::fs::File::create(path)
        .await
        .context("create download file")?;
    let mut total: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download chunk")?;
        total = total.saturating_add(chunk.len() as u64);
        if total > MAX_DOWNLOAD_BYTES {
            let _ = tokio::fs::remove_file(path).await;
            anyhow::bail!("download too large");
        }
        tokio::io::AsyncWriteExt::write_all(&mut f, &chunk)
            .await
            .context("write download")?;
    }
    tokio::io::AsyncWriteExt::flush(&mut f).await.ok();
    Ok(())
}
