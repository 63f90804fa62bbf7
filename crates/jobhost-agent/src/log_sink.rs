use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::LogFileLimits;

/// Append-only output stream of one job.
///
/// Exactly one writer (the job's supervisor) and any number of readers. Each
/// `append` is visible to readers as a whole or not at all.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    buf: RwLock<Vec<u8>>,
    file_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("len", &self.len()).finish()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LogSink {
    pub fn in_memory() -> Self {
        Self::with_mirror(None)
    }

    /// Memory sink whose appends are also written to `path` by a background
    /// task. Must be called inside a tokio runtime.
    pub fn with_file(path: PathBuf, limits: LogFileLimits) -> Self {
        let (file_tx, file_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(mirror_to_file(path, limits, file_rx));
        Self::with_mirror(Some(file_tx))
    }

    fn with_mirror(file_tx: Option<mpsc::UnboundedSender<Vec<u8>>>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                buf: RwLock::new(Vec::new()),
                file_tx: Mutex::new(file_tx),
            }),
        }
    }

    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut buf = self.inner.buf.write().unwrap_or_else(|e| e.into_inner());
            buf.extend_from_slice(data);
        }

        let file_tx = self.inner.file_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = file_tx.as_ref() {
            // Fails only once the writer task gave up; it already logged why.
            let _ = tx.send(data.to_vec());
        }
    }

    pub fn append_line(&self, line: &str) {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.append(line.as_bytes());
    }

    pub fn len(&self) -> u64 {
        self.inner.buf.read().unwrap_or_else(|e| e.into_inner()).len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole stream as text.
    ///
    /// A trailing incomplete UTF-8 sequence is held back until its remaining
    /// bytes arrive, so successive reads only ever extend earlier ones.
    pub fn read_to_string(&self) -> String {
        let buf = self.inner.buf.read().unwrap_or_else(|e| e.into_inner());
        let end = complete_utf8_len(&buf);
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// Up to `limit` bytes starting at `offset`, plus the offset to continue from.
    pub fn read_from(&self, offset: u64, limit: usize) -> (Vec<u8>, u64) {
        let buf = self.inner.buf.read().unwrap_or_else(|e| e.into_inner());
        let start = (offset as usize).min(buf.len());
        let end = start.saturating_add(limit).min(buf.len());
        (buf[start..end].to_vec(), end as u64)
    }

    /// Last non-empty line, trimmed.
    pub fn last_line(&self) -> Option<String> {
        self.read_to_string()
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    /// Detach the file mirror. The writer task drains what was already
    /// appended, flushes and exits. Memory contents stay readable.
    pub fn close(&self) {
        self.inner
            .file_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

async fn mirror_to_file(
    path: PathBuf,
    limits: LogFileLimits,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut writer = match FileLogWriter::open(path.clone(), limits.max_bytes, limits.max_files).await {
        Ok(writer) => writer,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot open job log file; keeping output in memory only");
            return;
        }
    };
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = writer.write(&chunk).await {
            tracing::warn!(path = %path.display(), error = %err, "job log mirror write failed; disabling mirror");
            return;
        }
    }
}

fn complete_utf8_len(buf: &[u8]) -> usize {
    // Look for the start byte of the final character among the last 4 bytes.
    let floor = buf.len().saturating_sub(4);
    for i in (floor..buf.len()).rev() {
        let b = buf[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = if b < 0x80 {
            1
        } else if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            // Invalid lead byte; lossy decoding replaces it either way.
            return buf.len();
        };
        return if buf.len() - i < width { i } else { buf.len() };
    }
    buf.len()
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), n))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(&from, self.rotated(i + 1)).await;
            }
        }
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, self.rotated(1)).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    /// Appends `data`, rotating first when it would push the file past
    /// `max_bytes`. Each chunk is flushed so readers of the file see it.
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let write_len = data.len() as u64;
        if self.max_bytes > 0
            && self.bytes > 0
            && self.bytes.saturating_add(write_len) > self.max_bytes
        {
            self.rotate().await.ok();
        }

        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

pub(crate) fn job_log_path(log_dir: &Path, job_id: &str) -> PathBuf {
    log_dir.join(format!("job-{job_id}.log"))
}
