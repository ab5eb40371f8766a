use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::scheduler::Job;

/// Durable record of a job's output. Receives every line, unlike live
/// subscribers.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    /// Called once when the job is dispatched, before any output.
    async fn begin(&self, job: &Job) -> std::io::Result<()>;

    async fn append(&self, job_id: Uuid, line: &str) -> std::io::Result<()>;

    /// Called once the job is terminal.
    async fn finish(&self, job: &Job) -> std::io::Result<()>;

    /// Full log text. Empty for a job that never started.
    async fn read(&self, job_id: Uuid) -> std::io::Result<String>;
}

fn header(job: &Job) -> String {
    let started = job.started_at.unwrap_or_else(Utc::now);
    let resource = job
        .assigned_resource
        .as_ref()
        .unwrap_or(&job.requested_resource);
    format!(
        "Job started at {}\nResource: {}\nImage: {}\n{}\n\n",
        started.to_rfc3339(),
        resource,
        job.image,
        "-".repeat(50)
    )
}

fn footer(job: &Job) -> String {
    let mut out = format!("\n{}\nJob {}", "=".repeat(50), job.status);
    if let Some(exit) = &job.exit {
        if let Some(code) = exit.exit_code {
            out.push_str(&format!(" (exit code {})", code));
        }
        if let Some(reason) = &exit.reason {
            out.push_str(&format!(": {}", reason));
        }
    }
    out.push('\n');
    out
}

/// Writes `<dir>/<job_id>.log`.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub async fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.log", job_id))
    }

    async fn write(path: &Path, text: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn begin(&self, job: &Job) -> std::io::Result<()> {
        Self::write(&self.path_for(job.id), &header(job)).await
    }

    async fn append(&self, job_id: Uuid, line: &str) -> std::io::Result<()> {
        let mut text = String::with_capacity(line.len() + 1);
        text.push_str(line);
        text.push('\n');
        Self::write(&self.path_for(job_id), &text).await
    }

    async fn finish(&self, job: &Job) -> std::io::Result<()> {
        Self::write(&self.path_for(job.id), &footer(job)).await
    }

    async fn read(&self, job_id: Uuid) -> std::io::Result<String> {
        match tokio::fs::read_to_string(self.path_for(job_id)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Default)]
struct MemoryLogs {
    text: HashMap<Uuid, String>,
    lines: HashMap<Uuid, Vec<String>>,
    finished: HashSet<Uuid>,
}

/// Keeps logs in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryLogSink {
    logs: Mutex<MemoryLogs>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, MemoryLogs> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Output lines only, without header or footer.
    pub fn lines(&self, job_id: Uuid) -> Vec<String> {
        self.logs().lines.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn footer_written(&self, job_id: Uuid) -> bool {
        self.logs().finished.contains(&job_id)
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn begin(&self, job: &Job) -> std::io::Result<()> {
        self.logs()
            .text
            .entry(job.id)
            .or_default()
            .push_str(&header(job));
        Ok(())
    }

    async fn append(&self, job_id: Uuid, line: &str) -> std::io::Result<()> {
        let mut logs = self.logs();
        let text = logs.text.entry(job_id).or_default();
        text.push_str(line);
        text.push('\n');
        logs.lines
            .entry(job_id)
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn finish(&self, job: &Job) -> std::io::Result<()> {
        let mut logs = self.logs();
        logs.text.entry(job.id).or_default().push_str(&footer(job));
        logs.finished.insert(job.id);
        Ok(())
    }

    async fn read(&self, job_id: Uuid) -> std::io::Result<String> {
        Ok(self.logs().text.get(&job_id).cloned().unwrap_or_default())
    }
}
