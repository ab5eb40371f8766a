use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inventory::ResourceId;
use crate::runtime::ContainerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Submission payload. The workspace and output directories must already
/// exist; preparing them is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub resource: ResourceId,
    pub image: String,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: Option<i64>,
    pub reason: Option<String>,
}

impl ExitInfo {
    pub fn code(exit_code: i64) -> Self {
        Self {
            exit_code: Some(exit_code),
            reason: None,
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub requested_resource: ResourceId,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_resource: Option<ResourceId>,
    pub container: Option<ContainerHandle>,
    pub exit: Option<ExitInfo>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec, Utc::now())
    }

    pub fn with_id(id: Uuid, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            requested_resource: spec.resource,
            workspace: spec.workspace,
            output_dir: spec.output_dir,
            image: spec.image,
            command: spec.command,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            assigned_resource: None,
            container: None,
            exit: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
