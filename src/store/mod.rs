//! Durable job records.
//!
//! The scheduler treats the store as passive persistence: it writes every
//! transition through [`JobStore`] and reads it back only once, at startup,
//! for reconciliation.

mod json_dir;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::inventory::ResourceId;
use crate::runtime::ContainerHandle;
use crate::scheduler::{ExitInfo, Job, JobStatus};

pub use json_dir::JsonDirJobStore;
pub use memory::MemoryJobStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fields changed by a transition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_resource: Option<ResourceId>,
    pub container: Option<ContainerHandle>,
    pub exit: Option<ExitInfo>,
}

impl JobUpdate {
    /// The fields of `job` that the scheduler mutates after creation.
    pub fn snapshot(job: &Job) -> Self {
        Self {
            status: Some(job.status),
            started_at: job.started_at,
            completed_at: job.completed_at,
            assigned_resource: job.assigned_resource.clone(),
            container: job.container.clone(),
            exit: job.exit.clone(),
        }
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if self.started_at.is_some() {
            job.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            job.completed_at = self.completed_at;
        }
        if self.assigned_resource.is_some() {
            job.assigned_resource = self.assigned_resource.clone();
        }
        if self.container.is_some() {
            job.container = self.container.clone();
        }
        if self.exit.is_some() {
            job.exit = self.exit.clone();
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn update(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;
    use std::path::PathBuf;

    #[test]
    fn update_only_touches_set_fields() {
        let mut job = Job::new(JobSpec {
            name: "bert".to_string(),
            resource: ResourceId::gpu(0),
            image: "img".to_string(),
            workspace: PathBuf::from("/w"),
            output_dir: PathBuf::from("/o"),
            command: None,
        });
        let created_at = job.created_at;

        JobUpdate {
            status: Some(JobStatus::Running),
            assigned_resource: Some(ResourceId::gpu(0)),
            ..Default::default()
        }
        .apply(&mut job);

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.assigned_resource, Some(ResourceId::gpu(0)));
        assert_eq!(job.created_at, created_at);
        assert!(job.started_at.is_none());
        assert!(job.exit.is_none());

        let snap = JobUpdate::snapshot(&job);
        assert_eq!(snap.status, Some(JobStatus::Running));
        assert!(snap.container.is_none());
    }
}
