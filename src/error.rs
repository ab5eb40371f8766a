use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} is already {status}")]
    AlreadyTerminal { job_id: Uuid, status: JobStatus },

    #[error("Scheduler is not running")]
    Unavailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
