//! Container lifecycle management.
//!
//! The scheduler talks to containers only through [`ContainerRuntime`]:
//! - **start**: launch a detached container for a job
//! - **stream_output**: follow its merged stdout/stderr, line by line,
//!   optionally only from a point in time (re-attaching after a restart)
//! - **stop**: graceful-then-forceful termination, idempotent
//! - **wait**: block the calling task until the container exits
//! - **inspect** / **remove**: used by restart reconciliation and reaping
//!
//! [`DockerRuntime`] drives the `docker` CLI. [`ScriptedRuntime`] keeps
//! containers in memory and lets the caller decide when they print and exit.

pub mod docker;
pub mod scripted;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::inventory::ResourceId;
use crate::scheduler::Job;

pub use docker::DockerRuntime;
pub use scripted::ScriptedRuntime;

/// Lines printed by a container, ending when it exits.
pub type OutputStream = BoxStream<'static, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{action} failed: {message}")]
    Command { action: &'static str, message: String },
}

/// Opaque reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

impl ContainerHandle {
    /// Handle addressing a job's container by its deterministic name. Used
    /// when the runtime id was never recorded.
    pub fn for_job(job_id: Uuid) -> Self {
        let name = container_name(job_id);
        Self {
            id: name.clone(),
            name,
        }
    }
}

pub fn container_name(job_id: Uuid) -> String {
    format!("trainq-job-{}", job_id)
}

/// Observed state of a container, for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited { exit_code: Option<i64> },
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBinding {
    CpuOnly,
    Gpu(u32),
}

impl DeviceBinding {
    pub fn for_resource(resource: &ResourceId) -> Self {
        match resource.gpu_index() {
            Some(index) => DeviceBinding::Gpu(index),
            None => DeviceBinding::CpuOnly,
        }
    }
}

/// Everything needed to launch one job container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub job_id: Uuid,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub device: DeviceBinding,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn for_job(job: &Job, sandbox: &SandboxConfig) -> Self {
        let resource = job
            .assigned_resource
            .as_ref()
            .unwrap_or(&job.requested_resource);
        Self {
            job_id: job.id,
            name: container_name(job.id),
            image: job.image.clone(),
            command: job
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| sandbox.default_command.clone()),
            device: DeviceBinding::for_resource(resource),
            workspace: job.workspace.clone(),
            output_dir: job.output_dir.clone(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Follow the container's output until it exits. With `since`, only
    /// lines printed at or after that instant are replayed; without it the
    /// whole history is.
    fn stream_output(&self, handle: &ContainerHandle, since: Option<DateTime<Utc>>) -> OutputStream;

    /// Ask the container to stop, escalating to a kill after `grace`.
    /// Stopping an exited or unknown container succeeds.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
