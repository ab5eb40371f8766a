use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::publisher::StatusPublisher;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::scheduler::coordinator::SchedulerMessage;
use crate::scheduler::{ExitOutcome, Job};

/// What a per-job task needs to drive one container.
#[derive(Clone)]
pub(crate) struct Supervisor {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub publisher: StatusPublisher,
    pub sandbox: Arc<SandboxConfig>,
    pub messages: mpsc::Sender<SchedulerMessage>,
}

impl Supervisor {
    /// Start a freshly dispatched job and follow it to its exit.
    pub fn launch(&self, job: Job) {
        let this = self.clone();
        tokio::spawn(async move {
            this.publisher.begin(&job).await;
            let spec = ContainerSpec::for_job(&job, &this.sandbox);

            match this.runtime.start(&spec).await {
                Ok(handle) => {
                    tracing::info!(job_id = %job.id, container = %handle.name, "Container started");
                    this.report(SchedulerMessage::ContainerStarted {
                        job_id: job.id,
                        handle: handle.clone(),
                    })
                    .await;
                    this.follow(job.id, handle, None).await;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Container launch failed");
                    this.publisher
                        .publish_line(job.id, format!("ERROR: {}", e))
                        .await;
                    this.report(SchedulerMessage::LaunchFailed {
                        job_id: job.id,
                        error: launch_message(e),
                    })
                    .await;
                }
            }
        });
    }

    /// Follow a container that was already running when the scheduler
    /// started. Output printed before `since` is already in the durable log.
    pub fn attach(&self, job_id: Uuid, handle: ContainerHandle, since: DateTime<Utc>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.follow(job_id, handle, Some(since)).await;
        });
    }

    /// Request a stop. The exit is reported by the task following the
    /// container, not here.
    pub fn stop(&self, job_id: Uuid, handle: ContainerHandle, grace: Duration) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            tracing::info!(job_id = %job_id, container = %handle.name, "Stopping container");
            if let Err(e) = runtime.stop(&handle, grace).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to stop container");
            }
        });
    }

    /// Remove a container that is no longer needed.
    pub fn reap(&self, job_id: Uuid, handle: ContainerHandle) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.remove(&handle).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove container");
            }
        });
    }

    /// Pump output until the container exits and report the exit. The
    /// container is left in place; the coordinator reaps it once the exit is
    /// recorded.
    async fn follow(&self, job_id: Uuid, handle: ContainerHandle, since: Option<DateTime<Utc>>) {
        let mut output = self.runtime.stream_output(&handle, since);
        let pump = async {
            while let Some(line) = output.next().await {
                self.publisher.publish_line(job_id, line).await;
            }
        };
        let (_, exit) = tokio::join!(pump, self.runtime.wait(&handle));

        let outcome = match exit {
            Ok(code) => ExitOutcome::Exited(code),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Lost track of container");
                ExitOutcome::Lost(e.to_string())
            }
        };

        self.report(SchedulerMessage::ContainerExited { job_id, outcome })
            .await;
    }

    async fn report(&self, message: SchedulerMessage) {
        if self.messages.send(message).await.is_err() {
            tracing::debug!("Coordinator gone, dropping container report");
        }
    }
}

fn launch_message(error: RuntimeError) -> String {
    match error {
        RuntimeError::LaunchFailed(message) => message,
        other => other.to_string(),
    }
}
