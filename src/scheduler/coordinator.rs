use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SandboxConfig, SchedulerConfig};
use crate::error::{Result, SchedulerError};
use crate::inventory::{ResourceId, ResourceInventory};
use crate::publisher::{LogSink, MemoryLogSink, StatusChange, StatusPublisher, Subscription};
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::scheduler::state::{CancelAction, ExitOutcome, ResourceView, SchedulerState};
use crate::scheduler::supervisor::Supervisor;
use crate::scheduler::{Job, JobSpec};
use crate::store::{JobStore, JobUpdate};
use crate::telemetry::{SamplerGuard, SystemProbe, TelemetryCache, TelemetryProbe, TelemetrySampler};

/// Requests handled by the coordinator loop.
///
/// Client requests carry a oneshot for the reply. Container reports come
/// from the per-job supervisor tasks.
pub(crate) enum SchedulerMessage {
    Submit {
        spec: JobSpec,
        reply: oneshot::Sender<Result<Job>>,
    },
    Cancel {
        job_id: Uuid,
        reply: oneshot::Sender<Result<Job>>,
    },
    Get {
        job_id: Uuid,
        reply: oneshot::Sender<Option<Job>>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Resources {
        reply: oneshot::Sender<Vec<ResourceView>>,
    },
    Subscribe {
        job_id: Uuid,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    ContainerStarted {
        job_id: Uuid,
        handle: ContainerHandle,
    },
    LaunchFailed {
        job_id: Uuid,
        error: String,
    },
    ContainerExited {
        job_id: Uuid,
        outcome: ExitOutcome,
    },
}

/// Builder for a running scheduler.
pub struct Scheduler {
    inventory: ResourceInventory,
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn TelemetryProbe>,
    sink: Arc<dyn LogSink>,
    config: SchedulerConfig,
    sandbox: SandboxConfig,
}

impl Scheduler {
    pub fn new(
        inventory: ResourceInventory,
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            inventory,
            store,
            runtime,
            probe: Arc::new(SystemProbe::default()),
            sink: Arc::new(MemoryLogSink::new()),
            config: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn TelemetryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Reconcile persisted jobs against the runtime, then start the
    /// coordinator loop. The loop runs until `shutdown` is cancelled.
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(self.config.message_buffer.max(1));

        let publisher = StatusPublisher::new(
            self.config.log_retention,
            self.config.subscriber_buffer,
            self.config.closed_job_history,
            self.sink,
        );
        let telemetry = TelemetryCache::new();
        let sampler = TelemetrySampler::new(
            self.probe,
            telemetry.clone(),
            publisher.clone(),
            self.config.telemetry_interval(),
        );
        let supervisor = Supervisor {
            runtime: self.runtime,
            publisher: publisher.clone(),
            sandbox: Arc::new(self.sandbox),
            messages: tx.clone(),
        };

        let mut coordinator = Coordinator {
            state: SchedulerState::new(self.inventory),
            store: self.store,
            publisher: publisher.clone(),
            sampler,
            supervisor,
            samplers: HashMap::new(),
            cancel_waiters: HashMap::new(),
            config: self.config,
        };

        coordinator.reconcile().await?;
        coordinator.dispatch_all().await;

        let task = tokio::spawn(coordinator.run(rx, shutdown));
        let handle = SchedulerHandle {
            tx,
            telemetry,
            publisher,
        };
        Ok((handle, task))
    }
}

/// Single owner of all scheduling state.
pub(crate) struct Coordinator {
    pub(super) state: SchedulerState,
    pub(super) store: Arc<dyn JobStore>,
    pub(super) publisher: StatusPublisher,
    pub(super) sampler: TelemetrySampler,
    pub(super) supervisor: Supervisor,
    pub(super) samplers: HashMap<ResourceId, SamplerGuard>,
    cancel_waiters: HashMap<Uuid, Vec<oneshot::Sender<Result<Job>>>>,
    config: SchedulerConfig,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerMessage>, shutdown: CancellationToken) {
        tracing::info!(resources = self.state.inventory().len(), "Scheduler running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
            }
        }

        for (_, guard) in self.samplers.drain() {
            guard.stop().await;
        }
    }

    async fn handle(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit { spec, reply } => {
                let result = self.submit(spec).await;
                let _ = reply.send(result);
            }
            SchedulerMessage::Cancel { job_id, reply } => {
                self.cancel(job_id, reply).await;
            }
            SchedulerMessage::Get { job_id, reply } => {
                let _ = reply.send(self.state.get(job_id).cloned());
            }
            SchedulerMessage::List { reply } => {
                let _ = reply.send(self.state.list());
            }
            SchedulerMessage::Resources { reply } => {
                let _ = reply.send(self.state.resource_views());
            }
            SchedulerMessage::Subscribe { job_id, reply } => {
                let result = match self.state.get(job_id) {
                    Some(job) => Ok(self.publisher.subscribe_job(job)),
                    None => Err(SchedulerError::JobNotFound(job_id)),
                };
                let _ = reply.send(result);
            }
            SchedulerMessage::ContainerStarted { job_id, handle } => {
                self.container_started(job_id, handle).await;
            }
            SchedulerMessage::LaunchFailed { job_id, error } => {
                self.finalize(job_id, ExitOutcome::LaunchFailed(error)).await;
            }
            SchedulerMessage::ContainerExited { job_id, outcome } => {
                self.finalize(job_id, outcome).await;
            }
        }
    }

    async fn submit(&mut self, spec: JobSpec) -> Result<Job> {
        let job = self.state.submit(spec)?;
        tracing::info!(
            job_id = %job.id,
            name = %job.name,
            resource = %job.requested_resource,
            "Job submitted"
        );

        if let Err(e) = self.store.create(&job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist new job");
        }
        self.publisher.open(job.id);
        self.publisher.publish_status(StatusChange::of(&job));

        self.dispatch(&job.requested_resource).await;
        Ok(self.state.get(job.id).cloned().unwrap_or(job))
    }

    /// Start the next pending job of `resource` if it is free.
    pub(super) async fn dispatch(&mut self, resource: &ResourceId) {
        let Some(job) = self.state.dispatch(resource) else {
            return;
        };
        tracing::info!(job_id = %job.id, resource = %resource, image = %job.image, "Dispatching job");

        self.persist(&job).await;
        self.publisher.publish_status(StatusChange::of(&job));
        self.supervisor.launch(job);
    }

    pub(super) async fn dispatch_all(&mut self) {
        for resource in self.state.free_resources() {
            self.dispatch(&resource).await;
        }
    }

    async fn container_started(&mut self, job_id: Uuid, handle: ContainerHandle) {
        let Some((job, cancel_pending)) = self.state.mark_started(job_id, handle.clone()) else {
            return;
        };
        self.persist(&job).await;

        if let Some(resource) = job.assigned_resource.clone() {
            self.start_sampler(resource, job_id);
        }
        if cancel_pending {
            self.supervisor
                .stop(job_id, handle, self.config.stop_grace_period());
        }
    }

    pub(super) fn start_sampler(&mut self, resource: ResourceId, job_id: Uuid) {
        let guard = self.sampler.start(resource.clone(), job_id);
        self.samplers.insert(resource, guard);
    }

    async fn cancel(&mut self, job_id: Uuid, reply: oneshot::Sender<Result<Job>>) {
        match self.state.request_cancel(job_id) {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(CancelAction::Cancelled(job)) => {
                tracing::info!(job_id = %job_id, "Pending job cancelled");
                self.persist(&job).await;
                self.publisher.publish_status(StatusChange::of(&job));
                self.publisher.close(&job).await;
                let _ = reply.send(Ok(job));
            }
            Ok(CancelAction::Stop(handle)) => {
                tracing::info!(job_id = %job_id, "Cancelling running job");
                self.cancel_waiters.entry(job_id).or_default().push(reply);
                self.supervisor
                    .stop(job_id, handle, self.config.stop_grace_period());
            }
            Ok(CancelAction::AwaitStart) => {
                tracing::info!(job_id = %job_id, "Cancel requested while container is starting");
                self.cancel_waiters.entry(job_id).or_default().push(reply);
            }
        }
    }

    /// Record a running job's end, free its resource and start the next job.
    async fn finalize(&mut self, job_id: Uuid, outcome: ExitOutcome) {
        let Some((job, resource)) = self.state.on_exit(job_id, outcome) else {
            tracing::debug!(job_id = %job_id, "Exit for a job that is not running");
            return;
        };
        tracing::info!(
            job_id = %job_id,
            resource = %resource,
            status = %job.status,
            exit_code = ?job.exit.as_ref().and_then(|e| e.exit_code),
            "Job finished"
        );

        if let Some(guard) = self.samplers.remove(&resource) {
            guard.stop().await;
        }
        self.persist(&job).await;
        if self.supervisor.sandbox.remove_on_exit {
            if let Some(handle) = job.container.clone() {
                self.supervisor.reap(job_id, handle);
            }
        }
        self.publisher.publish_status(StatusChange::of(&job));
        self.publisher.close(&job).await;

        for waiter in self.cancel_waiters.remove(&job_id).unwrap_or_default() {
            let _ = waiter.send(Ok(job.clone()));
        }

        self.dispatch(&resource).await;
    }

    /// Write a job's mutable fields through to the store. Failures are
    /// logged; in-memory state stays authoritative.
    pub(super) async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.update(job.id, &JobUpdate::snapshot(job)).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist job update");
        }
    }
}

/// Cloneable client of the coordinator.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMessage>,
    telemetry: TelemetryCache,
    publisher: StatusPublisher,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    /// Create a pending job and dispatch it if its resource is free.
    /// Returns the job as recorded after dispatch.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        self.request(|reply| SchedulerMessage::Submit { spec, reply })
            .await?
    }

    /// Cancel a job. For a running job this resolves once the container's
    /// exit has been confirmed.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        self.request(|reply| SchedulerMessage::Cancel { job_id, reply })
            .await?
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.request(|reply| SchedulerMessage::Get { job_id, reply })
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.request(|reply| SchedulerMessage::List { reply }).await
    }

    pub async fn subscribe(&self, job_id: Uuid) -> Result<Subscription> {
        self.request(|reply| SchedulerMessage::Subscribe { job_id, reply })
            .await?
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceView>> {
        let mut views = self
            .request(|reply| SchedulerMessage::Resources { reply })
            .await?;
        for view in &mut views {
            view.telemetry = self.telemetry.latest(&view.resource.id).await;
        }
        Ok(views)
    }

    /// Durable log of a job. Empty until the job has started.
    pub async fn read_log(&self, job_id: Uuid) -> Result<String> {
        self.get(job_id).await?;
        Ok(self.publisher.read_log(job_id).await?)
    }
}
