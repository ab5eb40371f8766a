use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::inventory::ResourceInventory;
use crate::publisher::FileLogSink;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::scheduler::Scheduler;
use crate::store::JsonDirJobStore;
use crate::telemetry::{SystemProbe, TelemetryProbe};

/// A single training host: inventory, scheduler and HTTP API.
pub struct Node {
    pub config: NodeConfig,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn TelemetryProbe>,
}

impl Node {
    /// A node running jobs through Docker and probing real hardware.
    pub fn new(config: NodeConfig) -> Self {
        let runtime = Arc::new(DockerRuntime::new(config.sandbox.clone()));
        Self {
            config,
            runtime,
            probe: Arc::new(SystemProbe::default()),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn TelemetryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// Startup order:
    /// 1. Discover resources
    /// 2. Open the job store and log directory under `data_dir`
    /// 3. Start the scheduler, which reconciles persisted jobs first
    /// 4. Serve the HTTP API
    ///
    /// Containers still running at shutdown are left alone; the next start
    /// picks them up again.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let inventory = ResourceInventory::discover(self.config.gpus).await;
        let store = JsonDirJobStore::open(self.config.jobs_dir()).await?;
        let sink = FileLogSink::open(self.config.logs_dir()).await?;

        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            "Opened job store and log directory"
        );

        let (scheduler, scheduler_task) = Scheduler::new(inventory, Arc::new(store), self.runtime)
            .with_probe(self.probe)
            .with_log_sink(Arc::new(sink))
            .with_config(self.config.scheduler.clone())
            .with_sandbox(self.config.sandbox.clone())
            .start(shutdown.clone())
            .await?;

        let state = ApiState {
            scheduler,
            shutdown: shutdown.clone(),
        };
        api::serve(self.config.listen_addr, state, shutdown.clone()).await?;

        shutdown.cancel();
        if let Err(e) = scheduler_task.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
