use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for Docker-based job execution.
///
/// Every job runs in its own container. The workspace is mounted at
/// `/workspace` and the output directory at `/output`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container CLI binary (`docker` or a compatible one)
    pub docker_bin: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "16g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4" for four CPUs)
    pub cpu_limit: Option<String>,
    /// Shared memory size, needed by data loaders that fork workers
    pub shm_size: Option<String>,
    /// Remove the container once its exit has been recorded
    pub remove_on_exit: bool,
    /// Command used when a job does not bring its own
    pub default_command: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            shm_size: Some("2g".to_string()),
            remove_on_exit: true,
            default_command: vec![
                "bash".to_string(),
                "-c".to_string(),
                "cd /workspace && pip install -r requirements.txt && python train.py".to_string(),
            ],
        }
    }
}

/// Timing and buffering knobs for the scheduler and the status publisher.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Grace period between SIGTERM and SIGKILL when cancelling a job
    pub stop_grace_period_ms: u64,
    /// Telemetry sampling interval for busy resources
    pub telemetry_interval_ms: u64,
    /// Events kept per job for late subscribers
    pub log_retention: usize,
    /// Per-subscriber queue length before the oldest events are dropped
    pub subscriber_buffer: usize,
    /// Closed jobs whose event history stays available for replay
    pub closed_job_history: usize,
    /// Capacity of the coordinator's request channel
    pub message_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_grace_period_ms: 10_000,
            telemetry_interval_ms: 2_000,
            log_retention: 1_000,
            subscriber_buffer: 256,
            closed_job_history: 256,
            message_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

/// How accelerators are discovered at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuDiscovery {
    /// Query `nvidia-smi`
    #[default]
    Auto,
    /// CPU slot only
    Disabled,
    /// Assume this many devices, indices `0..n`
    Fixed(u32),
}

impl FromStr for GpuDiscovery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(GpuDiscovery::Auto),
            "none" | "off" => Ok(GpuDiscovery::Disabled),
            other => other
                .parse::<u32>()
                .map(GpuDiscovery::Fixed)
                .map_err(|_| format!("expected auto, none or a device count, got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Root for the job store (`jobs/`) and durable logs (`logs/`)
    pub data_dir: PathBuf,
    pub gpus: GpuDiscovery,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("data"),
            gpus: GpuDiscovery::Auto,
            scheduler: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            listen_addr,
            data_dir,
            ..Default::default()
        }
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
