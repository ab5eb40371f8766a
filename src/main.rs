use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use trainq::config::{GpuDiscovery, NodeConfig, SandboxConfig, SchedulerConfig};
use trainq::inventory::{ResourceInventory, ResourceKind};
use trainq::node::Node;
use trainq::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "trainq")]
#[command(version)]
#[command(about = "Single-host scheduler for containerized training jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and its HTTP API
    Server(ServerArgs),

    /// Print the resources this host offers and exit
    Resources {
        /// GPU discovery: auto, none, or a fixed device count
        #[arg(long, default_value = "auto")]
        gpus: GpuDiscovery,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory for the job store and job logs
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// GPU discovery: auto, none, or a fixed device count
    #[arg(long, default_value = "auto")]
    gpus: GpuDiscovery,

    /// Seconds between SIGTERM and SIGKILL when cancelling a job
    #[arg(long, default_value = "10")]
    stop_grace_secs: u64,

    /// Telemetry sampling interval for busy resources
    #[arg(long, default_value = "2000")]
    telemetry_interval_ms: u64,

    /// Events kept per job for subscribers that join late
    #[arg(long, default_value = "1000")]
    log_retention: usize,

    /// Per-subscriber queue length before old events are dropped
    #[arg(long, default_value = "256")]
    subscriber_buffer: usize,

    /// Finished jobs whose event history is kept for replay
    #[arg(long, default_value = "256")]
    closed_job_history: usize,

    // === Sandbox Options ===
    /// Container CLI to drive (docker or a compatible one)
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Run job containers without network access
    #[arg(long)]
    network_disabled: bool,

    /// Memory limit per job container (e.g. "16g")
    #[arg(long)]
    memory_limit: Option<String>,

    /// CPU limit per job container (e.g. "4")
    #[arg(long)]
    cpu_limit: Option<String>,

    /// Shared memory size per job container
    #[arg(long, default_value = "2g")]
    shm_size: String,

    /// Keep exited containers instead of removing them
    #[arg(long)]
    keep_containers: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let sandbox = SandboxConfig {
        docker_bin: args.docker_bin,
        network_disabled: args.network_disabled,
        memory_limit: args.memory_limit,
        cpu_limit: args.cpu_limit,
        shm_size: Some(args.shm_size),
        remove_on_exit: !args.keep_containers,
        ..SandboxConfig::default()
    };

    let scheduler = SchedulerConfig {
        stop_grace_period_ms: args.stop_grace_secs * 1000,
        telemetry_interval_ms: args.telemetry_interval_ms,
        log_retention: args.log_retention,
        subscriber_buffer: args.subscriber_buffer,
        closed_job_history: args.closed_job_history,
        ..SchedulerConfig::default()
    };

    let config = NodeConfig {
        listen_addr: SocketAddr::new(args.host, args.port),
        data_dir: args.data_dir,
        gpus: args.gpus,
        scheduler,
        sandbox,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        gpus = ?config.gpus,
        network_disabled = config.sandbox.network_disabled,
        "Starting trainq node"
    );

    let shutdown = install_shutdown_handler()?;
    Node::new(config).run(shutdown).await
}

// =============================================================================
// Resources Command
// =============================================================================

async fn print_resources(
    gpus: GpuDiscovery,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let inventory = ResourceInventory::discover(gpus).await;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(inventory.list())?);
        }
        OutputFormat::Table => {
            println!("{:<8} {:<6} {:<12} NAME", "ID", "KIND", "MEMORY");
            for resource in inventory.list() {
                let kind = match resource.kind {
                    ResourceKind::Cpu => "cpu",
                    ResourceKind::Gpu { .. } => "gpu",
                };
                let memory = resource
                    .capacity
                    .memory_total_mb
                    .map(|mb| format!("{} MiB", mb))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<6} {:<12} {}",
                    resource.id, kind, memory, resource.capacity.name
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Resources { gpus, output } => {
            print_resources(gpus, output).await?;
        }
    }

    Ok(())
}
