use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::SandboxConfig;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, DeviceBinding, OutputStream,
    RuntimeError,
};

const OUTPUT_BUFFER: usize = 256;

/// Runs job containers through the `docker` CLI.
///
/// Containers are started detached with:
/// - The job workspace mounted at `/workspace` and its output at `/output`
/// - `--gpus device=<n>` for accelerator slots, nothing for the CPU slot
/// - No new privileges, optional network isolation and memory/CPU limits
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    config: SandboxConfig,
}

impl DockerRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            format!("--name={}", spec.name),
            format!("--label=trainq.job={}", spec.job_id),
        ];

        if let DeviceBinding::Gpu(index) = spec.device {
            args.push(format!("--gpus=device={}", index));
        }

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        if let Some(ref size) = self.config.shm_size {
            args.push(format!("--shm-size={}", size));
        }

        args.push("--security-opt=no-new-privileges".to_string());

        args.push(format!("--volume={}:/workspace:rw", spec.workspace.display()));
        args.push(format!("--volume={}:/output:rw", spec.output_dir.display()));
        args.push("--workdir=/workspace".to_string());

        for (key, value) in &spec.env {
            args.push(format!("--env={}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn docker(
        &self,
        action: &'static str,
        args: &[&str],
    ) -> Result<std::process::Output, RuntimeError> {
        Command::new(&self.config.docker_bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("{} {}: {}", action, self.config.docker_bin, e)))
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Arguments for `docker logs --follow`. Without `since`, docker replays the
/// container's whole output before following it.
pub fn logs_args(handle: &ContainerHandle, since: Option<DateTime<Utc>>) -> Vec<String> {
    let mut args = vec!["logs".to_string(), "--follow".to_string()];
    if let Some(since) = since {
        args.push(format!(
            "--since={}",
            since.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
    }
    args.push(handle.id.clone());
    args
}

/// Parse `docker inspect --format '{{.State.Status}} {{.State.ExitCode}}'`.
pub fn parse_inspect(stdout: &str) -> ContainerState {
    let mut parts = stdout.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let exit_code = parts.next().and_then(|c| c.parse::<i64>().ok());
    match status {
        "running" | "restarting" | "paused" => ContainerState::Running,
        "exited" | "dead" => ContainerState::Exited { exit_code },
        "created" | "removing" => ContainerState::Exited { exit_code: None },
        _ => ContainerState::Missing,
    }
}

fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let args = self.run_args(spec);
        tracing::info!(
            job_id = %spec.job_id,
            image = %spec.image,
            device = ?spec.device,
            "Starting container"
        );

        let output = Command::new(&self.config.docker_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::LaunchFailed(format!("cannot run {}: {}", self.config.docker_bin, e)))?;

        if !output.status.success() {
            let stderr = stderr_of(&output);
            return Err(RuntimeError::LaunchFailed(if stderr.is_empty() {
                format!("docker run exited with {:?}", output.status.code())
            } else {
                stderr
            }));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    fn stream_output(&self, handle: &ContainerHandle, since: Option<DateTime<Utc>>) -> OutputStream {
        let spawned = Command::new(&self.config.docker_bin)
            .args(logs_args(handle, since))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(container = %handle.name, error = %e, "Cannot follow container output");
                return futures::stream::empty().boxed();
            }
        };

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, tx);
        }
        // `docker logs --follow` exits on its own when the container does
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = grace.as_secs().to_string();
        let output = self
            .docker("docker stop", &["stop", "--time", grace_secs.as_str(), handle.id.as_str()])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if is_missing(&stderr) || stderr.contains("is not running") {
            return Ok(());
        }
        Err(RuntimeError::Command {
            action: "docker stop",
            message: stderr,
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let output = self.docker("docker wait", &["wait", handle.id.as_str()]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing(&stderr) {
                return Err(RuntimeError::NotFound(handle.name.clone()));
            }
            return Err(RuntimeError::Command {
                action: "docker wait",
                message: stderr,
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<i64>().map_err(|_| RuntimeError::Command {
            action: "docker wait",
            message: format!("unexpected output {:?}", stdout.trim()),
        })
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let output = self
            .docker(
                "docker inspect",
                &[
                    "inspect",
                    "--format",
                    "{{.State.Status}} {{.State.ExitCode}}",
                    handle.id.as_str(),
                ],
            )
            .await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing(&stderr) {
                return Ok(ContainerState::Missing);
            }
            return Err(RuntimeError::Command {
                action: "docker inspect",
                message: stderr,
            });
        }
        Ok(parse_inspect(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let output = self
            .docker("docker rm", &["rm", "--force", handle.id.as_str()])
            .await?;
        if output.status.success() || is_missing(&stderr_of(&output)) {
            return Ok(());
        }
        Err(RuntimeError::Command {
            action: "docker rm",
            message: stderr_of(&output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn spec(device: DeviceBinding) -> ContainerSpec {
        ContainerSpec {
            job_id: Uuid::nil(),
            name: "trainq-job-test".to_string(),
            image: "pytorch/pytorch:latest".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            device,
            workspace: PathBuf::from("/srv/jobs/a"),
            output_dir: PathBuf::from("/srv/outputs/a"),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        }
    }

    #[test]
    fn run_args_for_gpu_job() {
        let runtime = DockerRuntime::new(SandboxConfig::default());
        let args = runtime.run_args(&spec(DeviceBinding::Gpu(1)));

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--detach".to_string()));
        assert!(args.contains(&"--name=trainq-job-test".to_string()));
        assert!(args.contains(&"--gpus=device=1".to_string()));
        assert!(args.contains(&"--volume=/srv/jobs/a:/workspace:rw".to_string()));
        assert!(args.contains(&"--volume=/srv/outputs/a:/output:rw".to_string()));
        assert!(args.contains(&"--env=PYTHONUNBUFFERED=1".to_string()));
        assert!(args.contains(&"--security-opt=no-new-privileges".to_string()));
        assert!(!args.contains(&"--network=none".to_string()));

        // image then command close the list
        let n = args.len();
        assert_eq!(&args[n - 3..], &["pytorch/pytorch:latest", "python", "train.py"]);
    }

    #[test]
    fn run_args_for_cpu_job_with_limits() {
        let runtime = DockerRuntime::new(SandboxConfig {
            network_disabled: true,
            memory_limit: Some("8g".to_string()),
            cpu_limit: Some("4".to_string()),
            ..SandboxConfig::default()
        });
        let args = runtime.run_args(&spec(DeviceBinding::CpuOnly));

        assert!(!args.iter().any(|a| a.starts_with("--gpus")));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=8g".to_string()));
        assert!(args.contains(&"--cpus=4".to_string()));
    }

    #[test]
    fn inspect_output_parsing() {
        assert_eq!(parse_inspect("running 0\n"), ContainerState::Running);
        assert_eq!(
            parse_inspect("exited 137"),
            ContainerState::Exited {
                exit_code: Some(137)
            }
        );
        assert_eq!(
            parse_inspect("created 0"),
            ContainerState::Exited { exit_code: None }
        );
        assert_eq!(parse_inspect(""), ContainerState::Missing);
    }

    #[test]
    fn logs_args_follow_from_a_point_in_time() {
        let handle = ContainerHandle::for_job(Uuid::nil());
        assert_eq!(
            logs_args(&handle, None),
            vec!["logs", "--follow", handle.id.as_str()]
        );

        let since = DateTime::parse_from_rfc3339("2026-03-01T12:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let args = logs_args(&handle, Some(since));
        assert_eq!(args[2], "--since=2026-03-01T12:00:00.500000000Z");
        assert_eq!(args[3], handle.id);
    }

    /// A stand-in `docker` whose `logs` replays everything unless `--since`
    /// is given, like the real CLI does for a container that printed before.
    #[cfg(unix)]
    #[tokio::test]
    async fn reattached_output_skips_earlier_lines() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("docker");
        std::fs::write(
            &bin,
            "#!/bin/sh\n\
             case \"$1\" in\n\
             logs) case \"$3\" in --since=*) echo 'epoch 3' ;; *) printf 'epoch 1\\nepoch 2\\nepoch 3\\n' ;; esac ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = DockerRuntime::new(SandboxConfig {
            docker_bin: bin.display().to_string(),
            ..SandboxConfig::default()
        });
        let handle = ContainerHandle::for_job(Uuid::nil());

        let fresh: Vec<String> = runtime.stream_output(&handle, None).collect().await;
        assert_eq!(fresh, vec!["epoch 1", "epoch 2", "epoch 3"]);

        let resumed: Vec<String> = runtime
            .stream_output(&handle, Some(Utc::now()))
            .collect()
            .await;
        assert_eq!(resumed, vec!["epoch 3"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let runtime = DockerRuntime::new(SandboxConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..SandboxConfig::default()
        });
        let err = runtime.start(&spec(DeviceBinding::CpuOnly)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::LaunchFailed(_)));

        let err = runtime
            .inspect(&ContainerHandle::for_job(Uuid::nil()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
    }
}
