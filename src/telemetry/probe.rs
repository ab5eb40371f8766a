use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sysinfo::System;
use tokio::process::Command;

use crate::inventory::ResourceId;
use crate::telemetry::{TelemetryError, TelemetrySample};

const MIB: u64 = 1024 * 1024;

#[async_trait]
pub trait TelemetryProbe: Send + Sync + 'static {
    async fn sample(&self, resource: &ResourceId) -> Result<TelemetrySample, TelemetryError>;
}

/// Queries one accelerator through `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    bin: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            bin: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

/// Parse one line of
/// `--query-gpu=index,utilization.gpu,memory.used,memory.total,temperature.gpu`.
pub fn parse_gpu_sample(resource: &ResourceId, line: &str) -> Option<TelemetrySample> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return None;
    }
    Some(TelemetrySample {
        resource: resource.clone(),
        utilization_pct: fields[1].parse().ok()?,
        memory_used_mb: fields[2].parse().ok()?,
        memory_total_mb: fields[3].parse().ok()?,
        // "[N/A]" on devices without a sensor
        temperature_c: fields[4].parse().ok(),
        at: Utc::now(),
    })
}

#[async_trait]
impl TelemetryProbe for NvidiaSmiProbe {
    async fn sample(&self, resource: &ResourceId) -> Result<TelemetrySample, TelemetryError> {
        let index = resource
            .gpu_index()
            .ok_or_else(|| TelemetryError::Unsupported(resource.clone()))?;

        let output = Command::new(&self.bin)
            .arg("--query-gpu=index,utilization.gpu,memory.used,memory.total,temperature.gpu")
            .arg("--format=csv,noheader,nounits")
            .arg(format!("--id={}", index))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TelemetryError::Command(format!("{}: {}", self.bin, e)))?;

        if !output.status.success() {
            return Err(TelemetryError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or_default();
        parse_gpu_sample(resource, line).ok_or_else(|| TelemetryError::Parse(line.to_string()))
    }
}

/// Global CPU usage and memory of the host, for the CPU slot.
pub struct HostProbe {
    system: Mutex<System>,
}

impl Default for HostProbe {
    fn default() -> Self {
        let mut system = System::new();
        // Usage is computed between two refreshes; prime the first one
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl HostProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryProbe for HostProbe {
    async fn sample(&self, resource: &ResourceId) -> Result<TelemetrySample, TelemetryError> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        system.refresh_memory();
        Ok(TelemetrySample {
            resource: resource.clone(),
            utilization_pct: system.global_cpu_info().cpu_usage(),
            memory_used_mb: system.used_memory() / MIB,
            memory_total_mb: system.total_memory() / MIB,
            temperature_c: None,
            at: Utc::now(),
        })
    }
}

/// Routes accelerators to `nvidia-smi` and the CPU slot to the host probe.
#[derive(Default)]
pub struct SystemProbe {
    gpu: NvidiaSmiProbe,
    host: HostProbe,
}

#[async_trait]
impl TelemetryProbe for SystemProbe {
    async fn sample(&self, resource: &ResourceId) -> Result<TelemetrySample, TelemetryError> {
        if resource.gpu_index().is_some() {
            self.gpu.sample(resource).await
        } else {
            self.host.sample(resource).await
        }
    }
}

/// Reports the same readings for every resource. Used for dry runs where no
/// real hardware backs the jobs.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub utilization_pct: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

#[async_trait]
impl TelemetryProbe for StaticProbe {
    async fn sample(&self, resource: &ResourceId) -> Result<TelemetrySample, TelemetryError> {
        Ok(TelemetrySample {
            resource: resource.clone(),
            utilization_pct: self.utilization_pct,
            memory_used_mb: self.memory_used_mb,
            memory_total_mb: self.memory_total_mb,
            temperature_c: None,
            at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_sample() {
        let gpu = ResourceId::gpu(1);
        let sample = parse_gpu_sample(&gpu, "1, 87, 20312, 24576, 71").unwrap();
        assert_eq!(sample.resource, gpu);
        assert_eq!(sample.utilization_pct, 87.0);
        assert_eq!(sample.memory_used_mb, 20312);
        assert_eq!(sample.memory_total_mb, 24576);
        assert_eq!(sample.temperature_c, Some(71.0));

        let no_sensor = parse_gpu_sample(&gpu, "1, 0, 5, 24576, [N/A]").unwrap();
        assert_eq!(no_sensor.temperature_c, None);

        assert!(parse_gpu_sample(&gpu, "1, 87").is_none());
        assert!(parse_gpu_sample(&gpu, "1, busy, 1, 2, 3").is_none());
    }

    #[tokio::test]
    async fn nvidia_probe_rejects_cpu_slot() {
        let err = NvidiaSmiProbe::default()
            .sample(&ResourceId::cpu())
            .await
            .unwrap_err();
        assert_eq!(err, TelemetryError::Unsupported(ResourceId::cpu()));
    }

    #[tokio::test]
    async fn missing_nvidia_smi_is_a_command_error() {
        let err = NvidiaSmiProbe::new("/nonexistent/nvidia-smi")
            .sample(&ResourceId::gpu(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Command(_)));
    }

    #[tokio::test]
    async fn host_probe_reports_memory() {
        let sample = HostProbe::new().sample(&ResourceId::cpu()).await.unwrap();
        assert_eq!(sample.resource, ResourceId::cpu());
        assert!(sample.memory_total_mb > 0);
        assert!(sample.temperature_c.is_none());
    }
}
