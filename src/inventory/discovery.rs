use std::process::Stdio;

use sysinfo::System;
use tokio::process::Command;

use super::{Capacity, Resource, ResourceId, ResourceKind};

/// The CPU slot, sized from the host.
pub fn cpu_resource() -> Resource {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let brand = sys.global_cpu_info().brand().trim().to_string();
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .ok();

    Resource {
        id: ResourceId::cpu(),
        kind: ResourceKind::Cpu,
        capacity: Capacity {
            name: if brand.is_empty() {
                "CPU".to_string()
            } else {
                brand
            },
            memory_total_mb: Some(sys.total_memory() / (1024 * 1024)),
            cores,
        },
    }
}

/// Enumerate NVIDIA devices with `nvidia-smi`. Any failure yields no GPUs.
pub async fn discover_gpus() -> Vec<Resource> {
    let result = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match result {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::warn!(
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "nvidia-smi failed, continuing without GPUs"
            );
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(error = %e, "nvidia-smi not available, continuing without GPUs");
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_gpu_line(line);
            if parsed.is_none() {
                tracing::warn!(line, "Unparsable nvidia-smi line");
            }
            parsed
        })
        .collect()
}

/// Parse one `index, name, memory.total` line.
pub fn parse_gpu_line(line: &str) -> Option<Resource> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return None;
    }
    let index: u32 = parts[0].parse().ok()?;
    let memory_total_mb = parts[2].parse::<u64>().ok();
    Some(Resource::gpu(index, parts[1], memory_total_mb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_line() {
        let gpu = parse_gpu_line("0, NVIDIA GeForce RTX 3090, 24576").unwrap();
        assert_eq!(gpu.id, ResourceId::gpu(0));
        assert_eq!(gpu.capacity.name, "NVIDIA GeForce RTX 3090");
        assert_eq!(gpu.capacity.memory_total_mb, Some(24576));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_gpu_line("").is_none());
        assert!(parse_gpu_line("zero, A100, 40960").is_none());
        assert!(parse_gpu_line("0, A100").is_none());
    }

    #[test]
    fn unknown_memory_is_tolerated() {
        let gpu = parse_gpu_line("2, A100, [N/A]").unwrap();
        assert_eq!(gpu.capacity.memory_total_mb, None);
    }

    #[test]
    fn cpu_resource_has_cores() {
        let cpu = cpu_resource();
        assert_eq!(cpu.id, ResourceId::cpu());
        assert!(cpu.capacity.cores.unwrap_or(0) >= 1);
    }
}
