//! Static inventory of schedulable resources.
//!
//! The inventory is built once at boot and never changes afterwards. It
//! always contains the CPU slot (`"cpu"`) followed by one entry per
//! accelerator (`"gpu:<index>"`). Busy/free state is not tracked here; the
//! scheduler owns that.

mod discovery;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use discovery::{cpu_resource, discover_gpus, parse_gpu_line};

use crate::config::GpuDiscovery;

const CPU_ID: &str = "cpu";
const GPU_PREFIX: &str = "gpu:";

/// Identifier of a resource slot: `cpu` or `gpu:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    pub fn cpu() -> Self {
        Self(CPU_ID.to_string())
    }

    pub fn gpu(index: u32) -> Self {
        Self(format!("{}{}", GPU_PREFIX, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device index for accelerator slots, `None` for the CPU slot.
    pub fn gpu_index(&self) -> Option<u32> {
        self.0.strip_prefix(GPU_PREFIX)?.parse().ok()
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == CPU_ID {
            return Ok(Self::cpu());
        }
        match s.strip_prefix(GPU_PREFIX).map(str::parse::<u32>) {
            Some(Ok(index)) => Ok(Self::gpu(index)),
            _ => Err(format!("expected \"cpu\" or \"gpu:<index>\", got {:?}", s)),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Gpu { index: u32 },
}

/// What a resource offers, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub name: String,
    pub memory_total_mb: Option<u64>,
    pub cores: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub capacity: Capacity,
}

impl Resource {
    pub fn gpu(index: u32, name: impl Into<String>, memory_total_mb: Option<u64>) -> Self {
        Self {
            id: ResourceId::gpu(index),
            kind: ResourceKind::Gpu { index },
            capacity: Capacity {
                name: name.into(),
                memory_total_mb,
                cores: None,
            },
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.kind, ResourceKind::Gpu { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceInventory {
    resources: Vec<Resource>,
}

impl ResourceInventory {
    /// Build an inventory from a resource list. A CPU slot is added when the
    /// list does not contain one, and duplicate ids keep their first entry.
    pub fn new(resources: Vec<Resource>) -> Self {
        let mut ordered: Vec<Resource> = Vec::with_capacity(resources.len() + 1);
        if !resources.iter().any(|r| r.kind == ResourceKind::Cpu) {
            ordered.push(cpu_resource());
        }
        for resource in resources {
            if ordered.iter().any(|r| r.id == resource.id) {
                tracing::warn!(resource = %resource.id, "Duplicate resource ignored");
                continue;
            }
            ordered.push(resource);
        }
        ordered.sort_by_key(|r| match r.kind {
            ResourceKind::Cpu => (0, 0),
            ResourceKind::Gpu { index } => (1, index),
        });
        Self { resources: ordered }
    }

    /// Discover the host's resources according to `mode`.
    pub async fn discover(mode: GpuDiscovery) -> Self {
        let gpus = match mode {
            GpuDiscovery::Disabled => Vec::new(),
            GpuDiscovery::Fixed(count) => (0..count)
                .map(|index| Resource::gpu(index, format!("GPU {}", index), None))
                .collect(),
            GpuDiscovery::Auto => discover_gpus().await,
        };

        let mut resources = vec![cpu_resource()];
        resources.extend(gpus);
        let inventory = Self::new(resources);

        tracing::info!(
            resources = ?inventory.ids().iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            "Resource inventory ready"
        );
        inventory
    }

    pub fn list(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| &r.id == id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(|r| r.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
