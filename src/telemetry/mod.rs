//! Hardware telemetry for busy resources.
//!
//! A [`TelemetrySampler`] polls a [`TelemetryProbe`] on a fixed interval
//! while a job occupies a resource, caches the latest sample per resource and
//! forwards each sample to the job's subscribers.

mod probe;
mod sampler;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::inventory::ResourceId;

pub use probe::{parse_gpu_sample, HostProbe, NvidiaSmiProbe, StaticProbe, SystemProbe, TelemetryProbe};
pub use sampler::{SamplerGuard, TelemetrySampler};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("probe command failed: {0}")]
    Command(String),

    #[error("unparsable probe output: {0:?}")]
    Parse(String),

    #[error("no probe for resource {0}")]
    Unsupported(ResourceId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub resource: ResourceId,
    pub utilization_pct: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: Option<f32>,
    pub at: DateTime<Utc>,
}

/// Latest sample per busy resource. Written by samplers, read by
/// resource listings.
#[derive(Debug, Clone, Default)]
pub struct TelemetryCache {
    samples: Arc<RwLock<HashMap<ResourceId, TelemetrySample>>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self, resource: &ResourceId) -> Option<TelemetrySample> {
        self.samples.read().await.get(resource).cloned()
    }

    pub async fn clear(&self, resource: &ResourceId) {
        self.samples.write().await.remove(resource);
    }

    pub(crate) fn inner(&self) -> &RwLock<HashMap<ResourceId, TelemetrySample>> {
        &self.samples
    }
}
