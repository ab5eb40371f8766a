use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inventory::ResourceId;
use crate::publisher::StatusPublisher;
use crate::telemetry::{TelemetryCache, TelemetryProbe};

/// Spawns one polling task per busy resource.
#[derive(Clone)]
pub struct TelemetrySampler {
    probe: Arc<dyn TelemetryProbe>,
    cache: TelemetryCache,
    publisher: StatusPublisher,
    interval: Duration,
}

/// Keeps a resource's sampler alive. Call [`SamplerGuard::stop`] when the
/// occupying job exits; dropping the guard also ends the task.
pub struct SamplerGuard {
    resource: ResourceId,
    token: CancellationToken,
    cache: TelemetryCache,
}

impl TelemetrySampler {
    pub fn new(
        probe: Arc<dyn TelemetryProbe>,
        cache: TelemetryCache,
        publisher: StatusPublisher,
        interval: Duration,
    ) -> Self {
        Self {
            probe,
            cache,
            publisher,
            interval,
        }
    }

    pub fn cache(&self) -> &TelemetryCache {
        &self.cache
    }

    /// Sample `resource` every interval on behalf of `job_id`.
    pub fn start(&self, resource: ResourceId, job_id: Uuid) -> SamplerGuard {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let probe = self.probe.clone();
        let cache = self.cache.clone();
        let publisher = self.publisher.clone();
        let interval = self.interval;
        let task_resource = resource.clone();

        tokio::spawn(async move {
            let resource = task_resource;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sample = match probe.sample(&resource).await {
                    Ok(sample) => sample,
                    Err(e) => {
                        tracing::debug!(resource = %resource, error = %e, "Telemetry probe failed");
                        continue;
                    }
                };

                // Checked under the lock so nothing is cached or published
                // once stop has cleared the cache
                let mut samples = cache.inner().write().await;
                if task_token.is_cancelled() {
                    break;
                }
                samples.insert(resource.clone(), sample.clone());
                publisher.publish_telemetry(job_id, sample);
            }

            tracing::debug!(resource = %resource, job_id = %job_id, "Telemetry sampler stopped");
        });

        SamplerGuard {
            resource,
            token,
            cache: self.cache.clone(),
        }
    }
}

impl SamplerGuard {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// End sampling and drop the cached sample.
    pub async fn stop(self) {
        self.token.cancel();
        self.cache.clear(&self.resource).await;
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{JobEvent, MemoryLogSink};
    use crate::telemetry::StaticProbe;

    fn sampler() -> (TelemetrySampler, StatusPublisher) {
        let publisher = StatusPublisher::new(16, 16, 4, Arc::new(MemoryLogSink::new()));
        let probe = StaticProbe {
            utilization_pct: 50.0,
            memory_used_mb: 1024,
            memory_total_mb: 8192,
        };
        let sampler = TelemetrySampler::new(
            Arc::new(probe),
            TelemetryCache::new(),
            publisher.clone(),
            Duration::from_millis(10),
        );
        (sampler, publisher)
    }

    #[tokio::test]
    async fn samples_until_stopped() {
        let (sampler, publisher) = sampler();
        let job_id = Uuid::new_v4();
        publisher.open(job_id);
        let mut sub = publisher.subscribe(job_id);

        let gpu = ResourceId::gpu(0);
        let guard = sampler.start(gpu.clone(), job_id);

        let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        match event {
            JobEvent::Telemetry(sample) => {
                assert_eq!(sample.resource, gpu);
                assert_eq!(sample.memory_used_mb, 1024);
            }
            other => panic!("expected telemetry, got {:?}", other),
        }
        assert!(sampler.cache().latest(&gpu).await.is_some());

        guard.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sampler.cache().latest(&gpu).await.is_none());
    }
}
