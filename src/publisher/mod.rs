//! Per-job fan-out of status changes, log lines and telemetry.
//!
//! Each job gets one broadcast channel plus a bounded history. Subscribers
//! replay the history and then follow the live channel; both are read under
//! the same lock the producers write under, so nothing is seen twice or
//! missed in between. Every log line also goes to a durable [`LogSink`].
//!
//! Closed channels keep their history for late subscribers, but only for
//! the most recently closed jobs. Older terminal jobs, and jobs that were
//! already terminal when the scheduler started, are described by a single
//! final status event.

mod sink;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::inventory::ResourceId;
use crate::scheduler::{ExitInfo, Job, JobStatus};
use crate::telemetry::TelemetrySample;

pub use sink::{FileLogSink, LogSink, MemoryLogSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub resource: Option<ResourceId>,
    pub exit: Option<ExitInfo>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            resource: job.assigned_resource.clone(),
            exit: job.exit.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Status(StatusChange),
    Log(LogLine),
    Telemetry(TelemetrySample),
}

struct JobChannel {
    // None once the job is terminal
    tx: Option<broadcast::Sender<JobEvent>>,
    history: VecDeque<JobEvent>,
    next_seq: u64,
}

impl JobChannel {
    fn push(&mut self, event: JobEvent, retain: bool, retention: usize) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if retain && retention > 0 {
            if self.history.len() == retention {
                self.history.pop_front();
            }
            self.history.push_back(event.clone());
        }
        // No receivers is fine: history still has it
        let _ = tx.send(event);
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            backlog: self.history.clone(),
            rx: self.tx.as_ref().map(|tx| tx.subscribe()),
            dropped: 0,
        }
    }
}

#[derive(Default)]
struct Channels {
    jobs: HashMap<Uuid, JobChannel>,
    // Closed jobs, oldest first
    closed: VecDeque<Uuid>,
}

impl Channels {
    fn retire(&mut self, job_id: Uuid, limit: usize) {
        self.closed.push_back(job_id);
        while self.closed.len() > limit {
            if let Some(evicted) = self.closed.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

struct Inner {
    channels: Mutex<Channels>,
    retention: usize,
    buffer: usize,
    closed_limit: usize,
    sink: Arc<dyn LogSink>,
}

#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Inner>,
}

impl StatusPublisher {
    /// `retention` bounds the replay history per job and `buffer` the queue
    /// of each live subscriber. History is kept for at most `closed_limit`
    /// closed jobs.
    pub fn new(
        retention: usize,
        buffer: usize,
        closed_limit: usize,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(Channels::default()),
                retention,
                buffer: buffer.max(1),
                closed_limit,
                sink,
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.inner.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the channel for a job. Reopening an existing channel is a no-op.
    pub fn open(&self, job_id: Uuid) {
        let buffer = self.inner.buffer;
        self.channels().jobs.entry(job_id).or_insert_with(|| JobChannel {
            tx: Some(broadcast::channel(buffer).0),
            history: VecDeque::new(),
            next_seq: 0,
        });
    }

    fn publish(&self, job_id: Uuid, event: JobEvent, retain: bool) {
        if let Some(channel) = self.channels().jobs.get_mut(&job_id) {
            channel.push(event, retain, self.inner.retention);
        }
    }

    pub fn publish_status(&self, change: StatusChange) {
        self.publish(change.job_id, JobEvent::Status(change), true);
    }

    /// Live-only: telemetry is not replayed to late subscribers.
    pub fn publish_telemetry(&self, job_id: Uuid, sample: TelemetrySample) {
        self.publish(job_id, JobEvent::Telemetry(sample), false);
    }

    /// Publish a line of job output and append it to the durable log.
    pub async fn publish_line(&self, job_id: Uuid, text: impl Into<String>) {
        let text = text.into();
        {
            let mut channels = self.channels();
            if let Some(channel) = channels.jobs.get_mut(&job_id) {
                let line = LogLine {
                    seq: channel.next_seq,
                    at: Utc::now(),
                    text: text.clone(),
                };
                channel.next_seq += 1;
                channel.push(JobEvent::Log(line), true, self.inner.retention);
            }
        }

        if let Err(e) = self.inner.sink.append(job_id, &text).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to write job log");
        }
    }

    /// Write the durable log header for a job about to start.
    pub async fn begin(&self, job: &Job) {
        if let Err(e) = self.inner.sink.begin(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to write job log header");
        }
    }

    /// End live delivery for a terminal job. Subscribers drain what they
    /// already have and then see end-of-stream. The history stays available
    /// until enough newer jobs have closed to push it out.
    pub async fn close(&self, job: &Job) {
        if job.started_at.is_some() {
            if let Err(e) = self.inner.sink.finish(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to write job log footer");
            }
        }
        let mut channels = self.channels();
        let was_open = channels
            .jobs
            .get_mut(&job.id)
            .map(|channel| channel.tx.take().is_some())
            .unwrap_or(false);
        if was_open {
            channels.retire(job.id, self.inner.closed_limit);
        }
    }

    /// Subscribe by id. A job without a channel yields an empty stream.
    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        match self.channels().jobs.get(&job_id) {
            Some(channel) => channel.subscribe(),
            None => Subscription::from_events(Vec::new()),
        }
    }

    /// Subscribe to a known job. A terminal job whose channel is gone, either
    /// evicted or never opened in this process, yields its final status.
    pub fn subscribe_job(&self, job: &Job) -> Subscription {
        match self.channels().jobs.get(&job.id) {
            Some(channel) => channel.subscribe(),
            None if job.status.is_terminal() => {
                let change = StatusChange {
                    at: job.completed_at.unwrap_or_else(Utc::now),
                    ..StatusChange::of(job)
                };
                Subscription::from_events(vec![JobEvent::Status(change)])
            }
            None => Subscription::from_events(Vec::new()),
        }
    }

    pub async fn read_log(&self, job_id: Uuid) -> std::io::Result<String> {
        self.inner.sink.read(job_id).await
    }

    pub fn is_open(&self, job_id: Uuid) -> bool {
        self.channels()
            .jobs
            .get(&job_id)
            .map(|c| c.tx.is_some())
            .unwrap_or(false)
    }
}

/// A subscriber's view of one job: replayed history, then live events.
///
/// A subscriber that falls more than the buffer behind loses the oldest
/// events; [`Subscription::dropped`] counts them.
pub struct Subscription {
    backlog: VecDeque<JobEvent>,
    rx: Option<broadcast::Receiver<JobEvent>>,
    dropped: u64,
}

impl Subscription {
    fn from_events(events: Vec<JobEvent>) -> Self {
        Self {
            backlog: events.into(),
            rx: None,
            dropped: 0,
        }
    }

    /// Next event, or `None` once the job is closed and drained.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;
    use futures::StreamExt;
    use std::path::PathBuf;

    fn publisher(retention: usize, buffer: usize) -> (StatusPublisher, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new());
        (StatusPublisher::new(retention, buffer, 8, sink.clone()), sink)
    }

    fn job() -> Job {
        let mut job = Job::new(JobSpec {
            name: "vit".to_string(),
            resource: ResourceId::gpu(0),
            image: "img".to_string(),
            workspace: PathBuf::from("/w"),
            output_dir: PathBuf::from("/o"),
            command: None,
        });
        job.started_at = Some(Utc::now());
        job
    }

    fn text(event: &JobEvent) -> &str {
        match event {
            JobEvent::Log(line) => &line.text,
            other => panic!("expected a log line, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_then_follows() {
        let (publisher, _) = publisher(100, 16);
        let id = Uuid::new_v4();
        publisher.open(id);
        publisher.publish_line(id, "one").await;
        publisher.publish_line(id, "two").await;

        let mut sub = publisher.subscribe(id);
        publisher.publish_line(id, "three").await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = sub.next().await.unwrap();
            seen.push(text(&event).to_string());
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (publisher, _) = publisher(2, 16);
        let id = Uuid::new_v4();
        publisher.open(id);
        for i in 0..5 {
            publisher.publish_line(id, format!("line {}", i)).await;
        }
        let mut sub = publisher.subscribe(id);
        assert_eq!(text(&sub.next().await.unwrap()), "line 3");
        assert_eq!(text(&sub.next().await.unwrap()), "line 4");
    }

    #[tokio::test]
    async fn log_lines_are_numbered() {
        let (publisher, _) = publisher(10, 16);
        let id = Uuid::new_v4();
        publisher.open(id);
        publisher.publish_line(id, "a").await;
        publisher.publish_line(id, "b").await;
        let mut sub = publisher.subscribe(id);
        let seqs: Vec<u64> = [sub.next().await.unwrap(), sub.next().await.unwrap()]
            .iter()
            .map(|e| match e {
                JobEvent::Log(line) => line.seq,
                _ => u64::MAX,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking() {
        let (publisher, sink) = publisher(0, 4);
        let id = Uuid::new_v4();
        publisher.open(id);
        let mut sub = publisher.subscribe(id);

        for i in 0..10 {
            publisher.publish_line(id, format!("{}", i)).await;
        }

        let first = sub.next().await.unwrap();
        assert_eq!(text(&first), "6");
        assert_eq!(sub.dropped(), 6);
        assert_eq!(sink.lines(id).len(), 10);
    }

    #[tokio::test]
    async fn telemetry_is_not_replayed() {
        let (publisher, _) = publisher(10, 16);
        let id = Uuid::new_v4();
        publisher.open(id);
        publisher.publish_telemetry(
            id,
            TelemetrySample {
                resource: ResourceId::gpu(0),
                utilization_pct: 10.0,
                memory_used_mb: 1,
                memory_total_mb: 2,
                temperature_c: None,
                at: Utc::now(),
            },
        );
        publisher.publish_line(id, "after").await;

        let mut sub = publisher.subscribe(id);
        assert_eq!(text(&sub.next().await.unwrap()), "after");
    }

    #[tokio::test]
    async fn close_ends_live_subscribers_after_drain() {
        let (publisher, sink) = publisher(10, 16);
        let mut job = job();
        publisher.open(job.id);
        let mut live = publisher.subscribe(job.id);

        publisher.publish_line(job.id, "done").await;
        job.status = JobStatus::Completed;
        publisher.publish_status(StatusChange::of(&job));
        publisher.close(&job).await;
        assert!(!publisher.is_open(job.id));

        assert_eq!(text(&live.next().await.unwrap()), "done");
        assert!(matches!(live.next().await, Some(JobEvent::Status(_))));
        assert!(live.next().await.is_none());

        // Joining after close still gets the history
        let late: Vec<JobEvent> = publisher.subscribe(job.id).into_stream().collect().await;
        assert_eq!(late.len(), 2);

        assert!(sink.footer_written(job.id));
    }

    #[tokio::test]
    async fn oldest_closed_history_is_evicted() {
        let sink = Arc::new(MemoryLogSink::new());
        let publisher = StatusPublisher::new(10, 16, 2, sink.clone());

        let mut jobs = Vec::new();
        for i in 0..3 {
            let mut job = job();
            publisher.open(job.id);
            publisher.publish_line(job.id, format!("output {}", i)).await;
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            publisher.publish_status(StatusChange::of(&job));
            publisher.close(&job).await;
            jobs.push(job);
        }

        // Only the final status is left for the oldest job
        let oldest: Vec<JobEvent> = publisher.subscribe_job(&jobs[0]).into_stream().collect().await;
        assert_eq!(oldest.len(), 1);
        match &oldest[0] {
            JobEvent::Status(change) => {
                assert_eq!(change.status, JobStatus::Completed);
                assert_eq!(Some(change.at), jobs[0].completed_at);
            }
            other => panic!("expected a status, got {:?}", other),
        }
        assert!(publisher.subscribe(jobs[0].id).next().await.is_none());

        for job in &jobs[1..] {
            let events: Vec<JobEvent> = publisher.subscribe_job(job).into_stream().collect().await;
            assert_eq!(events.len(), 2);
        }

        // Durable logs are untouched by eviction
        assert_eq!(sink.lines(jobs[0].id), vec!["output 0"]);
    }

    #[tokio::test]
    async fn closing_twice_retires_once() {
        let (publisher, _) = publisher(10, 16);
        let mut first = job();
        publisher.open(first.id);
        first.status = JobStatus::Failed;
        publisher.publish_status(StatusChange::of(&first));
        for _ in 0..20 {
            publisher.close(&first).await;
        }
        assert_eq!(publisher.channels().closed.len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_subscription_is_empty() {
        let (publisher, _) = publisher(10, 16);
        let mut sub = publisher.subscribe(Uuid::new_v4());
        assert!(sub.next().await.is_none());
    }
}
