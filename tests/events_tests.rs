
use std::time::Duration;

use test_harness::{assert_eventually, spec, test_config, TestScheduler, WAIT};
use trainq::config::SchedulerConfig;
use trainq::inventory::ResourceId;
use trainq::publisher::{JobEvent, Subscription};
use trainq::scheduler::JobStatus;
use trainq::SchedulerError;

/// Read events until the job's stream ends.
async fn drain(mut sub: Subscription) -> (Vec<JobEvent>, u64) {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, sub.next()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => panic!("event stream did not end"),
        }
    }
    (events, sub.dropped())
}

fn log_lines(events: &[JobEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Log(line) => Some(line.text.clone()),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[JobEvent]) -> Vec<JobStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Status(change) => Some(change.status),
            _ => None,
        })
        .collect()
}

async fn wait_for_lines(ts: &TestScheduler, job_id: uuid::Uuid, count: usize) {
    let sink = ts.sink.clone();
    assert_eventually(
        || {
            let sink = sink.clone();
            async move { sink.lines(job_id).len() >= count }
        },
        WAIT,
        "output lines never reached the log",
    )
    .await;
}

#[tokio::test]
async fn test_late_subscriber_gets_history_then_live_events() {
    let ts = TestScheduler::start().await;

    let job = ts.handle.submit(spec("train", ResourceId::gpu(0))).await.unwrap();
    assert!(ts.runtime.wait_for_start(job.id, WAIT).await);
    for line in ["epoch 1", "epoch 2", "epoch 3"] {
        assert!(ts.runtime.emit(job.id, line));
    }
    wait_for_lines(&ts, job.id, 3).await;

    let sub = ts.handle.subscribe(job.id).await.unwrap();
    assert!(ts.runtime.emit(job.id, "epoch 4"));
    ts.finish(job.id, 0).await;

    let (events, dropped) = drain(sub).await;
    assert_eq!(dropped, 0);
    assert_eq!(log_lines(&events), vec!["epoch 1", "epoch 2", "epoch 3", "epoch 4"]);
    assert_eq!(
        statuses(&events),
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );
    assert!(matches!(events.last(), Some(JobEvent::Status(_))));

    let seqs: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Log(line) => Some(line.seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_slow_subscriber_loses_oldest_events_but_log_is_complete() {
    let ts = TestScheduler::start_with_config(SchedulerConfig {
        log_retention: 0,
        subscriber_buffer: 4,
        ..test_config()
    })
    .await;

    let job = ts.handle.submit(spec("chatty", ResourceId::cpu())).await.unwrap();
    assert!(ts.runtime.wait_for_start(job.id, WAIT).await);
    let sub = ts.handle.subscribe(job.id).await.unwrap();

    for i in 0..20 {
        assert!(ts.runtime.emit(job.id, &format!("line {}", i)));
    }
    wait_for_lines(&ts, job.id, 20).await;
    ts.finish(job.id, 0).await;

    let (events, dropped) = drain(sub).await;
    assert!(dropped > 0);
    assert!(events.len() <= 4);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Status(change)) if change.status == JobStatus::Completed
    ));

    // What did arrive is the newest output, in order
    let received = log_lines(&events);
    let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
    assert!(expected.ends_with(&received));

    assert_eq!(ts.sink.lines(job.id), expected);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_after_close_gets_history_only() {
    let ts = TestScheduler::start().await;

    let job = ts.handle.submit(spec("short", ResourceId::cpu())).await.unwrap();
    assert!(ts.runtime.wait_for_start(job.id, WAIT).await);
    assert!(ts.runtime.emit(job.id, "hello"));
    ts.finish(job.id, 0).await;

    let sub = ts.handle.subscribe(job.id).await.unwrap();
    let (events, _) = drain(sub).await;
    assert_eq!(log_lines(&events), vec!["hello"]);
    assert_eq!(statuses(&events).last(), Some(&JobStatus::Completed));
    assert!(events.iter().all(|e| !matches!(e, JobEvent::Telemetry(_))));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_unknown_job() {
    let ts = TestScheduler::start().await;

    let err = ts.handle.subscribe(uuid::Uuid::new_v4()).await.err().unwrap();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));

    let err = ts.handle.read_log(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_busy_resource_reports_telemetry() {
    let ts = TestScheduler::start().await;

    let job = ts.handle.submit(spec("gpu", ResourceId::gpu(1))).await.unwrap();
    assert!(ts.runtime.wait_for_start(job.id, WAIT).await);

    let mut sub = ts.handle.subscribe(job.id).await.unwrap();
    let sample = tokio::time::timeout(WAIT, async {
        loop {
            match sub.next().await {
                Some(JobEvent::Telemetry(sample)) => return sample,
                Some(_) => continue,
                None => panic!("stream ended before telemetry"),
            }
        }
    })
    .await
    .expect("no telemetry sample");
    assert_eq!(sample.resource, ResourceId::gpu(1));
    assert_eq!(sample.memory_total_mb, 40960);

    let view = ts
        .handle
        .list_resources()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.resource.id == ResourceId::gpu(1))
        .unwrap();
    let telemetry = view.telemetry.expect("busy resource has telemetry");
    assert!((telemetry.utilization_pct - 87.5).abs() < f32::EPSILON);

    ts.finish(job.id, 0).await;

    // Sampling stops with the job
    tokio::time::sleep(Duration::from_millis(60)).await;
    let view = ts
        .handle
        .list_resources()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.resource.id == ResourceId::gpu(1))
        .unwrap();
    assert!(view.telemetry.is_none());

    ts.shutdown().await;
}

#[tokio::test]
async fn test_durable_log_has_header_output_and_footer() {
    let ts = TestScheduler::start().await;

    let job = ts.handle.submit(spec("logged", ResourceId::gpu(0))).await.unwrap();
    assert!(ts.runtime.wait_for_start(job.id, WAIT).await);
    assert!(ts.runtime.emit(job.id, "loss=0.42"));
    wait_for_lines(&ts, job.id, 1).await;
    ts.finish(job.id, 3).await;

    let log = ts.handle.read_log(job.id).await.unwrap();
    assert!(log.starts_with("Job started at "));
    assert!(log.contains("Resource: gpu:0\n"));
    assert!(log.contains("Image: pytorch/pytorch:latest\n"));
    assert!(log.contains("loss=0.42\n"));
    assert!(log.ends_with("Job failed (exit code 3)\n"));

    ts.shutdown().await;
}
