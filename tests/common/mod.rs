#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobwire::{
    HandlerRegistry, JobId, JobState, JobTransition, MemoryBroker, Producer, QueueConfig,
    RetryPolicy, SqliteResultStore, WorkerRuntime,
};
use tokio::sync::broadcast;

pub struct Harness {
    pub broker: MemoryBroker,
    pub results: Arc<SqliteResultStore>,
    pub producer: Producer,
    pub runtime: WorkerRuntime,
    pub config: QueueConfig,
}

/// Intervals short enough that a whole retry cycle takes well under a second.
pub fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_concurrency(4)
        .with_lease_duration(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
        .with_promote_interval(Duration::from_millis(10))
        .with_reap_interval(Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ))
}

pub async fn harness<F>(config: QueueConfig, factory: F) -> Harness
where
    F: Fn() -> HandlerRegistry + Send + Sync + 'static,
{
    let broker = MemoryBroker::new();
    let results = Arc::new(SqliteResultStore::connect("sqlite::memory:").await.unwrap());
    let producer = Producer::new(Arc::new(broker.clone()), results.clone(), &config);
    let runtime = WorkerRuntime::new(config.clone(), Arc::new(broker.clone()), results.clone(), factory).unwrap();
    Harness {
        broker,
        results,
        producer,
        runtime,
        config,
    }
}

/// Collects the transitions of `job_id` until it reaches `until`.
pub async fn transitions_until(
    rx: &mut broadcast::Receiver<JobTransition>,
    job_id: &JobId,
    until: JobState,
) -> Vec<JobTransition> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(event) => event.unwrap(),
            Err(_) => panic!("job {job_id} never reached {until}, saw {seen:?}"),
        };
        if &event.job_id != job_id {
            continue;
        }
        let done = event.state == until;
        seen.push(event);
        if done {
            return seen;
        }
    }
}
