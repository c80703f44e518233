use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError, RedisBroker};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{
    after, EnqueueOptions, JobEnvelope, JobId, JobResult, JobState, JobStatus, QueueDepth, RecurringJob,
};
use crate::retry::{infra_policy, with_backoff, INFRA_TRIES};
use crate::scheduler::Scheduler;
use crate::store::{ResultStore, SqliteResultStore, StoreError};

/// Client used by the API process to enqueue jobs and read their outcome.
///
/// Producers and workers never talk to each other directly; everything goes
/// through the broker and the result store.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    config: QueueConfig,
}

impl Producer {
    /// Connect to the broker and result store named in `config`.
    ///
    /// # Example
    /// ```ignore
    /// let producer = Producer::connect(&QueueConfig::from_env()).await?;
    /// let id = producer.enqueue("send_email", &args, EnqueueOptions::new()).await?;
    /// ```
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let broker = RedisBroker::connect(&config.broker_url, &config.namespace, config.connect_timeout).await?;
        let results = SqliteResultStore::connect(&config.store_url)
            .await
            .map_err(StoreError::from)?;
        Ok(Self::new(Arc::new(broker), Arc::new(results), config))
    }

    pub fn new(broker: Arc<dyn Broker>, results: Arc<dyn ResultStore>, config: &QueueConfig) -> Self {
        Self {
            broker,
            results,
            config: config.clone(),
        }
    }

    /// Durably enqueue a job and return its id.
    ///
    /// Fails closed: if the broker never acknowledges the write, no id is returned.
    pub async fn enqueue<T: Serialize>(
        &self,
        job_type: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let envelope = self.envelope(job_type, payload, &options)?;
        self.push(&envelope).await?;

        info!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            not_before = %envelope.not_before,
            "Job enqueued"
        );
        Ok(envelope.job_id)
    }

    fn envelope(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<JobEnvelope, QueueError> {
        if job_type.is_empty() {
            return Err(QueueError::InvalidOptions("job_type must not be empty".into()));
        }
        let max_tries = options.max_tries.unwrap_or(self.config.default_max_tries);
        if max_tries == 0 {
            return Err(QueueError::InvalidOptions("max_tries must be at least 1".into()));
        }
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        if timeout.is_zero() {
            return Err(QueueError::InvalidOptions("timeout must be positive".into()));
        }

        let now = Utc::now();
        let not_before = options.delay.map_or(now, |delay| after(now, delay));
        Ok(JobEnvelope::new(job_type, payload, max_tries, timeout)
            .with_enqueued_at(now)
            .with_not_before(not_before))
    }

    /// A retried write that finds its own id already stored means an earlier
    /// try landed but its reply was lost, so it counts as success.
    async fn push(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let retried = AtomicBool::new(false);
        let (broker, retried) = (&self.broker, &retried);
        with_backoff("enqueue", INFRA_TRIES, infra_policy(), BrokerError::is_unavailable, move || {
            let is_retry = retried.swap(true, Ordering::Relaxed);
            async move {
                match broker.push(envelope, Utc::now()).await {
                    Err(BrokerError::DuplicateJob(id)) if is_retry && id == envelope.job_id => {
                        debug!(job_id = %id, "Earlier enqueue try already landed");
                        Ok(())
                    }
                    other => other,
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Current state of a job.
    ///
    /// Terminal jobs are answered from the result store, everything else from
    /// the broker. The store is read again after a broker miss because a worker
    /// may write the result and ack between the two reads.
    pub async fn get_status(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
        if let Some(result) = self.fetch_result(job_id).await? {
            return Ok(result.into());
        }

        let envelope = with_backoff("peek", INFRA_TRIES, infra_policy(), BrokerError::is_unavailable, move || {
            self.broker.peek(job_id)
        })
        .await?;
        if let Some(envelope) = envelope {
            return Ok(envelope.into());
        }

        match self.fetch_result(job_id).await? {
            Some(result) => Ok(result.into()),
            None => Err(QueueError::NotFound(job_id.clone())),
        }
    }

    async fn fetch_result(&self, job_id: &JobId) -> Result<Option<JobResult>, QueueError> {
        let result = with_backoff("fetch result", INFRA_TRIES, infra_policy(), |_: &StoreError| true, move || {
            self.results.fetch(job_id)
        })
        .await?;
        Ok(result)
    }

    /// Best-effort cancel. `true` only if the job was still waiting to be claimed.
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let cancelled = self.broker.cancel(job_id).await?;
        if cancelled {
            info!(job_id = %job_id, "Job cancelled");
        } else {
            debug!(job_id = %job_id, "Job not cancellable");
        }
        Ok(cancelled)
    }

    /// Enqueue a fresh copy of a `failed_terminal` job. The old result is left untouched.
    pub async fn resubmit(&self, job_id: &JobId) -> Result<JobId, QueueError> {
        let result = match self.fetch_result(job_id).await? {
            Some(result) => result,
            None => {
                let state = self.get_status(job_id).await?.state;
                return Err(QueueError::NotResettable {
                    job_id: job_id.clone(),
                    state,
                });
            }
        };
        if result.state != JobState::FailedTerminal {
            return Err(QueueError::NotResettable {
                job_id: job_id.clone(),
                state: result.state,
            });
        }

        let envelope = self.envelope(&result.job_type, result.payload, &EnqueueOptions::new())?;
        self.push(&envelope).await?;

        info!(
            job_id = %envelope.job_id,
            resubmitted_from = %job_id,
            job_type = %envelope.job_type,
            "Job resubmitted"
        );
        Ok(envelope.job_id)
    }

    /// Add or replace a recurring job with a cron schedule.
    ///
    /// `delay` in `options` is ignored; the schedule decides when each run is due.
    pub async fn schedule_recurring<T: Serialize>(
        &self,
        id: &str,
        cron: &str,
        job_type: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<RecurringJob, QueueError> {
        let now = Utc::now();
        let next_run = Scheduler::calculate_next_run(cron, now).map_err(QueueError::InvalidOptions)?;
        let template = self.envelope(job_type, serde_json::to_value(payload)?, &options)?;

        let recurring = RecurringJob {
            id: id.to_string(),
            cron: cron.to_string(),
            job_type: template.job_type,
            payload: template.payload,
            max_tries: template.max_tries,
            timeout: template.timeout,
            next_run,
            updated_at: now,
        };
        self.broker.upsert_recurring(&recurring).await?;

        info!(recurring_id = %id, cron = %cron, next_run = %next_run, "Recurring job scheduled");
        Ok(recurring)
    }

    pub async fn remove_recurring(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.broker.remove_recurring(id).await?)
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        Ok(self.broker.depth().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MockBroker};
    use serde_json::json;
    use std::time::Duration;

    async fn producer_with(broker: Arc<dyn Broker>) -> (Producer, Arc<SqliteResultStore>) {
        let results = Arc::new(SqliteResultStore::connect("sqlite::memory:").await.unwrap());
        let producer = Producer::new(broker, results.clone(), &QueueConfig::default());
        (producer, results)
    }

    async fn producer() -> (Producer, MemoryBroker, Arc<SqliteResultStore>) {
        let broker = MemoryBroker::new();
        let (producer, results) = producer_with(Arc::new(broker.clone())).await;
        (producer, broker, results)
    }

    #[tokio::test]
    async fn enqueue_applies_defaults_and_overrides() {
        let (producer, broker, _) = producer().await;

        let id = producer
            .enqueue("send_email", &json!({"to": "a@b.c"}), EnqueueOptions::new())
            .await
            .unwrap();
        let stored = broker.peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.max_tries, 5);
        assert_eq!(stored.timeout, Duration::from_secs(300));
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt, 0);

        let id = producer
            .enqueue(
                "send_email",
                &json!({}),
                EnqueueOptions::new()
                    .max_tries(2)
                    .timeout(Duration::from_secs(7))
                    .delay(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let stored = broker.peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.max_tries, 2);
        assert_eq!(stored.timeout, Duration::from_secs(7));
        assert!(stored.not_before >= stored.enqueued_at + chrono::Duration::seconds(10));
        assert_eq!(broker.depth().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_zero_tries() {
        let (producer, broker, _) = producer().await;
        let err = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new().max_tries(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
        assert_eq!(broker.depth().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn enqueue_fails_closed_when_broker_is_down() {
        let mut mock = MockBroker::new();
        mock.expect_push()
            .times(3)
            .returning(|_, _| Err(BrokerError::Unavailable("connection refused".into())));
        let (producer, _) = producer_with(Arc::new(mock)).await;

        let err = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn enqueue_does_not_retry_rejected_writes() {
        let mut mock = MockBroker::new();
        mock.expect_push()
            .times(1)
            .returning(|envelope, _| Err(BrokerError::DuplicateJob(envelope.job_id.clone())));
        let (producer, _) = producer_with(Arc::new(mock)).await;

        let err = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Broker(BrokerError::DuplicateJob(_))));
    }

    #[tokio::test]
    async fn enqueue_treats_own_duplicate_after_lost_reply_as_success() {
        let mut seq = mockall::Sequence::new();
        let mut mock = MockBroker::new();
        mock.expect_push()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BrokerError::Unavailable("reply lost".into())));
        mock.expect_push()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|envelope, _| Err(BrokerError::DuplicateJob(envelope.job_id.clone())));
        let (producer, _) = producer_with(Arc::new(mock)).await;

        let id = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new())
            .await
            .unwrap();
        assert!(!id.as_ref().is_empty());
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let (producer, _, _) = producer().await;
        let err = producer.get_status(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_follows_the_job() {
        let (producer, broker, results) = producer().await;
        let id = producer
            .enqueue("resize", &json!({"w": 10}), EnqueueOptions::new())
            .await
            .unwrap();
        assert_eq!(producer.get_status(&id).await.unwrap().state, JobState::Queued);

        let claimed = broker
            .claim("w1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .unwrap();
        let status = producer.get_status(&id).await.unwrap();
        assert_eq!(status.state, JobState::InProgress);
        assert_eq!(status.attempt, 1);

        results
            .record(&JobResult::succeeded(&claimed.envelope, json!("done")))
            .await
            .unwrap();
        broker.ack(&claimed.lease).await.unwrap();

        let status = producer.get_status(&id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.result.unwrap().attempts_used, 1);
    }

    #[tokio::test]
    async fn cancel_twice_returns_false_second_time() {
        let (producer, _, _) = producer().await;
        let id = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new())
            .await
            .unwrap();

        assert!(producer.cancel(&id).await.unwrap());
        assert!(!producer.cancel(&id).await.unwrap());
        assert!(matches!(
            producer.get_status(&id).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_after_claim_returns_false() {
        let (producer, broker, _) = producer().await;
        let id = producer
            .enqueue("noop", &json!(null), EnqueueOptions::new())
            .await
            .unwrap();
        broker
            .claim("w1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert!(!producer.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn resubmit_requires_failed_terminal() {
        let (producer, broker, results) = producer().await;
        let id = producer
            .enqueue("charge", &json!({"cents": 100}), EnqueueOptions::new().max_tries(1))
            .await
            .unwrap();

        let err = producer.resubmit(&id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotResettable { state: JobState::Queued, .. }
        ));

        let claimed = broker
            .claim("w1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .unwrap();
        results
            .record(&JobResult::failed(&claimed.envelope, "card declined"))
            .await
            .unwrap();
        broker.ack(&claimed.lease).await.unwrap();

        let fresh = producer.resubmit(&id).await.unwrap();
        assert_ne!(fresh, id);

        let copy = broker.peek(&fresh).await.unwrap().unwrap();
        assert_eq!(copy.job_type, "charge");
        assert_eq!(copy.payload, json!({"cents": 100}));
        assert_eq!(copy.attempt, 0);

        let old = producer.get_status(&id).await.unwrap();
        assert_eq!(old.state, JobState::FailedTerminal);
    }

    #[tokio::test]
    async fn recurring_jobs_validate_cron() {
        let (producer, broker, _) = producer().await;

        let err = producer
            .schedule_recurring("bad", "every tuesday", "report", &json!(null), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));

        let recurring = producer
            .schedule_recurring("nightly", "0 0 3 * * *", "report", &json!({"kind": "daily"}), EnqueueOptions::new())
            .await
            .unwrap();
        assert!(recurring.next_run > Utc::now());
        assert_eq!(broker.depth().await.unwrap().recurring, 1);

        assert!(producer.remove_recurring("nightly").await.unwrap());
        assert!(!producer.remove_recurring("nightly").await.unwrap());
    }
}
