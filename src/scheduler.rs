use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::QueueConfig;
use crate::job::{after, ClaimedJob, JobEnvelope, JobId, JobResult, JobState, JobTransition};
use crate::retry::{infra_policy, with_backoff, RetryPolicy, INFRA_TRIES};
use crate::store::{ResultStore, StoreError};

/// Largest number of delayed jobs moved per broker round trip.
const PROMOTE_BATCH: usize = 256;

/// Reason recorded when a job runs out of tries because its worker vanished.
pub(crate) const LEASE_EXPIRED: &str = "lease expired";

/// Background duties of a worker process: promoting due jobs, firing
/// recurring jobs and recovering jobs from crashed workers.
pub struct Scheduler {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    events: broadcast::Sender<JobTransition>,
    promote_interval: Duration,
    reap_interval: Duration,
    retry: RetryPolicy,
    /// Lease owner for jobs taken over from crashed workers. Unique per scheduler.
    reaper_id: String,
}

impl Scheduler {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        events: broadcast::Sender<JobTransition>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            broker,
            results,
            events,
            promote_interval: config.promote_interval,
            reap_interval: config.reap_interval,
            retry: config.retry,
            reaper_id: format!(
                "reaper-{}-{}",
                std::process::id(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            promote_interval = ?self.promote_interval,
            reap_interval = ?self.reap_interval,
            "Scheduler started"
        );

        let mut promote = tokio::time::interval(self.promote_interval);
        promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap = tokio::time::interval(self.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = promote.tick() => self.promote_tick(Utc::now()).await,
                _ = reap.tick() => self.reap_tick(Utc::now()).await,
            }
        }
    }

    /// Moves due delayed jobs onto the ready list, then fires due recurring jobs.
    pub async fn promote_tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.process_delayed_jobs(now).await {
            error!(error = %e, "Failed to promote delayed jobs");
        }

        if let Err(e) = self.process_recurring_jobs(now).await {
            error!(error = %e, "Failed to process recurring jobs");
        }
    }

    /// Takes over expired leases and retries or fails the jobs behind them.
    pub async fn reap_tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.process_expired_leases(now).await {
            error!(error = %e, "Failed to reap expired leases");
        }
    }

    async fn process_delayed_jobs(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        loop {
            let promoted = self.broker.promote_due(now, PROMOTE_BATCH).await?;
            if !promoted.is_empty() {
                debug!(count = promoted.len(), "Promoted delayed jobs");
            }
            for job_id in &promoted {
                self.emit_queued(job_id, now).await;
            }
            if promoted.len() < PROMOTE_BATCH {
                return Ok(());
            }
        }
    }

    async fn emit_queued(&self, job_id: &JobId, now: DateTime<Utc>) {
        if self.events.receiver_count() == 0 {
            return;
        }
        // promote_due only reports ids; the attempt count lives on the record
        let attempt = match self.broker.peek(job_id).await {
            Ok(Some(envelope)) => envelope.attempt,
            _ => return,
        };
        let _ = self.events.send(JobTransition {
            job_id: job_id.clone(),
            state: JobState::Queued,
            attempt,
            at: now,
        });
    }

    async fn process_recurring_jobs(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let recurring_jobs = self.broker.due_recurring(now).await?;

        for recurring in recurring_jobs {
            // Runs missed while no scheduler was alive are skipped, not replayed
            let next_run = match Self::calculate_next_run(&recurring.cron, now) {
                Ok(next) => next,
                Err(e) => {
                    error!(
                        recurring_id = %recurring.id,
                        cron = %recurring.cron,
                        error = %e,
                        "Invalid cron expression"
                    );
                    continue;
                }
            };

            let envelope = recurring.spawn().with_enqueued_at(now);
            let fired = match self.broker.fire_recurring(&recurring, next_run, &envelope).await {
                Ok(fired) => fired,
                Err(e) => {
                    error!(recurring_id = %recurring.id, error = %e, "Failed to fire recurring job");
                    false
                }
            };

            if fired {
                info!(
                    recurring_id = %recurring.id,
                    job_id = %envelope.job_id,
                    job_type = %recurring.job_type,
                    next_run = %next_run,
                    "Recurring job fired"
                );
                let _ = self.events.send(JobTransition {
                    job_id: envelope.job_id,
                    state: JobState::Queued,
                    attempt: 0,
                    at: now,
                });
            } else {
                debug!(recurring_id = %recurring.id, "Recurring job already fired elsewhere");
            }
        }

        Ok(())
    }

    async fn process_expired_leases(&self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let reaped = self.broker.reap_expired_leases(&self.reaper_id, now).await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "Recovering jobs from expired leases");
        }

        for job in reaped {
            let job_id = job.envelope.job_id.clone();
            match self.recover(job, now).await {
                Ok(()) => {}
                // another scheduler instance finished this one first
                Err(BrokerError::LeaseLost(_)) => {
                    debug!(job_id = %job_id, "Reaped job already handled");
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Failed to recover reaped job"),
            }
        }
        Ok(())
    }

    /// The expired attempt already counted at claim time, so `attempt` is the
    /// number of tries used.
    async fn recover(&self, job: ClaimedJob, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let ClaimedJob { mut envelope, lease } = job;

        if envelope.tries_exhausted() {
            let result = JobResult::failed(&envelope, LEASE_EXPIRED);
            let (results, result) = (&self.results, &result);
            match with_backoff("record result", INFRA_TRIES, infra_policy(), |_: &StoreError| true, move || {
                results.record(result)
            })
            .await
            {
                Ok(true) => {}
                Ok(false) => debug!(job_id = %envelope.job_id, "Result already recorded"),
                Err(e) => {
                    // still held by the reaper, so the next pass tries again
                    error!(job_id = %envelope.job_id, error = %e, "Failed to record result for reaped job");
                    return Ok(());
                }
            }

            self.broker.ack(&lease).await?;
            warn!(
                job_id = %envelope.job_id,
                job_type = %envelope.job_type,
                attempt = envelope.attempt,
                max_tries = envelope.max_tries,
                "Job failed permanently after lease expiry"
            );
            self.emit(&mut envelope, JobState::FailedTerminal, now);
        } else {
            let requeue_at = after(now, self.retry.delay(envelope.attempt));
            self.broker
                .release(&lease, requeue_at, Some(LEASE_EXPIRED.to_string()))
                .await?;
            info!(
                job_id = %envelope.job_id,
                job_type = %envelope.job_type,
                attempt = envelope.attempt,
                requeue_at = %requeue_at,
                "Requeued job after lease expiry"
            );
            self.emit(&mut envelope, JobState::FailedRetryable, now);
        }
        Ok(())
    }

    fn emit(&self, envelope: &mut JobEnvelope, next: JobState, at: DateTime<Utc>) {
        if let Err(e) = envelope.transition(next) {
            error!(job_id = %envelope.job_id, error = %e, "Unexpected job transition");
            return;
        }
        let _ = self.events.send(JobTransition {
            job_id: envelope.job_id.clone(),
            state: next,
            attempt: envelope.attempt,
            at,
        });
    }

    /// Calculate the first run of `cron_expr` strictly after `after`
    pub fn calculate_next_run(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        let schedule =
            Schedule::from_str(cron_expr).map_err(|e| format!("Invalid cron expression: {}", e))?;

        schedule
            .after(&after)
            .next()
            .ok_or_else(|| "No upcoming schedule".to_string())
    }
}
