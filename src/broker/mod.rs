//! Durable queue store: the broker primitives every worker and producer share.
//!
//! All cross-process coordination goes through these operations. Each one is
//! atomic on the broker side; callers never hold in-process locks on job state.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{ClaimedJob, JobEnvelope, JobId, Lease, QueueDepth, RecurringJob};

pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseLost(JobId),
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("corrupt broker record: {0}")]
    Corrupt(String),
    #[error("broker command failed: {0}")]
    Command(String),
}

impl BrokerError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Corrupt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Inserts a new job. Due jobs become claimable immediately, the rest wait in the delayed set.
    async fn push(&self, envelope: &JobEnvelope, now: DateTime<Utc>) -> Result<()>;

    /// Pops one eligible job, bumps its attempt counter and leases it to `worker_id`.
    async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>>;

    async fn renew(&self, lease: &Lease, lease_duration: Duration, now: DateTime<Utc>) -> Result<Lease>;

    /// Removes a job and its lease for good.
    async fn ack(&self, lease: &Lease) -> Result<()>;

    /// Drops the lease and parks the job in the delayed set until `requeue_at`.
    async fn release(
        &self,
        lease: &Lease,
        requeue_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Hands every expired lease, and every job an earlier reap pass still holds,
    /// to `reaper_id` and returns them.
    async fn reap_expired_leases(&self, reaper_id: &str, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>>;

    /// Moves up to `limit` delayed jobs whose `not_before` has passed onto the ready list.
    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Removes a job that has never been claimed. Parked retries and leased jobs are refused.
    async fn cancel(&self, job_id: &JobId) -> Result<bool>;

    async fn peek(&self, job_id: &JobId) -> Result<Option<JobEnvelope>>;

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()>;

    async fn remove_recurring(&self, id: &str) -> Result<bool>;

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>>;

    /// Advances `recurring` to `next_run` and pushes `envelope`, only if nobody
    /// else fired this run first.
    async fn fire_recurring(
        &self,
        recurring: &RecurringJob,
        next_run: DateTime<Utc>,
        envelope: &JobEnvelope,
    ) -> Result<bool>;

    async fn depth(&self) -> Result<QueueDepth>;
}
