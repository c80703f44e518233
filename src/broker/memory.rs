//! Single-process broker. Every operation runs under one mutex, which gives the
//! same atomicity the Redis scripts give across processes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Broker, BrokerError, Result};
use crate::job::{after, ClaimedJob, JobEnvelope, JobId, JobState, Lease, QueueDepth, RecurringJob};

#[derive(Default)]
struct MemoryQueue {
    jobs: HashMap<JobId, JobEnvelope>,
    ready: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    leases: HashMap<JobId, Lease>,
    reaped: BTreeSet<JobId>,
    recurring: HashMap<String, RecurringJob>,
}

impl MemoryQueue {
    fn owned_lease(&self, lease: &Lease) -> Result<()> {
        match self.leases.get(&lease.job_id) {
            Some(held) if held.worker_id == lease.worker_id => Ok(()),
            _ => Err(BrokerError::LeaseLost(lease.job_id.clone())),
        }
    }

    fn enqueue(&mut self, envelope: JobEnvelope, now: DateTime<Utc>) {
        let id = envelope.job_id.clone();
        if envelope.not_before <= now {
            self.ready.push_back(id.clone());
        } else {
            self.delayed.insert((envelope.not_before, id.clone()));
        }
        self.jobs.insert(id, envelope);
    }
}

/// In-memory [`Broker`]. Clones share the same queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<MemoryQueue>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueue> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, envelope: &JobEnvelope, now: DateTime<Utc>) -> Result<()> {
        let mut queue = self.lock();
        if queue.jobs.contains_key(&envelope.job_id) {
            return Err(BrokerError::DuplicateJob(envelope.job_id.clone()));
        }
        queue.enqueue(envelope.clone(), now);
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        let mut queue = self.lock();
        while let Some(id) = queue.ready.pop_front() {
            let Some(job) = queue.jobs.get_mut(&id) else {
                continue;
            };
            job.attempt += 1;
            job.state = JobState::InProgress;
            let envelope = job.clone();

            let lease = Lease {
                job_id: id.clone(),
                worker_id: worker_id.to_string(),
                expires_at: after(now, lease_duration),
            };
            queue.leases.insert(id, lease.clone());
            return Ok(Some(ClaimedJob { envelope, lease }));
        }
        Ok(None)
    }

    async fn renew(&self, lease: &Lease, lease_duration: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let mut queue = self.lock();
        queue.owned_lease(lease)?;
        let renewed = Lease {
            expires_at: after(now, lease_duration),
            ..lease.clone()
        };
        queue.leases.insert(lease.job_id.clone(), renewed.clone());
        Ok(renewed)
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut queue = self.lock();
        queue.owned_lease(lease)?;
        queue.leases.remove(&lease.job_id);
        queue.reaped.remove(&lease.job_id);
        queue.jobs.remove(&lease.job_id);
        Ok(())
    }

    async fn release(
        &self,
        lease: &Lease,
        requeue_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut queue = self.lock();
        queue.owned_lease(lease)?;
        queue.leases.remove(&lease.job_id);
        queue.reaped.remove(&lease.job_id);

        let Some(job) = queue.jobs.get_mut(&lease.job_id) else {
            return Err(BrokerError::Corrupt(format!(
                "leased job {} has no record",
                lease.job_id
            )));
        };
        job.state = JobState::FailedRetryable;
        job.not_before = requeue_at;
        job.last_error = last_error;
        queue.delayed.insert((requeue_at, lease.job_id.clone()));
        Ok(())
    }

    async fn reap_expired_leases(&self, reaper_id: &str, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        let mut queue = self.lock();
        let expired: Vec<JobId> = queue
            .leases
            .values()
            .filter(|l| l.expires_at <= now && !queue.reaped.contains(&l.job_id))
            .map(|l| l.job_id.clone())
            .collect();
        queue.reaped.extend(expired);

        // the caller takes over everything reaped, including another reaper's leftovers
        let MemoryQueue {
            jobs, leases, reaped, ..
        } = &mut *queue;
        let mut out = Vec::new();
        for id in reaped.iter() {
            if let (Some(envelope), Some(lease)) = (jobs.get(id), leases.get_mut(id)) {
                lease.worker_id = reaper_id.to_string();
                out.push(ClaimedJob {
                    envelope: envelope.clone(),
                    lease: lease.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let mut queue = self.lock();
        let due: Vec<(DateTime<Utc>, JobId)> = queue
            .delayed
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .cloned()
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for entry in due {
            queue.delayed.remove(&entry);
            let id = entry.1;
            if let Some(job) = queue.jobs.get_mut(&id) {
                job.state = JobState::Queued;
                queue.ready.push_back(id.clone());
                promoted.push(id);
            }
        }
        Ok(promoted)
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool> {
        let mut queue = self.lock();
        match queue.jobs.get(job_id) {
            Some(job) if job.state == JobState::Queued && job.attempt == 0 => {}
            _ => return Ok(false),
        }

        let before = queue.ready.len();
        queue.ready.retain(|id| id != job_id);
        let mut removed = queue.ready.len() != before;

        if let Some(entry) = queue.delayed.iter().find(|(_, id)| id == job_id).cloned() {
            queue.delayed.remove(&entry);
            removed = true;
        }

        if removed {
            queue.jobs.remove(job_id);
        }
        Ok(removed)
    }

    async fn peek(&self, job_id: &JobId) -> Result<Option<JobEnvelope>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
        self.lock().recurring.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn remove_recurring(&self, id: &str) -> Result<bool> {
        Ok(self.lock().recurring.remove(id).is_some())
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let queue = self.lock();
        let mut due: Vec<RecurringJob> = queue
            .recurring
            .values()
            .filter(|r| r.next_run <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run.cmp(&b.next_run));
        Ok(due)
    }

    async fn fire_recurring(
        &self,
        recurring: &RecurringJob,
        next_run: DateTime<Utc>,
        envelope: &JobEnvelope,
    ) -> Result<bool> {
        let mut queue = self.lock();
        match queue.recurring.get_mut(&recurring.id) {
            Some(stored) if stored.next_run == recurring.next_run => {
                stored.next_run = next_run;
                stored.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        if queue.jobs.contains_key(&envelope.job_id) {
            return Err(BrokerError::DuplicateJob(envelope.job_id.clone()));
        }
        // the spawned job is due by construction
        queue.ready.push_back(envelope.job_id.clone());
        queue.jobs.insert(envelope.job_id.clone(), envelope.clone());
        Ok(true)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let queue = self.lock();
        Ok(QueueDepth {
            ready: queue.ready.len() as u64,
            delayed: queue.delayed.len() as u64,
            leased: queue.leases.len().saturating_sub(queue.reaped.len()) as u64,
            reaped: queue.reaped.len() as u64,
            recurring: queue.recurring.len() as u64,
        })
    }
}
