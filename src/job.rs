use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a job.
///
/// `Succeeded` and `FailedTerminal` are absorbing. The only way back into the
/// queue is `FailedRetryable -> Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::InProgress => "in_progress",
            JobState::Succeeded => "succeeded",
            JobState::FailedRetryable => "failed_retryable",
            JobState::FailedTerminal => "failed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, FailedRetryable)
                | (InProgress, FailedTerminal)
                | (FailedRetryable, Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "in_progress" => Ok(JobState::InProgress),
            "succeeded" => Ok(JobState::Succeeded),
            "failed_retryable" => Ok(JobState::FailedRetryable),
            "failed_terminal" => Ok(JobState::FailedTerminal),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// The serialized unit of work handed from producers to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub max_tries: u32,
    pub attempt: u32,
    pub timeout: Duration,
    pub state: JobState,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobEnvelope {
    pub fn new<S: Into<String>>(job_type: S, payload: Value, max_tries: u32, timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            payload,
            enqueued_at: now,
            not_before: now,
            max_tries,
            attempt: 0,
            timeout,
            state: JobState::Queued,
            last_error: None,
        }
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    /// Moves the envelope to `next`, rejecting moves the state machine forbids.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn tries_exhausted(&self) -> bool {
        self.attempt >= self.max_tries
    }
}

/// Per-enqueue overrides. Anything left `None` falls back to the queue config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub max_tries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Time-bounded exclusive claim on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A job handed out by `claim`, together with the lease that guards it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub envelope: JobEnvelope,
    pub lease: Lease,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Success(Value),
    Failure(String),
}

/// Terminal record of a job. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub outcome: JobOutcome,
    pub attempts_used: u32,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn succeeded(envelope: &JobEnvelope, value: Value) -> Self {
        Self::finish(envelope, JobState::Succeeded, JobOutcome::Success(value))
    }

    pub fn failed<S: Into<String>>(envelope: &JobEnvelope, reason: S) -> Self {
        Self::finish(
            envelope,
            JobState::FailedTerminal,
            JobOutcome::Failure(reason.into()),
        )
    }

    fn finish(envelope: &JobEnvelope, state: JobState, outcome: JobOutcome) -> Self {
        Self {
            job_id: envelope.job_id.clone(),
            job_type: envelope.job_type.clone(),
            payload: envelope.payload.clone(),
            state,
            outcome,
            attempts_used: envelope.attempt,
            enqueued_at: envelope.enqueued_at,
            finished_at: Utc::now(),
        }
    }
}

/// What `Producer::get_status` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub max_tries: Option<u32>,
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
}

impl From<JobResult> for JobStatus {
    fn from(result: JobResult) -> Self {
        let last_error = match &result.outcome {
            JobOutcome::Failure(reason) => Some(reason.clone()),
            JobOutcome::Success(_) => None,
        };
        Self {
            job_id: result.job_id.clone(),
            state: result.state,
            attempt: result.attempts_used,
            max_tries: None,
            not_before: None,
            last_error,
            result: Some(result),
        }
    }
}

impl From<JobEnvelope> for JobStatus {
    fn from(envelope: JobEnvelope) -> Self {
        Self {
            job_id: envelope.job_id,
            state: envelope.state,
            attempt: envelope.attempt,
            max_tries: Some(envelope.max_tries),
            not_before: Some(envelope.not_before),
            last_error: envelope.last_error,
            result: None,
        }
    }
}

/// A recurring job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: String,
    pub cron: String,
    pub job_type: String,
    pub payload: Value,
    pub max_tries: u32,
    pub timeout: Duration,
    pub next_run: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringJob {
    /// Builds the job this definition spawns for the run at `next_run`.
    pub fn spawn(&self) -> JobEnvelope {
        JobEnvelope::new(
            self.job_type.clone(),
            self.payload.clone(),
            self.max_tries,
            self.timeout,
        )
        .with_not_before(self.next_run)
    }
}

/// Broker-side counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub leased: u64,
    pub reaped: u64,
    pub recurring: u64,
}

/// A state change observed by the worker runtime or its scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Queued,
            JobState::InProgress,
            JobState::Succeeded,
            JobState::FailedRetryable,
            JobState::FailedTerminal,
        ] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("processing".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for next in [
            JobState::Queued,
            JobState::InProgress,
            JobState::FailedRetryable,
        ] {
            assert!(!JobState::Succeeded.can_transition_to(next));
            assert!(!JobState::FailedTerminal.can_transition_to(next));
        }
    }

    #[test]
    fn terminal_states_require_in_progress() {
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::FailedTerminal));
        assert!(!JobState::FailedRetryable.can_transition_to(JobState::FailedTerminal));
        assert!(!JobState::FailedRetryable.can_transition_to(JobState::InProgress));
    }

    #[test]
    fn retry_loop_is_allowed() {
        let mut job = JobEnvelope::new("noop", json!(null), 3, Duration::from_secs(1));
        job.transition(JobState::InProgress).unwrap();
        job.transition(JobState::FailedRetryable).unwrap();
        job.transition(JobState::Queued).unwrap();
        job.transition(JobState::InProgress).unwrap();
        job.transition(JobState::Succeeded).unwrap();

        let err = job.transition(JobState::Queued).unwrap_err();
        assert_eq!(err.from, JobState::Succeeded);
        assert_eq!(err.to, JobState::Queued);
    }

    #[test]
    fn result_captures_attempts_used() {
        let mut job = JobEnvelope::new("noop", json!({"a": 1}), 3, Duration::from_secs(1));
        job.attempt = 2;
        let result = JobResult::failed(&job, "boom");
        assert_eq!(result.attempts_used, 2);
        assert_eq!(result.state, JobState::FailedTerminal);
        assert_eq!(result.outcome, JobOutcome::Failure("boom".into()));
        assert_eq!(result.payload, json!({"a": 1}));
    }

    #[test]
    fn after_saturates() {
        let far = after(Utc::now(), Duration::from_secs(u64::MAX));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }
}
