use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::job::{JobId, JobState};
use crate::store::StoreError;

/// Errors surfaced to producers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("job {job_id} is {state}, only failed_terminal jobs can be resubmitted")]
    NotResettable { job_id: JobId, state: JobState },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<BrokerError> for QueueError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Unavailable(msg) => QueueError::QueueUnavailable(msg),
            other => QueueError::Broker(other),
        }
    }
}

/// Misuse of the worker runtime lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("worker runtime already started")]
    AlreadyStarted,

    #[error("worker runtime is not running")]
    NotRunning,

    #[error("cannot reload while {0}")]
    ReloadUnsupported(String),
}
