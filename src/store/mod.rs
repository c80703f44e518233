//! Result/status store: terminal job records, written once.
pub mod sqlite;

use async_trait::async_trait;

use crate::job::{JobId, JobResult};

pub use sqlite::SqliteResultStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt result row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Inserts `result` unless one already exists for the job. Returns whether it was written.
    async fn record(&self, result: &JobResult) -> Result<bool>;

    async fn fetch(&self, job_id: &JobId) -> Result<Option<JobResult>>;
}
