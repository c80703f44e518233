use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{Result, ResultStore, StoreError};
use crate::job::{JobId, JobOutcome, JobResult, JobState};

pub struct SqliteResultStore {
    pub pool: SqlitePool,
}

impl SqliteResultStore {
    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // every connection to `:memory:` is its own database, so keep exactly one alive
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_results (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                outcome TEXT NOT NULL,
                attempts_used INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_job_results_state ON job_results(state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_result(&self, row: SqliteRow) -> Result<JobResult> {
        let job_id: String = row.try_get("job_id")?;
        let job_type: String = row.try_get("job_type")?;
        let payload: String = row.try_get("payload")?;
        let state: String = row.try_get("state")?;
        let outcome: String = row.try_get("outcome")?;
        let attempts_used: i64 = row.try_get("attempts_used")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let finished_at: String = row.try_get("finished_at")?;

        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("job {job_id}: bad {what}: {e}"))
        };

        Ok(JobResult {
            payload: serde_json::from_str(&payload).map_err(|e| corrupt("payload", &e))?,
            state: state.parse::<JobState>().map_err(|e| corrupt("state", &e))?,
            outcome: serde_json::from_str::<JobOutcome>(&outcome).map_err(|e| corrupt("outcome", &e))?,
            attempts_used: u32::try_from(attempts_used).map_err(|e| corrupt("attempts_used", &e))?,
            enqueued_at: parse_timestamp(&enqueued_at).map_err(|e| corrupt("enqueued_at", &e))?,
            finished_at: parse_timestamp(&finished_at).map_err(|e| corrupt("finished_at", &e))?,
            job_type,
            job_id: JobId(job_id),
        })
    }
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn record(&self, result: &JobResult) -> Result<bool> {
        let payload = serde_json::to_string(&result.payload)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let outcome = serde_json::to_string(&result.outcome)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_results (job_id, job_type, payload, state, outcome, attempts_used, enqueued_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(&result.job_id.0)
        .bind(&result.job_type)
        .bind(payload)
        .bind(result.state.as_str())
        .bind(outcome)
        .bind(i64::from(result.attempts_used))
        .bind(result.enqueued_at.to_rfc3339())
        .bind(result.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn fetch(&self, job_id: &JobId) -> Result<Option<JobResult>> {
        let row = sqlx::query("SELECT * FROM job_results WHERE job_id = ?")
            .bind(&job_id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_result(row)?)),
            None => Ok(None),
        }
    }
}
