use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::job::{JobEnvelope, JobId};

/// What a handler returns when it fails.
///
/// `Retryable` counts against `max_tries`; `Fatal` ends the job on the spot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable<S: Into<String>>(msg: S) -> Self {
        HandlerError::Retryable(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        HandlerError::Fatal(msg.into())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError::Retryable(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError::Retryable(msg.to_string())
    }
}

/// Error type for a single execution attempt
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Fatal handler error: {0}")]
    FatalHandler(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lease lost on job {0}")]
    LeaseLost(JobId),

    #[error("Job handler panicked")]
    Panicked,
}

impl JobError {
    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Handler(_) | JobError::Timeout(_) | JobError::Panicked | JobError::LeaseLost(_)
        )
    }
}

impl From<HandlerError> for JobError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Retryable(msg) => JobError::Handler(msg),
            HandlerError::Fatal(msg) => JobError::FatalHandler(msg),
        }
    }
}

pub type ExecutionResult = Result<Value, JobError>;

type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> + Send + Sync>;

/// Registry for job handlers, keyed by `job_type`.
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create a new empty handler registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `name`, replacing any earlier one.
    ///
    /// # Example
    /// ```ignore
    /// let mut registry = HandlerRegistry::new();
    /// registry.register("send_email", |args: SendEmail| async move {
    ///     mailer::send(&args.to).await.map_err(HandlerError::retryable)?;
    ///     Ok(())
    /// });
    /// ```
    pub fn register<T, R, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        let boxed: BoxedHandler = Arc::new(move |payload: Value| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = serde_json::from_value(payload).map_err(JobError::Deserialization)?;
                let output = handler(args).await?;
                serde_json::to_value(output).map_err(JobError::Serialization)
            })
        });

        self.handlers.insert(name.to_string(), boxed);
        self
    }

    /// Run one attempt of `job`, bounded by its timeout and by `cancel`.
    ///
    /// The handler runs on its own task so a panic or an abandoned attempt
    /// does not take the caller down with it.
    pub async fn execute(&self, job: &JobEnvelope, cancel: &CancellationToken) -> ExecutionResult {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| JobError::HandlerNotFound(job.job_type.clone()))?;

        let future = handler(job.payload.clone());
        let mut handle = tokio::spawn(future);

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Panicked
            } else {
                JobError::Handler("Job handler cancelled".to_string())
            }
        };

        tokio::select! {
            res = &mut handle => res.map_err(join_to_error)?,
            _ = tokio::time::sleep(job.timeout) => {
                handle.abort();
                Err(JobError::Timeout(job.timeout))
            }
            _ = cancel.cancelled() => {
                handle.abort();
                Err(JobError::LeaseLost(job.job_id.clone()))
            }
        }
    }

    /// Check if a handler is registered for a job type
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get the list of registered job types
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn job(job_type: &str, payload: Value, timeout: Duration) -> JobEnvelope {
        JobEnvelope::new(job_type, payload, 3, timeout)
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register("add", |args: Add| async move { Ok::<_, HandlerError>(args.a + args.b) })
            .register("flaky", |_: Value| async move { Err::<(), _>(HandlerError::from("try again")) })
            .register("broken", |_: Value| async move { Err::<(), _>(HandlerError::fatal("bad input")) })
            .register("slow", |_: Value| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, HandlerError>(())
            })
            .register("panics", |_: Value| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, HandlerError>(())
            });
        registry
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let out = registry()
            .execute(&job("add", json!({"a": 2, "b": 3}), Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn unknown_job_type_is_fatal() {
        let err = registry()
            .execute(&job("nope", json!({}), Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::HandlerNotFound(ref t) if t == "nope"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn undecodable_payload_is_fatal() {
        let err = registry()
            .execute(&job("add", json!({"a": "two"}), Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Deserialization(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn handler_errors_keep_their_class() {
        let registry = registry();
        let cancel = CancellationToken::new();

        let err = registry
            .execute(&job("flaky", json!(null), Duration::from_secs(1)), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Handler error: try again");

        let err = registry
            .execute(&job("broken", json!(null), Duration::from_secs(1)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::FatalHandler(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_the_attempt() {
        let err = registry()
            .execute(&job("slow", json!(null), Duration::from_millis(50)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancellation_reports_lease_lost() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry()
            .execute(&job("slow", json!(null), Duration::from_secs(30)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let err = registry()
            .execute(&job("panics", json!(null), Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Panicked));
        assert!(err.is_retryable());
    }

    #[test]
    fn lists_job_types() {
        let registry = registry();
        assert!(registry.has_handler("add"));
        assert!(!registry.has_handler("missing"));
        assert_eq!(registry.job_types(), vec!["add", "broken", "flaky", "panics", "slow"]);
    }
}
