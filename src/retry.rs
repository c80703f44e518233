//! Exponential backoff, for both job retries and infrastructure calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// `delay(attempt) = base * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Attempts made for a broker or store call before its error surfaces.
pub(crate) const INFRA_TRIES: u32 = 3;

/// Backoff between infrastructure retries. Much shorter than job retries.
pub(crate) fn infra_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(2))
}

/// Runs `op` up to `tries` times while `should_retry` says the error is transient.
pub(crate) async fn with_backoff<T, E, F, Fut>(
    context: &str,
    tries: u32,
    policy: RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < tries && should_retry(&e) => {
                let delay = policy.delay(attempt);
                warn!(context, attempt = attempt + 1, error = %e, ?delay, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn with_backoff_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2));

        let result: Result<u32, String> = with_backoff("test", 3, policy, |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(format!("failure {n}"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_backoff_gives_up() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2));

        let result: Result<(), String> = with_backoff("test", 3, policy, |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_backoff_skips_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), String> = with_backoff("test", 5, policy, |_| false, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("bad input".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
