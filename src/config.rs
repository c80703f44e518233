//! Queue configuration, read from the environment.
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Redis URL of the broker.
    pub broker_url: String,
    /// sqlx URL of the result store.
    pub store_url: String,
    /// Prefix for every broker key.
    pub namespace: String,
    /// Maximum concurrently executing jobs per worker process.
    pub concurrency: usize,
    pub default_max_tries: u32,
    pub default_timeout: Duration,
    /// Visibility timeout of a claim.
    pub lease_duration: Duration,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    pub promote_interval: Duration,
    pub reap_interval: Duration,
    /// How long a reload or shutdown waits for in-flight attempts.
    pub drain_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let default_timeout = Duration::from_secs(300);
        Self {
            broker_url: "redis://127.0.0.1:6379".to_string(),
            store_url: "sqlite://jobwire.db?mode=rwc".to_string(),
            namespace: "jobwire".to_string(),
            concurrency: 4,
            default_max_tries: 5,
            default_timeout,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            promote_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(5),
            drain_timeout: default_timeout,
            connect_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Creates a `QueueConfig` from environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults:
    ///
    /// - `JOBWIRE_BROKER_URL` (or `REDIS_URL`) defaults to `redis://127.0.0.1:6379`.
    /// - `JOBWIRE_STORE_URL` (or `DATABASE_URL`) defaults to `sqlite://jobwire.db?mode=rwc`.
    /// - `JOBWIRE_NAMESPACE` defaults to `jobwire`.
    /// - `JOBWIRE_CONCURRENCY` defaults to `4`.
    /// - `JOBWIRE_DEFAULT_MAX_TRIES` defaults to `5`.
    /// - `JOBWIRE_*_MS` durations are in milliseconds.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_timeout = env_millis("JOBWIRE_DEFAULT_TIMEOUT_MS", defaults.default_timeout);

        Self {
            broker_url: env::var("JOBWIRE_BROKER_URL")
                .or_else(|_| env::var("REDIS_URL"))
                .unwrap_or(defaults.broker_url),
            store_url: env::var("JOBWIRE_STORE_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .unwrap_or(defaults.store_url),
            namespace: env::var("JOBWIRE_NAMESPACE").unwrap_or(defaults.namespace),
            concurrency: env_parse("JOBWIRE_CONCURRENCY", defaults.concurrency),
            default_max_tries: env_parse("JOBWIRE_DEFAULT_MAX_TRIES", defaults.default_max_tries),
            default_timeout,
            lease_duration: env_millis("JOBWIRE_LEASE_DURATION_MS", defaults.lease_duration),
            poll_interval: env_millis("JOBWIRE_POLL_INTERVAL_MS", defaults.poll_interval),
            promote_interval: env_millis("JOBWIRE_PROMOTE_INTERVAL_MS", defaults.promote_interval),
            reap_interval: env_millis("JOBWIRE_REAP_INTERVAL_MS", defaults.reap_interval),
            drain_timeout: env_millis("JOBWIRE_DRAIN_TIMEOUT_MS", default_timeout),
            connect_timeout: env_millis("JOBWIRE_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            retry: RetryPolicy::new(
                env_millis("JOBWIRE_RETRY_BASE_MS", defaults.retry.base),
                env_millis("JOBWIRE_RETRY_MAX_MS", defaults.retry.max),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.default_max_tries == 0 {
            return Err(ConfigError::Invalid("default_max_tries must be at least 1".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.promote_interval.is_zero() {
            return Err(ConfigError::Invalid("promote_interval must be positive".into()));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid("reap_interval must be positive".into()));
        }
        if self.retry.max < self.retry.base {
            return Err(ConfigError::Invalid(format!(
                "retry max ({:?}) is below retry base ({:?})",
                self.retry.max, self.retry.base
            )));
        }
        Ok(())
    }

    pub fn with_broker_url<S: Into<String>>(mut self, url: S) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_store_url<S: Into<String>>(mut self, url: S) -> Self {
        self.store_url = url.into();
        self
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_default_max_tries(mut self, max_tries: u32) -> Self {
        self.default_max_tries = max_tries;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env vars are process-wide
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "JOBWIRE_BROKER_URL",
        "REDIS_URL",
        "JOBWIRE_STORE_URL",
        "DATABASE_URL",
        "JOBWIRE_NAMESPACE",
        "JOBWIRE_CONCURRENCY",
        "JOBWIRE_DEFAULT_MAX_TRIES",
        "JOBWIRE_DEFAULT_TIMEOUT_MS",
        "JOBWIRE_LEASE_DURATION_MS",
        "JOBWIRE_POLL_INTERVAL_MS",
        "JOBWIRE_PROMOTE_INTERVAL_MS",
        "JOBWIRE_REAP_INTERVAL_MS",
        "JOBWIRE_DRAIN_TIMEOUT_MS",
        "JOBWIRE_CONNECT_TIMEOUT_MS",
        "JOBWIRE_RETRY_BASE_MS",
        "JOBWIRE_RETRY_MAX_MS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_values() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let config = QueueConfig::from_env();

        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.drain_timeout, config.default_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("REDIS_URL", "redis://cache:6379");
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::set_var("JOBWIRE_CONCURRENCY", "16");
        env::set_var("JOBWIRE_DEFAULT_MAX_TRIES", "3");
        env::set_var("JOBWIRE_DEFAULT_TIMEOUT_MS", "1500");
        env::set_var("JOBWIRE_LEASE_DURATION_MS", "2000");
        env::set_var("JOBWIRE_RETRY_BASE_MS", "10");
        env::set_var("JOBWIRE_RETRY_MAX_MS", "100");

        let config = QueueConfig::from_env();
        clear();

        assert_eq!(config.broker_url, "redis://cache:6379");
        assert_eq!(config.store_url, "sqlite::memory:");
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.default_max_tries, 3);
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.drain_timeout, Duration::from_millis(1500));
        assert_eq!(config.lease_duration, Duration::from_secs(2));
        assert_eq!(config.retry.base, Duration::from_millis(10));
        assert_eq!(config.retry.max, Duration::from_millis(100));
    }

    #[test]
    fn test_specific_vars_win_over_generic() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("REDIS_URL", "redis://generic:6379");
        env::set_var("JOBWIRE_BROKER_URL", "redis://specific:6379");

        let config = QueueConfig::from_env();
        clear();

        assert_eq!(config.broker_url, "redis://specific:6379");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("JOBWIRE_CONCURRENCY", "many");
        env::set_var("JOBWIRE_LEASE_DURATION_MS", "-5");

        let config = QueueConfig::from_env();
        clear();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        assert!(QueueConfig::default().with_concurrency(0).validate().is_err());
        assert!(QueueConfig::default().with_default_max_tries(0).validate().is_err());
        assert!(QueueConfig::default()
            .with_lease_duration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::default()
            .with_retry(RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(1)))
            .validate()
            .is_err());
        assert!(QueueConfig::default()
            .with_promote_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::default()
            .with_reap_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_zero_intervals_from_env_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("JOBWIRE_PROMOTE_INTERVAL_MS", "0");

        let config = QueueConfig::from_env();
        clear();

        assert_eq!(config.promote_interval, Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("promote_interval must be positive".into()))
        );
    }
}
