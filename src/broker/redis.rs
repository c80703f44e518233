//! Redis-backed broker.
//!
//! Key layout under the namespace `ns`:
//!
//! - `ns:job:{id}`        hash: `envelope`, `attempt`, `state`, `not_before`, `max_tries`, `last_error`
//! - `ns:ready`           list of claimable ids (LPUSH in, RPOP out)
//! - `ns:delayed`         zset of ids scored by `not_before` millis
//! - `ns:leases`          zset of leased ids scored by lease expiry millis
//! - `ns:owners`          hash id -> worker id
//! - `ns:reaped`          set of ids whose lease the reaper took over
//! - `ns:recurring`       hash id -> recurring definition JSON
//! - `ns:recurring:next`  zset of recurring ids scored by next run millis
//!
//! Every primitive touching more than one key is a Lua script, so Redis runs it atomically.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{error, warn};

use super::{Broker, BrokerError, Result};
use crate::job::{after, ClaimedJob, JobEnvelope, JobId, JobState, Lease, QueueDepth, RecurringJob};

const PUSH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'envelope', ARGV[2], 'attempt', ARGV[3], 'state', ARGV[4],
  'not_before', ARGV[5], 'max_tries', ARGV[6], 'last_error', '')
if tonumber(ARGV[5]) <= tonumber(ARGV[7]) then
  redis.call('LPUSH', KEYS[2], ARGV[1])
else
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
end
return 1
"#;

const CLAIM: &str = r#"
local id = redis.call('RPOP', KEYS[1])
while id do
  local key = ARGV[1] .. id
  if redis.call('EXISTS', key) == 1 then
    local attempt = redis.call('HINCRBY', key, 'attempt', 1)
    redis.call('HSET', key, 'state', 'in_progress')
    redis.call('ZADD', KEYS[2], ARGV[3], id)
    redis.call('HSET', KEYS[3], id, ARGV[2])
    local f = redis.call('HMGET', key, 'envelope', 'state', 'not_before', 'last_error')
    return {id, f[1], tostring(attempt), f[2], f[3], f[4] or ''}
  end
  id = redis.call('RPOP', KEYS[1])
end
return false
"#;

const RENEW: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

const ACK: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('DEL', KEYS[4])
return 1
"#;

const RELEASE: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
if redis.call('EXISTS', KEYS[5]) == 0 then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[5], 'state', 'failed_retryable', 'not_before', ARGV[3], 'last_error', ARGV[4])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
return 1
"#;

const REAP: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('SADD', KEYS[3], id)
end
local out = {}
for _, id in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  local f = redis.call('HMGET', ARGV[1] .. id, 'envelope', 'attempt', 'state', 'not_before', 'last_error')
  if f[1] then
    redis.call('HSET', KEYS[2], id, ARGV[3])
    table.insert(out, {id, f[1], f[2], f[3], f[4], f[5] or ''})
  else
    redis.call('SREM', KEYS[3], id)
    redis.call('HDEL', KEYS[2], id)
  end
end
return out
"#;

const PROMOTE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, ARGV[3])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HSET', ARGV[1] .. id, 'state', 'queued')
  redis.call('LPUSH', KEYS[2], id)
end
return ids
"#;

const CANCEL: &str = r#"
local f = redis.call('HMGET', KEYS[3], 'state', 'attempt')
if f[1] ~= 'queued' or f[2] ~= '0' then
  return 0
end
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1]) + redis.call('ZREM', KEYS[2], ARGV[1])
if removed > 0 then
  redis.call('DEL', KEYS[3])
  return 1
end
return 0
"#;

const FIRE_RECURRING: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
  return 0
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  return -1
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[7])
redis.call('HSET', KEYS[3], 'envelope', ARGV[5], 'attempt', 0, 'state', 'queued',
  'not_before', ARGV[2], 'max_tries', ARGV[6], 'last_error', '')
redis.call('LPUSH', KEYS[2], ARGV[4])
return 1
"#;

#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn new(namespace: &str) -> Self {
        Self {
            prefix: namespace.trim_end_matches(':').to_string(),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn ready(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    fn owners(&self) -> String {
        format!("{}:owners", self.prefix)
    }

    fn reaped(&self) -> String {
        format!("{}:reaped", self.prefix)
    }

    fn recurring(&self) -> String {
        format!("{}:recurring", self.prefix)
    }

    fn recurring_next(&self) -> String {
        format!("{}:recurring:next", self.prefix)
    }
}

struct Scripts {
    push: Script,
    claim: Script,
    renew: Script,
    ack: Script,
    release: Script,
    reap: Script,
    promote: Script,
    cancel: Script,
    fire_recurring: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            push: Script::new(PUSH),
            claim: Script::new(CLAIM),
            renew: Script::new(RENEW),
            ack: Script::new(ACK),
            release: Script::new(RELEASE),
            reap: Script::new(REAP),
            promote: Script::new(PROMOTE),
            cancel: Script::new(CANCEL),
            fire_recurring: Script::new(FIRE_RECURRING),
        }
    }
}

/// [`Broker`] over a shared Redis instance.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    keys: KeySpace,
    scripts: Arc<Scripts>,
}

impl RedisBroker {
    /// Connects to `url`, giving up after `connect_timeout`.
    pub async fn connect(url: &str, namespace: &str, connect_timeout: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(|e| map_redis_error(e, "open"))?;
        let conn = match timeout(connect_timeout, ConnectionManager::new(client)).await {
            Ok(result) => result.map_err(|e| {
                error!(url, error = %e, "Failed to connect to Redis");
                BrokerError::Unavailable(format!("failed to connect to Redis at {url}: {e}"))
            })?,
            Err(_) => {
                error!(url, "Timeout connecting to Redis");
                return Err(BrokerError::Unavailable(format!(
                    "timed out after {}ms connecting to Redis at {url}",
                    connect_timeout.as_millis()
                )));
            }
        };
        Ok(Self::from_connection(conn, namespace))
    }

    pub fn from_connection(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            keys: KeySpace::new(namespace),
            scripts: Arc::new(Scripts::load()),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, envelope: &JobEnvelope, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(envelope)?;
        let inserted: i64 = self
            .scripts
            .push
            .key(self.keys.job(&envelope.job_id))
            .key(self.keys.ready())
            .key(self.keys.delayed())
            .arg(envelope.job_id.as_ref())
            .arg(json)
            .arg(envelope.attempt)
            .arg(envelope.state.as_str())
            .arg(envelope.not_before.timestamp_millis())
            .arg(envelope.max_tries)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "push"))?;

        if inserted == 0 {
            return Err(BrokerError::DuplicateJob(envelope.job_id.clone()));
        }
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        let mut conn = self.conn.clone();
        let expires_at = after(now, lease_duration);
        let record: Option<Vec<String>> = self
            .scripts
            .claim
            .key(self.keys.ready())
            .key(self.keys.leases())
            .key(self.keys.owners())
            .arg(self.keys.job_prefix())
            .arg(worker_id)
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "claim"))?;

        let Some(record) = record else {
            return Ok(None);
        };
        let envelope = decode_record(&record)?;
        let lease = Lease {
            job_id: envelope.job_id.clone(),
            worker_id: worker_id.to_string(),
            expires_at: truncate_millis(expires_at),
        };
        Ok(Some(ClaimedJob { envelope, lease }))
    }

    async fn renew(&self, lease: &Lease, lease_duration: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let mut conn = self.conn.clone();
        let expires_at = after(now, lease_duration);
        let renewed: i64 = self
            .scripts
            .renew
            .key(self.keys.leases())
            .key(self.keys.owners())
            .arg(lease.job_id.as_ref())
            .arg(&lease.worker_id)
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "renew"))?;

        if renewed == 0 {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        Ok(Lease {
            expires_at: truncate_millis(expires_at),
            ..lease.clone()
        })
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .scripts
            .ack
            .key(self.keys.leases())
            .key(self.keys.owners())
            .key(self.keys.reaped())
            .key(self.keys.job(&lease.job_id))
            .arg(lease.job_id.as_ref())
            .arg(&lease.worker_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "ack"))?;

        if acked == 0 {
            return Err(BrokerError::LeaseLost(lease.job_id.clone()));
        }
        Ok(())
    }

    async fn release(
        &self,
        lease: &Lease,
        requeue_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .scripts
            .release
            .key(self.keys.leases())
            .key(self.keys.owners())
            .key(self.keys.reaped())
            .key(self.keys.delayed())
            .key(self.keys.job(&lease.job_id))
            .arg(lease.job_id.as_ref())
            .arg(&lease.worker_id)
            .arg(requeue_at.timestamp_millis())
            .arg(last_error.unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "release"))?;

        match released {
            1 => Ok(()),
            -1 => Err(BrokerError::Corrupt(format!(
                "leased job {} has no record",
                lease.job_id
            ))),
            _ => Err(BrokerError::LeaseLost(lease.job_id.clone())),
        }
    }

    async fn reap_expired_leases(&self, reaper_id: &str, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        let mut conn = self.conn.clone();
        let records: Vec<Vec<String>> = self
            .scripts
            .reap
            .key(self.keys.leases())
            .key(self.keys.owners())
            .key(self.keys.reaped())
            .arg(self.keys.job_prefix())
            .arg(now.timestamp_millis())
            .arg(reaper_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "reap_expired_leases"))?;

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            match decode_record(&record) {
                Ok(envelope) => {
                    let lease = Lease {
                        job_id: envelope.job_id.clone(),
                        worker_id: reaper_id.to_string(),
                        expires_at: now,
                    };
                    out.push(ClaimedJob { envelope, lease });
                }
                Err(e) => warn!(error = %e, "Skipping undecodable reaped job"),
            }
        }
        Ok(out)
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .promote
            .key(self.keys.delayed())
            .key(self.keys.ready())
            .arg(self.keys.job_prefix())
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "promote_due"))?;

        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let cancelled: i64 = self
            .scripts
            .cancel
            .key(self.keys.ready())
            .key(self.keys.delayed())
            .key(self.keys.job(job_id))
            .arg(job_id.as_ref())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "cancel"))?;

        Ok(cancelled == 1)
    }

    async fn peek(&self, job_id: &JobId) -> Result<Option<JobEnvelope>> {
        let mut conn = self.conn.clone();
        let fields: Vec<Option<String>> = ::redis::cmd("HMGET")
            .arg(self.keys.job(job_id))
            .arg("envelope")
            .arg("attempt")
            .arg("state")
            .arg("not_before")
            .arg("last_error")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "peek"))?;

        let mut fields = fields.into_iter();
        let Some(Some(envelope)) = fields.next() else {
            return Ok(None);
        };
        let mut record = vec![job_id.0.clone(), envelope];
        record.extend(fields.map(Option::unwrap_or_default));
        decode_record(&record).map(Some)
    }

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(self.keys.recurring(), &job.id, json);
        pipe.zadd(self.keys.recurring_next(), &job.id, job.next_run.timestamp_millis());
        pipe.exec_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "upsert_recurring"))
    }

    async fn remove_recurring(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (removed, _): (i64, i64) = ::redis::pipe()
            .atomic()
            .hdel(self.keys.recurring(), id)
            .zrem(self.keys.recurring_next(), id)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "remove_recurring"))?;
        Ok(removed == 1)
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let mut conn = self.conn.clone();
        let due: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.keys.recurring_next(), "-inf", now.timestamp_millis())
            .await
            .map_err(|e| map_redis_error(e, "due_recurring"))?;

        let mut out = Vec::with_capacity(due.len());
        for (id, next_ms) in due {
            let json: Option<String> = conn
                .hget(self.keys.recurring(), &id)
                .await
                .map_err(|e| map_redis_error(e, "due_recurring"))?;
            let Some(json) = json else {
                continue;
            };
            let mut recurring: RecurringJob = serde_json::from_str(&json)?;
            recurring.next_run = from_millis(next_ms as i64)?;
            out.push(recurring);
        }
        Ok(out)
    }

    async fn fire_recurring(
        &self,
        recurring: &RecurringJob,
        next_run: DateTime<Utc>,
        envelope: &JobEnvelope,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let advanced = RecurringJob {
            next_run,
            updated_at: Utc::now(),
            ..recurring.clone()
        };
        let fired: i64 = self
            .scripts
            .fire_recurring
            .key(self.keys.recurring_next())
            .key(self.keys.ready())
            .key(self.keys.job(&envelope.job_id))
            .key(self.keys.recurring())
            .arg(&recurring.id)
            .arg(recurring.next_run.timestamp_millis())
            .arg(next_run.timestamp_millis())
            .arg(envelope.job_id.as_ref())
            .arg(serde_json::to_string(envelope)?)
            .arg(envelope.max_tries)
            .arg(serde_json::to_string(&advanced)?)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "fire_recurring"))?;

        match fired {
            1 => Ok(true),
            -1 => Err(BrokerError::DuplicateJob(envelope.job_id.clone())),
            _ => Ok(false),
        }
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let mut conn = self.conn.clone();
        let (ready, delayed, leased, reaped, recurring): (u64, u64, u64, u64, u64) = ::redis::pipe()
            .llen(self.keys.ready())
            .zcard(self.keys.delayed())
            .zcard(self.keys.leases())
            .scard(self.keys.reaped())
            .hlen(self.keys.recurring())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "depth"))?;

        Ok(QueueDepth {
            ready,
            delayed,
            leased,
            reaped,
            recurring,
        })
    }
}

/// Rebuilds an envelope from `[id, envelope_json, attempt, state, not_before_ms, last_error]`.
///
/// The JSON snapshot is written once at push time; the hash fields carry the mutable parts.
fn decode_record(record: &[String]) -> Result<JobEnvelope> {
    let [id, json, attempt, state, not_before, last_error] = record else {
        return Err(BrokerError::Corrupt(format!(
            "expected 6 job fields, got {}",
            record.len()
        )));
    };

    let mut envelope: JobEnvelope = serde_json::from_str(json)?;
    if envelope.job_id.0 != *id {
        return Err(BrokerError::Corrupt(format!(
            "job {id} holds envelope for {}",
            envelope.job_id
        )));
    }
    envelope.attempt = attempt
        .parse()
        .map_err(|_| BrokerError::Corrupt(format!("job {id} has attempt {attempt:?}")))?;
    envelope.state = state
        .parse::<JobState>()
        .map_err(|e| BrokerError::Corrupt(format!("job {id}: {e}")))?;
    let not_before: i64 = not_before
        .parse()
        .map_err(|_| BrokerError::Corrupt(format!("job {id} has not_before {not_before:?}")))?;
    envelope.not_before = from_millis(not_before)?;
    envelope.last_error = (!last_error.is_empty()).then(|| last_error.clone());
    Ok(envelope)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BrokerError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Connectivity problems become `Unavailable`; everything else is a command failure.
fn map_redis_error(error: RedisError, context: &str) -> BrokerError {
    warn!(context, error = %error, "Redis operation failed");

    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        return BrokerError::Unavailable(format!("redis {context}: {error}"));
    }
    BrokerError::Command(format!("redis {context}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_space_uses_namespace() {
        let keys = KeySpace::new("app:");
        let id = JobId::from("42");
        assert_eq!(keys.job(&id), "app:job:42");
        assert_eq!(keys.job_prefix(), "app:job:");
        assert_eq!(keys.ready(), "app:ready");
        assert_eq!(keys.recurring_next(), "app:recurring:next");
    }

    #[test]
    fn decode_record_overlays_mutable_fields() {
        let envelope = JobEnvelope::new("resize", json!({"w": 10}), 4, Duration::from_secs(3));
        let not_before = Utc::now() + chrono::Duration::seconds(5);
        let record = vec![
            envelope.job_id.0.clone(),
            serde_json::to_string(&envelope).unwrap(),
            "2".to_string(),
            "failed_retryable".to_string(),
            not_before.timestamp_millis().to_string(),
            "disk full".to_string(),
        ];

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.attempt, 2);
        assert_eq!(decoded.state, JobState::FailedRetryable);
        assert_eq!(decoded.not_before.timestamp_millis(), not_before.timestamp_millis());
        assert_eq!(decoded.last_error.as_deref(), Some("disk full"));
        assert_eq!(decoded.payload, json!({"w": 10}));
    }

    #[test]
    fn decode_record_rejects_garbage() {
        assert!(decode_record(&["x".to_string()]).is_err());

        let envelope = JobEnvelope::new("resize", json!(null), 1, Duration::from_secs(1));
        let record = vec![
            "other-id".to_string(),
            serde_json::to_string(&envelope).unwrap(),
            "0".into(),
            "queued".into(),
            "0".into(),
            String::new(),
        ];
        assert!(matches!(decode_record(&record), Err(BrokerError::Corrupt(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unavailable() {
        let result = RedisBroker::connect("redis://127.0.0.1:1", "test", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
    }
}
