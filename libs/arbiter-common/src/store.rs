//! Job Store - the single shared resource between API and workers
//!
//! Lifecycle: `queued -> active -> completed | failed`. The queue is a Redis
//! list; `BLMOVE` hands each id to exactly one consumer and Lua scripts make
//! every state transition check-and-set.

use crate::config::Config;
use crate::redis::{active_key, job_key, type_error, QUEUE_KEY};
use crate::types::{Job, JobId, JobState, JobStatus, Submission, Verdict};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub const ABANDONED_JOB_ERROR: &str = "worker terminated before the job finished";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job {0} is not active")]
    NotActive(JobId),
    #[error("job {id} has a corrupt record: {reason}")]
    Corrupt { id: String, reason: String },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Record a new job and append it to the queue
    async fn enqueue(&self, submission: &Submission) -> Result<JobId, StoreError>;

    /// Take the next queued job, moving it to `active`. Returns `None` when
    /// nothing arrived within `timeout`.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, StoreError>;

    /// `active -> completed`; fails with `NotActive` on any other state
    async fn complete(&self, id: JobId, verdict: &Verdict) -> Result<(), StoreError>;

    /// `active -> failed`; fails with `NotActive` on any other state
    async fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError>;

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for std::sync::Arc<T> {
    async fn enqueue(&self, submission: &Submission) -> Result<JobId, StoreError> {
        (**self).enqueue(submission).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, StoreError> {
        (**self).dequeue(timeout).await
    }

    async fn complete(&self, id: JobId, verdict: &Verdict) -> Result<(), StoreError> {
        (**self).complete(id, verdict).await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        (**self).fail(id, error).await
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        (**self).status(id).await
    }
}

const ACTIVATE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'queued' then
  redis.call('LREM', KEYS[2], 0, ARGV[1])
  return false
end
redis.call('HSET', KEYS[1], 'state', 'active', 'started_at', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return redis.call('HMGET', KEYS[1], 'problem_id', 'source_code')
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[1], ARGV[2], ARGV[3], 'finished_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'source_code')
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('LREM', KEYS[2], 0, ARGV[6])
return 1
"#;

// An id can sit in an active list while its record is still `queued`: the
// worker stopped between BLMOVE and ACTIVATE. Those go back to the queue head.
const RECOVER_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
redis.call('LREM', KEYS[2], 0, ARGV[1])
if state == 'queued' then
  redis.call('LPUSH', KEYS[3], ARGV[1])
  return 'requeued'
end
if state == 'active' then
  redis.call('HSET', KEYS[1], 'state', 'failed', 'error', ARGV[2], 'finished_at', ARGV[3])
  redis.call('HDEL', KEYS[1], 'source_code')
  redis.call('EXPIRE', KEYS[1], ARGV[4])
  return 'failed'
end
return 'stale'
"#;

/// What `recover_abandoned` did with a dead worker's leftovers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// Taken but never started; back at the head of the queue
    pub requeued: usize,
    /// Started and never finished; now `failed`
    pub failed: usize,
}

/// Redis-backed job store.
///
/// `BLMOVE` blocks its connection, so every worker slot needs its own store.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    queue: String,
    worker_id: String,
    ttl_secs: u64,
}

impl RedisJobStore {
    pub async fn connect(config: &Config, worker_id: impl Into<String>) -> redis::RedisResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            queue: QUEUE_KEY.to_string(),
            worker_id: worker_id.into(),
            ttl_secs: config.result_ttl_secs,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Reconcile every id still recorded as held by this worker id.
    ///
    /// Run once at worker start, before any slot dequeues: anything left over
    /// belongs to a previous process. Jobs it had started are failed, not
    /// retried. Jobs it had taken but not yet started are requeued.
    pub async fn recover_abandoned(&self) -> Result<Recovery, StoreError> {
        let mut conn = self.conn.clone();
        let active = active_key(&self.worker_id);
        let ids: Vec<String> = conn.lrange(&active, 0, -1).await?;

        let mut recovery = Recovery::default();
        // Reversed so requeued ids keep their relative order at the queue head
        for raw in ids.into_iter().rev() {
            let Ok(id) = Uuid::parse_str(&raw) else {
                warn!(job_id = %raw, "Dropping unparseable active entry");
                let _: i64 = conn.lrem(&active, 0, &raw).await?;
                continue;
            };

            let outcome: String = Script::new(RECOVER_SCRIPT)
                .key(job_key(&id))
                .key(&active)
                .key(&self.queue)
                .arg(id.to_string())
                .arg(ABANDONED_JOB_ERROR)
                .arg(Utc::now().to_rfc3339())
                .arg(self.ttl_secs)
                .invoke_async(&mut conn)
                .await?;

            match outcome.as_str() {
                "requeued" => {
                    debug!(job_id = %id, "Requeued job taken but never started");
                    recovery.requeued += 1;
                }
                "failed" => recovery.failed += 1,
                _ => warn!(job_id = %id, "Dropping stale active entry"),
            }
        }
        Ok(recovery)
    }

    async fn finish(
        &self,
        id: JobId,
        state: JobState,
        field: &str,
        payload: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().to_rfc3339();
        let done: i64 = Script::new(FINISH_SCRIPT)
            .key(job_key(&id))
            .key(active_key(&self.worker_id))
            .arg(state.as_str())
            .arg(field)
            .arg(payload)
            .arg(now)
            .arg(self.ttl_secs)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(StoreError::NotActive(id))
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, submission: &Submission) -> Result<JobId, StoreError> {
        let mut conn = self.conn.clone();
        let id = Uuid::new_v4();
        let key = job_key(&id);
        let now = Utc::now().to_rfc3339();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &key,
                &[
                    ("state", JobState::Queued.as_str()),
                    ("problem_id", submission.problem_id.as_str()),
                    ("source_code", submission.code.as_str()),
                    ("enqueued_at", now.as_str()),
                ],
            )
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .ignore()
            .rpush(&self.queue, id.to_string())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let active = active_key(&self.worker_id);

        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&active)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some(raw) = moved else {
            return Ok(None);
        };

        let id = match Uuid::parse_str(&raw) {
            Ok(id) => id,
            Err(e) => {
                let _: i64 = conn.lrem(&active, 0, &raw).await?;
                return Err(StoreError::Corrupt {
                    id: raw,
                    reason: e.to_string(),
                });
            }
        };

        let payload: Option<(String, String)> = Script::new(ACTIVATE_SCRIPT)
            .key(job_key(&id))
            .key(&active)
            .arg(id.to_string())
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match payload {
            Some((problem_id, source_code)) => Ok(Some(Job {
                id,
                problem_id,
                source_code,
            })),
            None => {
                debug!(job_id = %id, "Queued id had no queued record, skipping");
                Ok(None)
            }
        }
    }

    async fn complete(&self, id: JobId, verdict: &Verdict) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(verdict).map_err(|e| type_error("serialization error", e))?;
        self.finish(id, JobState::Completed, "verdict", &payload).await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        self.finish(id, JobState::Failed, "error", error).await
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(&id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_status(id, &fields).map(Some)
    }
}

/// Build a poll response from a job record's hash fields
pub fn parse_status(id: JobId, fields: &HashMap<String, String>) -> Result<JobStatus, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    };

    let state = fields
        .get("state")
        .and_then(|s| JobState::parse(s))
        .ok_or_else(|| corrupt("missing or unknown state".to_string()))?;

    match state {
        JobState::Queued => Ok(JobStatus::Queued),
        JobState::Active => Ok(JobStatus::Active),
        JobState::Completed => {
            let raw = fields
                .get("verdict")
                .ok_or_else(|| corrupt("completed without verdict".to_string()))?;
            let verdict: Verdict =
                serde_json::from_str(raw).map_err(|e| corrupt(format!("bad verdict: {e}")))?;
            Ok(JobStatus::Completed { verdict })
        }
        JobState::Failed => Ok(JobStatus::Failed {
            error: fields.get("error").cloned().unwrap_or_default(),
        }),
    }
}
