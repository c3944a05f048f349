//! Durable scan queue over Redis: a ready list, a dedup set keyed by file id
//! so one object is never enqueued twice, and a sorted set holding delayed
//! retries until they come due.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const READY_KEY: &str = "scan:jobs";
const PENDING_KEY: &str = "scan:pending";
const DELAYED_KEY: &str = "scan:delayed";

/// One execution plus up to three retries, one per backoff value.
pub const RETRY_BACKOFF_SECS: [u64; 3] = [10, 30, 60];
pub const MAX_RETRIES: u32 = 3;

/// Soft wall-clock limit for a single scan execution.
pub const SCAN_TIMEOUT_SECS: u64 = 10 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub file_id: Uuid,
    /// Executions already attempted for this job.
    #[serde(default)]
    pub attempt: u32,
}

impl ScanJob {
    pub fn new(file_id: Uuid) -> Self {
        Self { file_id, attempt: 0 }
    }

    /// Backoff before the next execution, or `None` once retries are spent.
    pub fn next_backoff_secs(&self) -> Option<u64> {
        RETRY_BACKOFF_SECS.get(self.attempt as usize).copied()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Producer half of the scan pipeline; the coordinator only ever enqueues.
#[async_trait::async_trait]
pub trait ScanQueue: Send + Sync + 'static {
    async fn enqueue(&self, file_id: Uuid) -> Result<(), QueueError>;
}

#[derive(Clone)]
pub struct RedisScanQueue {
    conn: ConnectionManager,
}

impl RedisScanQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Blocking pop of the next ready job. Returns `None` on timeout.
    pub async fn dequeue(&self, timeout_secs: u64) -> Result<Option<ScanJob>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(READY_KEY)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        let Some((_, payload)) = popped else {
            return Ok(None);
        };
        let job: ScanJob = serde_json::from_str(&payload)?;
        // The in-flight job no longer blocks re-enqueueing its file id; the
        // worker's state check makes duplicate deliveries harmless.
        conn.srem::<_, _, ()>(PENDING_KEY, job.file_id.to_string()).await?;
        Ok(Some(job))
    }

    /// Park a failed job until `now + delay`, with its attempt counter bumped.
    pub async fn schedule_retry(&self, job: &ScanJob, delay_secs: u64) -> Result<(), QueueError> {
        let retry = ScanJob {
            file_id: job.file_id,
            attempt: job.attempt + 1,
        };
        let ready_at = time::OffsetDateTime::now_utc().unix_timestamp() + delay_secs as i64;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, serde_json::to_string(&retry)?, ready_at)
            .await?;
        Ok(())
    }

    /// Move due retries from the delayed set onto the ready list.
    pub async fn promote_due(&self) -> Result<(), QueueError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;
        for payload in due {
            let removed: i64 = conn.zrem(DELAYED_KEY, &payload).await?;
            // Another worker may have promoted it between the range read and
            // the remove; only the one that removed it gets to push.
            if removed > 0 {
                conn.lpush::<_, _, ()>(READY_KEY, &payload).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScanQueue for RedisScanQueue {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn enqueue(&self, file_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(PENDING_KEY, file_id.to_string()).await?;
        if added == 0 {
            tracing::debug!(%file_id, "scan already enqueued, skipping duplicate");
            return Ok(());
        }
        let payload = serde_json::to_string(&ScanJob::new(file_id))?;
        conn.lpush::<_, _, ()>(READY_KEY, payload).await?;
        Ok(())
    }
}
