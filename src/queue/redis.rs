//! Redis queue backend.
//!
//! Key layout:
//! - `deployments` — main FIFO list (LPUSH producer side, RPOP consumer side)
//! - `deployments:processing` — reliable-dequeue holding list
//! - `deployments:delayed` — sorted set scored by due timestamp (ms)
//! - `deployments:inflight` — sorted set scored by reservation deadline (ms)
//! - `deployments:tracked` — hash of custody refcounts per deployment id
//! - `deployments:started` — set of currently reserved payloads
//! - `deployments:finished` / `deployments:failed` — counters
//!
//! Reservation uses RPOPLPUSH onto the processing list, so a worker crash
//! never loses the payload; the mover returns expired reservations to the
//! main queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;

use crate::queue::{JobQueue, QueueError, QueueStats, ReservedJob, SchedulingJob};

#[derive(Debug, Clone)]
pub struct RedisJobQueueConfig {
    pub url: String,
    /// Key prefix; `deployments` per the wire contract.
    pub namespace: String,
}

impl Default for RedisJobQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "deployments".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    main_key: String,
    processing_key: String,
    delayed_key: String,
    inflight_key: String,
    tracked_key: String,
    started_key: String,
    finished_key: String,
    failed_key: String,
}

fn backend(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

impl RedisJobQueue {
    pub async fn connect(config: &RedisJobQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str()).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        let ns = &config.namespace;
        Ok(Self {
            conn,
            main_key: ns.clone(),
            processing_key: format!("{ns}:processing"),
            delayed_key: format!("{ns}:delayed"),
            inflight_key: format!("{ns}:inflight"),
            tracked_key: format!("{ns}:tracked"),
            started_key: format!("{ns}:started"),
            finished_key: format!("{ns}:finished"),
            failed_key: format!("{ns}:failed"),
        })
    }

    async fn untrack(
        &self,
        conn: &mut ConnectionManager,
        deployment_id: i64,
    ) -> Result<(), QueueError> {
        let remaining: i64 = redis::cmd("HINCRBY")
            .arg(&self.tracked_key)
            .arg(deployment_id)
            .arg(-1)
            .query_async(conn)
            .await
            .map_err(backend)?;
        if remaining <= 0 {
            redis::cmd("HDEL")
                .arg(&self.tracked_key)
                .arg(deployment_id)
                .query_async::<()>(conn)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    /// Remove a payload from the reservation structures. Returns true if
    /// this call owned the removal (guards double-settling a redelivered
    /// payload).
    async fn settle(
        &self,
        conn: &mut ConnectionManager,
        payload: &str,
    ) -> Result<bool, QueueError> {
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(payload)
            .query_async(conn)
            .await
            .map_err(backend)?;
        redis::cmd("ZREM")
            .arg(&self.inflight_key)
            .arg(payload)
            .query_async::<()>(conn)
            .await
            .map_err(backend)?;
        redis::cmd("SREM")
            .arg(&self.started_key)
            .arg(payload)
            .query_async::<()>(conn)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn enqueue(&self, job: SchedulingJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("HINCRBY")
            .arg(&self.tracked_key)
            .arg(job.deployment_id)
            .arg(1)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.main_key)
            .arg(&payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn enqueue_after(&self, job: SchedulingJob, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("HINCRBY")
            .arg(&self.tracked_key)
            .arg(job.deployment_id)
            .arg(1)
            .ignore()
            .cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(&payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<ReservedJob>, QueueError> {
        let mut conn = self.conn.clone();

        let payload: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(&self.main_key)
            .arg(&self.processing_key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let deadline_ms = Utc::now().timestamp_millis() + visibility.as_millis() as i64;
        redis::pipe()
            .cmd("ZADD")
            .arg(&self.inflight_key)
            .arg(deadline_ms)
            .arg(&payload)
            .ignore()
            .cmd("SADD")
            .arg(&self.started_key)
            .arg(&payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)?;

        let job: SchedulingJob = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                // Poisoned payload: drop it into the failed registry so it
                // cannot wedge the queue.
                self.settle(&mut conn, &payload).await?;
                redis::cmd("INCR")
                    .arg(&self.failed_key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(backend)?;
                return Err(QueueError::Malformed(e.to_string()));
            }
        };

        Ok(Some(ReservedJob {
            job,
            payload,
            token: 0,
        }))
    }

    async fn ack(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if self.settle(&mut conn, &job.payload).await? {
            redis::cmd("INCR")
                .arg(&self.finished_key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend)?;
            self.untrack(&mut conn, job.job.deployment_id).await?;
        }
        Ok(())
    }

    async fn fail(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if self.settle(&mut conn, &job.payload).await? {
            redis::cmd("INCR")
                .arg(&self.failed_key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend)?;
            self.untrack(&mut conn, job.job.deployment_id).await?;
        }
        Ok(())
    }

    async fn nack(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if self.settle(&mut conn, &job.payload).await? {
            redis::cmd("RPUSH")
                .arg(&self.main_key)
                .arg(&job.payload)
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let mut moved = 0;

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        for payload in due {
            // ZREM guards against a concurrent mover moving the same entry.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if removed > 0 {
                redis::cmd("LPUSH")
                    .arg(&self.main_key)
                    .arg(&payload)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(backend)?;
                moved += 1;
            }
        }

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.inflight_key)
            .arg("-inf")
            .arg(now_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        for payload in expired {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.inflight_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if removed > 0 {
                redis::pipe()
                    .cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&payload)
                    .ignore()
                    .cmd("SREM")
                    .arg(&self.started_key)
                    .arg(&payload)
                    .ignore()
                    .cmd("RPUSH")
                    .arg(&self.main_key)
                    .arg(&payload)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(backend)?;
                moved += 1;
            }
        }

        Ok(moved)
    }

    async fn is_tracked(&self, deployment_id: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = redis::cmd("HGET")
            .arg(&self.tracked_key)
            .arg(deployment_id)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count.is_some_and(|c| c > 0))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (queued, delayed, started, finished, failed): (u64, u64, u64, Option<u64>, Option<u64>) =
            redis::pipe()
                .cmd("LLEN")
                .arg(&self.main_key)
                .cmd("ZCARD")
                .arg(&self.delayed_key)
                .cmd("SCARD")
                .arg(&self.started_key)
                .cmd("GET")
                .arg(&self.finished_key)
                .cmd("GET")
                .arg(&self.failed_key)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

        Ok(QueueStats {
            queued: queued + delayed,
            started,
            finished: finished.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }
}
