//! The scheduling job queue contract.
//!
//! One main FIFO queue, a delayed queue promoted by the mover, and
//! observational registries (started/finished/failed). Delivery is
//! at-least-once: a reserved job that is never acked reappears after the
//! visibility timeout, so handlers must tolerate duplicates.

mod memory;
mod redis;

pub use self::memory::MemoryJobQueue;
pub use self::redis::{RedisJobQueue, RedisJobQueueConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Queue wire payload. The deployment id is the sole source of truth;
/// the other fields are hints the worker re-reads from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingJob {
    pub deployment_id: i64,
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl SchedulingJob {
    pub fn new(deployment_id: i64, attempt: i32) -> Self {
        Self {
            deployment_id,
            attempt,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job handed to a worker. Holds the exact payload bytes so the backend
/// can locate the reservation on ack/nack.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job: SchedulingJob,
    pub(crate) payload: String,
    pub(crate) token: u64,
}

/// Queue depth counters for the operational surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("malformed job payload: {0}")]
    Malformed(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Malformed(e.to_string())
    }
}

/// At-least-once job queue over deployment ids.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Backend reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Durable FIFO enqueue onto the main queue.
    async fn enqueue(&self, job: SchedulingJob) -> Result<(), QueueError>;

    /// Enqueue onto the delayed queue; the mover promotes it when due.
    async fn enqueue_after(&self, job: SchedulingJob, delay: Duration) -> Result<(), QueueError>;

    /// Take one job off the main queue and hide it for `visibility`.
    /// Returns `None` when the queue is empty.
    async fn reserve(&self, visibility: Duration) -> Result<Option<ReservedJob>, QueueError>;

    /// Remove a reserved job for good; counts toward the finished registry.
    async fn ack(&self, job: &ReservedJob) -> Result<(), QueueError>;

    /// Remove a reserved job and count it toward the failed registry.
    async fn fail(&self, job: &ReservedJob) -> Result<(), QueueError>;

    /// Return a reserved job to the front of the main queue immediately.
    async fn nack(&self, job: &ReservedJob) -> Result<(), QueueError>;

    /// Promote due delayed jobs and redeliver expired reservations.
    /// Returns how many jobs were moved onto the main queue.
    async fn promote_due(&self) -> Result<u64, QueueError>;

    /// Whether a deployment id is anywhere in the queue's custody
    /// (main, delayed, or reserved). Used by the recovery sweeper.
    async fn is_tracked(&self, deployment_id: i64) -> Result<bool, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
