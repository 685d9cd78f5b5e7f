//! Per-cluster mutual exclusion leases.
//!
//! A lease carries an opaque owner token; release only succeeds when the
//! stored token still matches, so a slow worker whose lease expired can
//! never release a successor's lock. The worker checks
//! [`Lease::is_expired`] before committing and abandons the decision if
//! its lease has lapsed.

mod memory;
mod redis;

pub use self::memory::MemoryLockService;
pub use self::redis::{RedisLockService, RedisLockServiceConfig};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Proof of lock ownership for one cluster.
#[derive(Debug, Clone)]
pub struct Lease {
    pub cluster_id: i64,
    pub token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl Lease {
    pub(crate) fn new(cluster_id: i64, token: String, ttl: Duration) -> Self {
        Self {
            cluster_id,
            token,
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// Whether wall-clock time since acquisition has exceeded the TTL.
    /// Past this point the holder must not commit or release.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Distributed lock service keyed by cluster id.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the cluster's lock. `None` means it is held elsewhere;
    /// the caller does not block.
    async fn acquire(&self, cluster_id: i64, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Release the lease if the owner token still matches. A mismatched
    /// release is a silent no-op.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}
