//! In-memory lock service for tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::lock::{Lease, LockError, LockService};

struct Held {
    token: String,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct MemoryLockService {
    inner: Arc<Mutex<HashMap<i64, Held>>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Held>> {
        self.inner.lock().expect("lock mutex poisoned")
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, cluster_id: i64, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut held = self.lock();
        let now = Instant::now();

        if let Some(existing) = held.get(&cluster_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            cluster_id,
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(Lease::new(cluster_id, token, ttl)))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut held = self.lock();
        let matches = held
            .get(&lease.cluster_id)
            .is_some_and(|h| h.token == lease.token);
        if matches {
            held.remove(&lease.cluster_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = MemoryLockService::new();
        let lease = locks.acquire(1, TTL).await.unwrap().unwrap();
        assert!(locks.acquire(1, TTL).await.unwrap().is_none());
        // A different cluster is unaffected.
        assert!(locks.acquire(2, TTL).await.unwrap().is_some());

        locks.release(&lease).await.unwrap();
        assert!(locks.acquire(1, TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = MemoryLockService::new();
        let stale = locks.acquire(1, TTL).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(stale.is_expired());

        let successor = locks.acquire(1, TTL).await.unwrap().unwrap();

        // The stale holder's release must not free the successor's lock.
        locks.release(&stale).await.unwrap();
        assert!(locks.acquire(1, TTL).await.unwrap().is_none());

        locks.release(&successor).await.unwrap();
        assert!(locks.acquire(1, TTL).await.unwrap().is_some());
    }
}
