//! Redis lock backend: `SET key token NX PX ttl_ms` to acquire,
//! compare-and-delete to release.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::lock::{Lease, LockError, LockService};

/// Release only deletes the key when the stored token matches the caller's.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockServiceConfig {
    pub url: String,
}

impl Default for RedisLockServiceConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    release: redis::Script,
}

fn backend(e: redis::RedisError) -> LockError {
    LockError::Backend(e.to_string())
}

fn lock_key(cluster_id: i64) -> String {
    format!("lock:cluster:{cluster_id}")
}

impl RedisLockService {
    pub async fn connect(config: &RedisLockServiceConfig) -> Result<Self, LockError> {
        let client = redis::Client::open(config.url.as_str()).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, cluster_id: i64, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(cluster_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(acquired.map(|_| Lease::new(cluster_id, token, ttl)))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        self.release
            .key(lock_key(lease.cluster_id))
            .arg(&lease.token)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
