//! Configuration for the API server and the scheduler worker.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(name, default_ms))
}

/// Shared configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the API server listens on.
    pub listen_addr: SocketAddr,

    /// Store connection string.
    pub database_url: String,

    /// Queue/lock backend address.
    pub redis_url: String,

    /// Whether we're in development mode (runs migrations on boot).
    pub dev_mode: bool,

    /// Number of scheduler workers the worker process runs.
    pub worker_concurrency: usize,

    /// How long a reserved queue job stays hidden before redelivery.
    /// Must exceed the lock TTL plus expected commit latency.
    pub queue_visibility: Duration,

    /// Per-cluster lock lease TTL.
    pub lock_ttl: Duration,

    /// Base delay of the deferred-retry backoff schedule.
    pub retry_base: Duration,

    /// Cap on the deferred-retry backoff schedule.
    pub retry_cap: Duration,

    /// Re-enqueue delay for deployments that were just preempted.
    pub preempt_requeue_delay: Duration,

    /// Deferral count after which a deployment is failed as unschedulable.
    pub max_attempts: i32,

    /// Interval between recovery sweeps.
    pub sweep_interval: Duration,

    /// Interval between delayed-job promotion passes.
    pub mover_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/berth".to_string());

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let dev_mode = std::env::var("BERTH_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            database_url,
            redis_url,
            dev_mode,
            worker_concurrency: env_u64("WORKER_CONCURRENCY", 2) as usize,
            queue_visibility: env_ms("QUEUE_VISIBILITY_MS", 30_000),
            lock_ttl: env_ms("LOCK_TTL_MS", 10_000),
            retry_base: env_ms("RETRY_BASE_MS", 5_000),
            retry_cap: env_ms("RETRY_CAP_MS", 60_000),
            preempt_requeue_delay: env_ms("PREEMPT_REQUEUE_MS", 2_000),
            max_attempts: env_u64("MAX_ATTEMPTS", 20) as i32,
            sweep_interval: env_ms("SWEEP_INTERVAL_MS", 30_000),
            mover_interval: env_ms("MOVER_INTERVAL_MS", 500),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("static addr"),
            database_url: "postgres://localhost/berth".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            dev_mode: false,
            worker_concurrency: 2,
            queue_visibility: Duration::from_millis(30_000),
            lock_ttl: Duration::from_millis(10_000),
            retry_base: Duration::from_millis(5_000),
            retry_cap: Duration::from_millis(60_000),
            preempt_requeue_delay: Duration::from_millis(2_000),
            max_attempts: 20,
            sweep_interval: Duration::from_millis(30_000),
            mover_interval: Duration::from_millis(500),
        }
    }
}
