//! berth scheduler worker process.
//!
//! Runs N scheduler workers over the shared queue, plus the delayed-job
//! mover and the recovery sweeper, under one shutdown signal. Exits 0 on
//! clean shutdown and non-zero when a worker hits an unrecoverable store
//! or queue failure.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use berth::config::Config;
use berth::lock::{LockService, RedisLockService, RedisLockServiceConfig};
use berth::queue::{JobQueue, RedisJobQueue, RedisJobQueueConfig};
use berth::scheduler::{
    DelayedJobMover, RecoverySweeper, RecoverySweeperConfig, RetryPolicy, SchedulerWorker,
    SchedulerWorkerConfig,
};
use berth::store::{PgStore, PgStoreConfig, Store};

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Worker process failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting berth scheduler worker process");

    let config = Config::from_env()?;

    let store = Arc::new(
        PgStore::connect(&PgStoreConfig {
            database_url: config.database_url.clone(),
            ..Default::default()
        })
        .await?,
    ) as Arc<dyn Store>;

    let queue = Arc::new(
        RedisJobQueue::connect(&RedisJobQueueConfig {
            url: config.redis_url.clone(),
            ..Default::default()
        })
        .await?,
    ) as Arc<dyn JobQueue>;

    let locks = Arc::new(
        RedisLockService::connect(&RedisLockServiceConfig {
            url: config.redis_url.clone(),
        })
        .await?,
    ) as Arc<dyn LockService>;

    let worker_config = SchedulerWorkerConfig {
        queue_visibility: config.queue_visibility,
        lock_ttl: config.lock_ttl,
        retry: RetryPolicy {
            base: config.retry_base,
            cap: config.retry_cap,
            preempt_requeue_delay: config.preempt_requeue_delay,
            max_attempts: config.max_attempts,
        },
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = JoinSet::new();
    for _ in 0..config.worker_concurrency.max(1) {
        let worker = SchedulerWorker::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&locks),
            worker_config.clone(),
        );
        let rx = shutdown_rx.clone();
        workers.spawn(async move { worker.run(rx).await });
    }

    let mover = DelayedJobMover::new(Arc::clone(&queue), config.mover_interval);
    let mover_rx = shutdown_rx.clone();
    let mover_handle = tokio::spawn(async move { mover.run(mover_rx).await });

    let sweeper = RecoverySweeper::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        RecoverySweeperConfig {
            interval: config.sweep_interval,
            grace: config.queue_visibility,
        },
    );
    let sweeper_rx = shutdown_rx.clone();
    let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_rx).await });

    info!(
        workers = config.worker_concurrency.max(1),
        "Scheduler workers running"
    );

    // Run until a signal arrives or a worker dies on a fatal error.
    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        Some(result) = workers.join_next() => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e.into()),
                Err(e) => failure = Some(anyhow!("worker task panicked: {e}")),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if failure.is_none() => failure = Some(e.into()),
            Ok(Err(_)) => {}
            Err(e) if failure.is_none() => failure = Some(anyhow!("worker task panicked: {e}")),
            Err(_) => {}
        }
    }
    let _ = mover_handle.await;
    let _ = sweeper_handle.await;

    match failure {
        Some(e) => Err(e),
        None => {
            info!("Worker process shut down cleanly");
            Ok(())
        }
    }
}
