//! Recovery sweeper.
//!
//! A worker can crash after committing a decision but before performing
//! its consequent enqueues, leaving a PENDING or PREEMPTED deployment on
//! no queue at all. The sweeper periodically scans for such deployments
//! and re-enqueues them. Duplicate enqueues are harmless: the worker's
//! status precheck settles them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::queue::{JobQueue, SchedulingJob};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RecoverySweeperConfig {
    pub interval: Duration,
    /// Leave recently-touched deployments alone: their enqueue may still
    /// be in flight on the path that committed them.
    pub grace: Duration,
}

impl Default for RecoverySweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            grace: Duration::from_millis(30_000),
        }
    }
}

pub struct RecoverySweeper {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    config: RecoverySweeperConfig,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: RecoverySweeperConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting recovery sweeper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(recovered) if recovered > 0 => {
                            info!(recovered, "Recovery sweep re-enqueued deployments");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Recovery sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Recovery sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: re-enqueue every live deployment the queue has lost
    /// track of. Returns how many were recovered.
    pub async fn sweep_once(&self) -> Result<u64, crate::scheduler::WorkerError> {
        let mut recovered = 0;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for deployment in self.store.live_deployments().await? {
            if deployment.updated_at > cutoff {
                continue;
            }
            if self.queue.is_tracked(deployment.id).await? {
                continue;
            }

            warn!(
                deployment_id = deployment.id,
                status = %deployment.status,
                "Live deployment found on no queue; re-enqueueing"
            );
            self.queue
                .enqueue(SchedulingJob::new(
                    deployment.id,
                    deployment.attempt_count,
                ))
                .await?;
            recovered += 1;
        }

        Ok(recovered)
    }
}
