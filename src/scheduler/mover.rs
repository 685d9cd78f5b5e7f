//! Delayed-job mover.
//!
//! Promotes due entries from the delayed queue to the main queue and
//! returns expired reservations for redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::queue::JobQueue;

pub struct DelayedJobMover {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
}

impl DelayedJobMover {
    pub fn new(queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting delayed-job mover"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.queue.promote_due().await {
                        Ok(moved) if moved > 0 => {
                            debug!(moved, "Promoted due jobs");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Failed to promote due jobs");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Delayed-job mover shutting down");
                        break;
                    }
                }
            }
        }
    }
}
