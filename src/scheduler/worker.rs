//! The scheduler worker loop.
//!
//! Each worker is single-threaded: it reserves one job, takes the
//! cluster's lock, computes a decision inside one store transaction, and
//! settles the job. The ordering discipline is fixed: commit, then ack,
//! then release the lock, then any consequent enqueues. A crash between
//! commit and enqueue is recovered by the sweeper; a crash before ack is
//! recovered by the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::lock::{Lease, LockError, LockService};
use crate::model::{ClusterStatus, DeploymentRecord, DeploymentStatus};
use crate::queue::{JobQueue, QueueError, ReservedJob, SchedulingJob};
use crate::scheduler::planner::{self, Decision};
use crate::scheduler::retry::RetryPolicy;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl WorkerError {
    /// A capacity violation slipping past the planner means corrupted
    /// accounting; the process must exit for supervisor restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Store(StoreError::CapacityExceeded { .. })
        )
    }
}

/// What one worker cycle did with its job.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The job referenced a deployment that no longer exists.
    Dropped,
    /// Duplicate delivery of an already-settled deployment.
    AlreadySettled,
    /// Cluster lock held elsewhere; the job was nacked.
    Busy,
    /// Our lease expired mid-decision; nothing was committed or acked.
    Abandoned,
    Admitted,
    /// Admitted after evicting these deployments.
    PreemptedOthers(Vec<DeploymentRecord>),
    Deferred(Duration),
    /// Poison pill: failed as unschedulable.
    Unschedulable,
    /// Failed because the target cluster is deleted or gone.
    ClusterGone,
}

#[derive(Debug, Clone)]
pub struct SchedulerWorkerConfig {
    pub queue_visibility: Duration,
    pub lock_ttl: Duration,
    /// Sleep between reserve attempts when the queue is empty.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerWorkerConfig {
    fn default() -> Self {
        Self {
            queue_visibility: Duration::from_millis(30_000),
            lock_ttl: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct SchedulerWorker {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn LockService>,
    config: SchedulerWorkerConfig,
}

impl SchedulerWorker {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn LockService>,
        config: SchedulerWorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            config,
        }
    }

    /// Run until shutdown is signaled. Returns an error only for fatal
    /// conditions that should take the process down.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!("Starting scheduler worker");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal scheduler error");
                    return Err(e);
                }
                Err(e) => {
                    // Transient backend failure: the unacked job redelivers
                    // after the visibility timeout.
                    warn!(error = %e, "Scheduler cycle failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Scheduler worker shutting down");
        Ok(())
    }

    /// Reserve and process at most one job. Returns whether a job was
    /// available.
    pub async fn run_cycle(&self) -> Result<bool, WorkerError> {
        let Some(job) = self.queue.reserve(self.config.queue_visibility).await? else {
            return Ok(false);
        };
        self.process_job(job).await?;
        Ok(true)
    }

    #[instrument(skip(self, job), fields(deployment_id = job.job.deployment_id))]
    async fn process_job(&self, job: ReservedJob) -> Result<CycleOutcome, WorkerError> {
        let deployment_id = job.job.deployment_id;

        let Some(deployment) = self.store.deployment(deployment_id).await? else {
            warn!(deployment_id, "Job references unknown deployment");
            self.queue.fail(&job).await?;
            return Ok(CycleOutcome::Dropped);
        };

        // Idempotency under at-least-once delivery: anything not PENDING
        // or PREEMPTED was already handled.
        if !deployment.status.is_schedulable() {
            self.queue.ack(&job).await?;
            return Ok(CycleOutcome::AlreadySettled);
        }

        let lease = match self
            .locks
            .acquire(deployment.cluster_id, self.config.lock_ttl)
            .await?
        {
            Some(lease) => lease,
            None => {
                self.queue.nack(&job).await?;
                return Ok(CycleOutcome::Busy);
            }
        };

        let decided = self.decide(deployment_id, &lease).await;

        // Ack strictly after commit, before releasing the lock.
        let settled = match &decided {
            Ok(outcome) => self.settle(&job, outcome).await,
            Err(_) => Ok(()),
        };

        if !lease.is_expired() {
            if let Err(e) = self.locks.release(&lease).await {
                warn!(error = %e, cluster_id = lease.cluster_id, "Failed to release cluster lock");
            }
        }

        let outcome = decided?;
        settled?;
        self.enqueue_consequences(&job, &outcome).await?;

        Ok(outcome)
    }

    /// Compute and commit one scheduling decision under the cluster lock.
    /// Nothing is committed if the lease expires first.
    async fn decide(&self, deployment_id: i64, lease: &Lease) -> Result<CycleOutcome, WorkerError> {
        let mut txn = self.store.begin_decision(deployment_id).await?;
        let snapshot = txn.snapshot().await?;
        let deployment = &snapshot.deployment;

        // Re-check under the row lock; admission may have cancelled it
        // since the precheck.
        if !deployment.status.is_schedulable() {
            return Ok(CycleOutcome::AlreadySettled);
        }

        let cluster = match &snapshot.cluster {
            Some(cluster) if cluster.status == ClusterStatus::Active => cluster,
            _ => {
                txn.set_status(deployment_id, DeploymentStatus::Failed)
                    .await?;
                if lease.is_expired() {
                    return Ok(CycleOutcome::Abandoned);
                }
                txn.commit().await?;
                warn!(
                    deployment_id,
                    cluster_id = deployment.cluster_id,
                    "Failing deployment: target cluster deleted"
                );
                return Ok(CycleOutcome::ClusterGone);
            }
        };

        // A preempted deployment re-enters the table through PENDING.
        if deployment.status == DeploymentStatus::Preempted {
            txn.set_status(deployment_id, DeploymentStatus::Pending)
                .await?;
        }

        let decision = planner::plan(deployment, &snapshot.running, cluster.capacity);
        let attempt = deployment.attempt_count + 1;

        let outcome = match decision {
            Decision::Admit => {
                txn.set_status(deployment_id, DeploymentStatus::Running)
                    .await?;
                txn.bump_attempt(deployment_id).await?;
                CycleOutcome::Admitted
            }
            Decision::Preempt(victims) => {
                for victim in &victims {
                    txn.set_status(victim.id, DeploymentStatus::Preempted)
                        .await?;
                }
                txn.set_status(deployment_id, DeploymentStatus::Running)
                    .await?;
                txn.bump_attempt(deployment_id).await?;
                CycleOutcome::PreemptedOthers(victims)
            }
            Decision::Defer if self.config.retry.is_exhausted(attempt) => {
                txn.bump_attempt(deployment_id).await?;
                txn.set_status(deployment_id, DeploymentStatus::Failed)
                    .await?;
                CycleOutcome::Unschedulable
            }
            Decision::Defer => {
                txn.bump_attempt(deployment_id).await?;
                CycleOutcome::Deferred(self.config.retry.backoff_delay(attempt))
            }
        };

        // Treat our lease as lost once its TTL has elapsed: skip the
        // commit path entirely and let redelivery retry the decision.
        if lease.is_expired() {
            warn!(
                deployment_id,
                cluster_id = lease.cluster_id,
                "Lock lease expired mid-decision; abandoning"
            );
            return Ok(CycleOutcome::Abandoned);
        }

        txn.commit().await?;

        match &outcome {
            CycleOutcome::Admitted => {
                info!(deployment_id, cluster_id = cluster.id, "Deployment admitted")
            }
            CycleOutcome::PreemptedOthers(victims) => info!(
                deployment_id,
                cluster_id = cluster.id,
                preempted = victims.len(),
                "Deployment admitted after preemption"
            ),
            CycleOutcome::Deferred(delay) => info!(
                deployment_id,
                cluster_id = cluster.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Deployment deferred"
            ),
            CycleOutcome::Unschedulable => warn!(
                deployment_id,
                cluster_id = cluster.id,
                attempt,
                "Deployment failed: retry budget exhausted"
            ),
            _ => {}
        }

        Ok(outcome)
    }

    /// Remove the job from the queue according to the decision.
    async fn settle(&self, job: &ReservedJob, outcome: &CycleOutcome) -> Result<(), WorkerError> {
        match outcome {
            CycleOutcome::AlreadySettled
            | CycleOutcome::Admitted
            | CycleOutcome::PreemptedOthers(_)
            | CycleOutcome::Deferred(_) => self.queue.ack(job).await?,
            CycleOutcome::Unschedulable | CycleOutcome::ClusterGone => {
                self.queue.fail(job).await?
            }
            // No ack: the visibility timeout redelivers.
            CycleOutcome::Abandoned => {}
            // Already settled before the decision.
            CycleOutcome::Dropped | CycleOutcome::Busy => {}
        }
        Ok(())
    }

    /// Enqueues that follow a committed decision.
    async fn enqueue_consequences(
        &self,
        job: &ReservedJob,
        outcome: &CycleOutcome,
    ) -> Result<(), WorkerError> {
        match outcome {
            CycleOutcome::PreemptedOthers(victims) => {
                for victim in victims {
                    self.queue
                        .enqueue_after(
                            SchedulingJob::new(victim.id, victim.attempt_count),
                            self.config.retry.preempt_requeue_delay,
                        )
                        .await?;
                }
            }
            CycleOutcome::Deferred(delay) => {
                self.queue
                    .enqueue_after(
                        SchedulingJob::new(job.job.deployment_id, job.job.attempt + 1),
                        *delay,
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}
