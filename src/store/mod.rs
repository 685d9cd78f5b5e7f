//! The durable store contract.
//!
//! The scheduler is pure over plain records; this module is the narrow
//! data-access contract that mediates persistence. Two implementations
//! exist: Postgres for production and an in-memory store for tests.
//!
//! A [`DecisionTxn`] scopes exactly one scheduling decision: it re-reads
//! the deployment, its cluster, and the cluster's RUNNING set under row
//! locks, stages status transitions, and commits them atomically. Commit
//! refuses to finalize a decision that would overcommit the cluster.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    ClusterRecord, DeploymentRecord, DeploymentStatus, NewCluster, NewDeployment, UserRecord,
};

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row lookup came up empty where a row was required.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Attempted status transition is not legal per the lifecycle table.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    /// Committing the decision would overcommit the cluster. This must
    /// never happen under the per-cluster lock; treat as fatal.
    #[error("capacity invariant violated for cluster {cluster_id}")]
    CapacityExceeded { cluster_id: i64 },

    /// Uniqueness or state conflict (duplicate name, already deleted).
    #[error("{0}")]
    Conflict(String),

    /// Backend I/O failure.
    #[error("store backend error: {message}")]
    Backend { message: String, retryable: bool },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { retryable: true, .. })
    }
}

/// Row-locked snapshot a decision is computed from.
#[derive(Debug, Clone)]
pub struct DecisionSnapshot {
    pub deployment: DeploymentRecord,
    /// None if the cluster row is gone entirely.
    pub cluster: Option<ClusterRecord>,
    pub running: Vec<DeploymentRecord>,
}

/// One scheduling decision's transaction.
///
/// Dropping the transaction without calling [`DecisionTxn::commit`] rolls
/// everything back.
#[async_trait]
pub trait DecisionTxn: Send {
    /// Re-read the deployment, its cluster, and the cluster's RUNNING set
    /// under locks that hold until commit.
    async fn snapshot(&mut self) -> Result<DecisionSnapshot, StoreError>;

    /// Stage a status transition for a deployment. Legality is checked
    /// against the row's current status within this transaction.
    async fn set_status(&mut self, id: i64, to: DeploymentStatus) -> Result<(), StoreError>;

    /// Stage an `attempt_count` increment.
    async fn bump_attempt(&mut self, id: i64) -> Result<(), StoreError>;

    /// Atomically apply all staged writes. Verifies the capacity invariant
    /// for the decision's cluster before finalizing.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Idempotency replay lookup result.
#[derive(Debug)]
pub enum IdempotencyCheck {
    NotFound,
    /// Same key, same request: replay the stored response.
    Found {
        status_code: i32,
        body: Option<serde_json::Value>,
    },
    /// Same key, different request hash.
    Conflict,
}

/// Stored response for an idempotent write endpoint.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub org_id: String,
    pub actor_id: String,
    pub endpoint_name: String,
    pub idempotency_key: String,
    pub request_hash: String,
    pub response_status_code: i32,
    pub response_body: Option<serde_json::Value>,
}

/// Narrow data-access contract over the relational state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_cluster(&self, new: NewCluster) -> Result<ClusterRecord, StoreError>;

    async fn cluster(&self, id: i64) -> Result<Option<ClusterRecord>, StoreError>;

    async fn list_clusters(
        &self,
        org_id: i64,
        include_deleted: bool,
    ) -> Result<Vec<ClusterRecord>, StoreError>;

    /// Soft delete: the row remains for history queries.
    async fn soft_delete_cluster(&self, id: i64) -> Result<ClusterRecord, StoreError>;

    async fn create_deployment(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError>;

    async fn deployment(&self, id: i64) -> Result<Option<DeploymentRecord>, StoreError>;

    async fn list_deployments(
        &self,
        org_id: i64,
        cluster_id: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Committed-state read of a cluster's deployments in one status.
    async fn deployments_by_status(
        &self,
        cluster_id: i64,
        status: DeploymentStatus,
    ) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Transition any non-terminal deployment to DELETED in a transaction.
    async fn cancel_deployment(&self, id: i64) -> Result<DeploymentRecord, StoreError>;

    /// All PENDING and PREEMPTED deployments, for the recovery sweeper.
    async fn live_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError>;

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Open a decision transaction for one deployment.
    async fn begin_decision(&self, deployment_id: i64)
        -> Result<Box<dyn DecisionTxn>, StoreError>;

    async fn idempotency_check(
        &self,
        org_id: &str,
        actor_id: &str,
        endpoint_name: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, StoreError>;

    async fn idempotency_store(&self, record: IdempotencyRecord) -> Result<(), StoreError>;
}
