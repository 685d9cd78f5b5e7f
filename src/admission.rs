//! The admission contract: the surface the scheduler exposes to the HTTP
//! shell. Plain async functions over the store and queue.
//!
//! Authorization predicate: admins operate on anything inside their
//! organisation; developers only on deployments they own. Cross-
//! organisation access is always denied. Reads resolve foreign rows as
//! not-found so ids do not leak across tenants; submission against a
//! foreign cluster is an explicit authorization failure.

use thiserror::Error;
use tracing::warn;

use crate::model::{
    Actor, ClusterRecord, ClusterStatus, DeploymentRecord, DeploymentStatus, NewCluster,
    NewDeployment, ResourceVec, Role, PRIORITY_MAX, PRIORITY_MIN,
};
use crate::queue::{JobQueue, QueueError, SchedulingJob};
use crate::scheduler::resources;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Request violates static constraints; never enqueued.
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    /// Actor lacks the role or ownership for this operation.
    #[error("{0}")]
    Authz(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// State conflict: duplicate name, illegal transition.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => AdmissionError::NotFound(what),
            StoreError::Conflict(message) => AdmissionError::Conflict(message),
            StoreError::IllegalTransition { from, to } => {
                AdmissionError::Conflict(format!("illegal status transition: {from} -> {to}"))
            }
            other => AdmissionError::Store(other),
        }
    }
}

fn validation(code: &'static str, message: impl Into<String>) -> AdmissionError {
    AdmissionError::Validation {
        code,
        message: message.into(),
    }
}

#[derive(Debug, Clone)]
pub struct SubmitDeployment {
    pub cluster_id: i64,
    pub name: String,
    pub resources: ResourceVec,
    pub priority: i32,
}

/// Capacity, free vector, and the live deployments of one cluster.
#[derive(Debug)]
pub struct ClusterState {
    pub cluster: ClusterRecord,
    pub free: ResourceVec,
    pub running: Vec<DeploymentRecord>,
    pub pending: Vec<DeploymentRecord>,
}

fn require_admin(actor: &Actor) -> Result<(), AdmissionError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Developer => Err(AdmissionError::Authz("admin role required")),
    }
}

/// Validate, create in PENDING, enqueue, return the record.
pub async fn submit_deployment(
    store: &dyn Store,
    queue: &dyn JobQueue,
    actor: &Actor,
    req: SubmitDeployment,
) -> Result<DeploymentRecord, AdmissionError> {
    if req.name.trim().is_empty() {
        return Err(validation("invalid_name", "deployment name cannot be empty"));
    }

    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&req.priority) {
        return Err(validation(
            "invalid_priority",
            format!("priority must be between {PRIORITY_MIN} and {PRIORITY_MAX}"),
        ));
    }

    if req.resources.cpu <= 0 || req.resources.ram <= 0 || req.resources.gpu < 0 {
        return Err(validation(
            "invalid_resources",
            "cpu and ram must be positive; gpu must be non-negative",
        ));
    }

    let cluster = store
        .cluster(req.cluster_id)
        .await?
        .ok_or_else(|| validation("cluster_not_found", "cluster not found"))?;

    if cluster.org_id != actor.org_id {
        return Err(AdmissionError::Authz(
            "cluster belongs to another organisation",
        ));
    }

    if cluster.status != ClusterStatus::Active {
        return Err(validation("cluster_not_active", "cluster is deleted"));
    }

    if req.resources.cpu > cluster.capacity.cpu {
        return Err(validation(
            "insufficient_cpu",
            "requested cpu exceeds cluster capacity",
        ));
    }
    if req.resources.ram > cluster.capacity.ram {
        return Err(validation(
            "insufficient_ram",
            "requested ram exceeds cluster capacity",
        ));
    }
    if req.resources.gpu > cluster.capacity.gpu {
        return Err(validation(
            "insufficient_gpu",
            "requested gpu exceeds cluster capacity",
        ));
    }

    let deployment = store
        .create_deployment(NewDeployment {
            cluster_id: cluster.id,
            owner_id: actor.user_id,
            name: req.name,
            resources: req.resources,
            priority: req.priority,
        })
        .await?;

    // The deployment is durable; if this enqueue is lost the sweeper
    // picks the row up on its next pass.
    if let Err(e) = queue.enqueue(SchedulingJob::new(deployment.id, 0)).await {
        warn!(
            deployment_id = deployment.id,
            error = %e,
            "Failed to enqueue submitted deployment; sweeper will recover it"
        );
    }

    Ok(deployment)
}

/// Load a deployment and verify the actor's organisation can see it.
async fn visible_deployment(
    store: &dyn Store,
    actor: &Actor,
    id: i64,
) -> Result<DeploymentRecord, AdmissionError> {
    let deployment = store
        .deployment(id)
        .await?
        .ok_or(AdmissionError::NotFound("deployment"))?;
    let cluster = store
        .cluster(deployment.cluster_id)
        .await?
        .ok_or(AdmissionError::NotFound("deployment"))?;
    if cluster.org_id != actor.org_id {
        return Err(AdmissionError::NotFound("deployment"));
    }
    Ok(deployment)
}

pub async fn get_deployment(
    store: &dyn Store,
    actor: &Actor,
    id: i64,
) -> Result<DeploymentRecord, AdmissionError> {
    visible_deployment(store, actor, id).await
}

pub async fn list_deployments(
    store: &dyn Store,
    actor: &Actor,
    cluster_id: Option<i64>,
    include_deleted: bool,
) -> Result<Vec<DeploymentRecord>, AdmissionError> {
    if let Some(cluster_id) = cluster_id {
        let cluster = store
            .cluster(cluster_id)
            .await?
            .ok_or(AdmissionError::NotFound("cluster"))?;
        if cluster.org_id != actor.org_id {
            return Err(AdmissionError::NotFound("cluster"));
        }
    }
    Ok(store
        .list_deployments(actor.org_id, cluster_id, include_deleted)
        .await?)
}

/// Transition any non-terminal deployment to DELETED. The worker's status
/// precheck removes it from future queue processing.
pub async fn cancel_deployment(
    store: &dyn Store,
    actor: &Actor,
    id: i64,
) -> Result<DeploymentRecord, AdmissionError> {
    let deployment = visible_deployment(store, actor, id).await?;

    if actor.role == Role::Developer && deployment.owner_id != actor.user_id {
        return Err(AdmissionError::Authz(
            "developers may only cancel their own deployments",
        ));
    }

    Ok(store.cancel_deployment(deployment.id).await?)
}

pub async fn create_cluster(
    store: &dyn Store,
    actor: &Actor,
    name: String,
    capacity: ResourceVec,
) -> Result<ClusterRecord, AdmissionError> {
    require_admin(actor)?;

    if name.trim().is_empty() {
        return Err(validation("invalid_name", "cluster name cannot be empty"));
    }
    if capacity.cpu <= 0 || capacity.ram <= 0 || capacity.gpu < 0 {
        return Err(validation(
            "invalid_resources",
            "cpu and ram must be positive; gpu must be non-negative",
        ));
    }

    Ok(store
        .create_cluster(NewCluster {
            org_id: actor.org_id,
            name,
            capacity,
        })
        .await?)
}

pub async fn list_clusters(
    store: &dyn Store,
    actor: &Actor,
    include_deleted: bool,
) -> Result<Vec<ClusterRecord>, AdmissionError> {
    Ok(store.list_clusters(actor.org_id, include_deleted).await?)
}

/// Soft delete. Pending deployments against the cluster fail on their
/// next worker cycle.
pub async fn delete_cluster(
    store: &dyn Store,
    actor: &Actor,
    id: i64,
) -> Result<ClusterRecord, AdmissionError> {
    require_admin(actor)?;

    let cluster = store
        .cluster(id)
        .await?
        .ok_or(AdmissionError::NotFound("cluster"))?;
    if cluster.org_id != actor.org_id {
        return Err(AdmissionError::NotFound("cluster"));
    }

    Ok(store.soft_delete_cluster(cluster.id).await?)
}

pub async fn list_cluster_state(
    store: &dyn Store,
    actor: &Actor,
    cluster_id: i64,
) -> Result<ClusterState, AdmissionError> {
    let cluster = store
        .cluster(cluster_id)
        .await?
        .ok_or(AdmissionError::NotFound("cluster"))?;
    if cluster.org_id != actor.org_id {
        return Err(AdmissionError::NotFound("cluster"));
    }

    let running = store
        .deployments_by_status(cluster.id, DeploymentStatus::Running)
        .await?;
    let pending = store
        .deployments_by_status(cluster.id, DeploymentStatus::Pending)
        .await?;
    let free = resources::free(cluster.capacity, &running);

    Ok(ClusterState {
        cluster,
        free,
        running,
        pending,
    })
}
