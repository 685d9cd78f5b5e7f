//! Cluster endpoints.
//!
//! - `POST   /clusters` — create (admin); 201
//! - `GET    /clusters` — list for the actor's organisation
//! - `GET    /clusters/{id}/resources` — capacity, free vector, live sets
//! - `DELETE /clusters/{id}` — soft delete (admin); 204

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission;
use crate::api::authz;
use crate::api::deployments::DeploymentResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{ClusterRecord, ClusterStatus, ResourceVec};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/clusters", post(create_cluster).get(list_clusters))
        .route("/clusters/{id}/resources", get(cluster_resources))
        .route("/clusters/{id}", delete(delete_cluster))
}

// =============================================================================
// Request/Response types
// =============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub ram: i64,
    pub cpu: i64,
    #[serde(default)]
    pub gpu: i64,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub id: i64,
    pub name: String,
    pub cpu_total: i64,
    pub ram_total: i64,
    pub gpu_total: i64,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ClusterRecord> for ClusterResponse {
    fn from(c: ClusterRecord) -> Self {
        Self {
            id: c.id,
            name: c.name,
            cpu_total: c.capacity.cpu,
            ram_total: c.capacity.ram,
            gpu_total: c.capacity.gpu,
            status: c.status,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListClustersQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterStateResponse {
    pub capacity: ResourceVec,
    pub free: ResourceVec,
    pub running: Vec<DeploymentResponse>,
    pub pending: Vec<DeploymentResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_cluster(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateClusterRequest>,
) -> Result<Response, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    let cluster = admission::create_cluster(
        state.store(),
        &actor,
        req.name,
        ResourceVec::new(req.cpu, req.ram, req.gpu),
    )
    .await
    .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok((StatusCode::CREATED, Json(ClusterResponse::from(cluster))).into_response())
}

async fn list_clusters(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListClustersQuery>,
) -> Result<Json<Vec<ClusterResponse>>, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    let clusters = admission::list_clusters(state.store(), &actor, query.include_deleted)
        .await
        .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(Json(clusters.into_iter().map(Into::into).collect()))
}

async fn cluster_resources(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<ClusterStateResponse>, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    let cluster_state = admission::list_cluster_state(state.store(), &actor, id)
        .await
        .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(Json(ClusterStateResponse {
        capacity: cluster_state.cluster.capacity,
        free: cluster_state.free,
        running: cluster_state.running.into_iter().map(Into::into).collect(),
        pending: cluster_state.pending.into_iter().map(Into::into).collect(),
    }))
}

async fn delete_cluster(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    admission::delete_cluster(state.store(), &actor, id)
        .await
        .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(StatusCode::NO_CONTENT)
}
