//! Deployment endpoints.
//!
//! - `POST   /deployments` — submit; 201 `{id, status}`
//! - `GET    /deployments` — list, optionally by cluster / with deleted
//! - `GET    /deployments/{id}` — detail
//! - `DELETE /deployments/{id}` — cancel (soft delete)

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
use crate::api::error::ApiError;
use crate::api::idempotency;
use crate::api::request_context::RequestContext;
use crate::model::{DeploymentRecord, DeploymentStatus, ResourceVec};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/deployments", post(create_deployment).get(list_deployments))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}", delete(cancel_deployment))
}

// =============================================================================
// Request/Response types
// =============================================================================

fn default_priority() -> i32 {
    3
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub cluster_id: i64,
    pub ram: i64,
    pub cpu: i64,
    #[serde(default)]
    pub gpu: i64,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

#[derive(Debug, Serialize)]
pub struct CreateDeploymentResponse {
    pub id: i64,
    pub status: DeploymentStatus,
}

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: i64,
    pub name: String,
    pub cluster_id: i64,
    pub cpu: i64,
    pub ram: i64,
    pub gpu: i64,
    pub priority: i32,
    pub status: DeploymentStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeploymentRecord> for DeploymentResponse {
    fn from(d: DeploymentRecord) -> Self {
        Self {
            id: d.id,
            name: d.name,
            cluster_id: d.cluster_id,
            cpu: d.resources.cpu,
            ram: d.resources.ram,
            gpu: d.resources.gpu,
            priority: d.priority,
            status: d.status,
            attempt_count: d.attempt_count,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListDeploymentsQuery {
    pub cluster_id: Option<i64>,
    #[serde(default)]
    pub include_deleted: bool,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<Response, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;
    let endpoint_name = "deployments.create";

    let keyed_hash = ctx
        .idempotency_key
        .as_deref()
        .map(|key| idempotency::request_hash(endpoint_name, &req).map(|hash| (key, hash)))
        .transpose()
        .map_err(|e| e.with_request_id(request_id.clone()))?;

    let org_scope = actor.org_id.to_string();
    let actor_id = actor.user_id.to_string();

    if let Some((key, hash)) = keyed_hash.as_ref() {
        if let Some((status, body)) = idempotency::check(
            &state,
            &org_scope,
            &actor_id,
            endpoint_name,
            key,
            hash,
            &request_id,
        )
        .await?
        {
            return Ok(
                (status, Json(body.unwrap_or_else(|| serde_json::json!({})))).into_response(),
            );
        }
    }

    let deployment = admission::submit_deployment(
        state.store(),
        state.queue(),
        &actor,
        admission::SubmitDeployment {
            cluster_id: req.cluster_id,
            name: req.name.clone(),
            resources: ResourceVec::new(req.cpu, req.ram, req.gpu),
            priority: req.priority,
        },
    )
    .await
    .map_err(|e| ApiError::from_admission(e, &request_id))?;

    let response = CreateDeploymentResponse {
        id: deployment.id,
        status: deployment.status,
    };

    if let Some((key, hash)) = keyed_hash.as_ref() {
        let body = serde_json::to_value(&response).ok();
        idempotency::store(
            &state,
            &org_scope,
            &actor_id,
            endpoint_name,
            key,
            hash,
            StatusCode::CREATED,
            body,
            &request_id,
        )
        .await?;
    }

    Ok((StatusCode::CREATED, Json(response)).into_response())
}

async fn list_deployments(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentResponse>>, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    let deployments = admission::list_deployments(
        state.store(),
        &actor,
        query.cluster_id,
        query.include_deleted,
    )
    .await
    .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(Json(deployments.into_iter().map(Into::into).collect()))
}

async fn get_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    let deployment = admission::get_deployment(state.store(), &actor, id)
        .await
        .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(Json(deployment.into()))
}

async fn cancel_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let request_id = ctx.request_id.clone();
    let actor = authz::resolve_actor(&state, &ctx).await?;

    admission::cancel_deployment(state.store(), &actor, id)
        .await
        .map_err(|e| ApiError::from_admission(e, &request_id))?;

    Ok(StatusCode::NO_CONTENT)
}
