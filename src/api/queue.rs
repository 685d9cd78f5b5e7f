//! Queue status endpoint for the operational surface.

use axum::{extract::State, routing::get, Json, Router};
use tracing::error;

use crate::api::authz;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::queue::QueueStats;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/queue/status", get(queue_status))
}

async fn queue_status(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<QueueStats>, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::resolve_actor(&state, &ctx).await?;

    let stats = state.queue().stats().await.map_err(|e| {
        error!(error = %e, request_id = %request_id, "Failed to read queue stats");
        ApiError::internal("internal_error", "Failed to read queue status")
            .with_request_id(request_id.clone())
    })?;

    Ok(Json(stats))
}
