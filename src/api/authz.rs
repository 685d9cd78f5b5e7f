//! Actor resolution for the HTTP surface.
//!
//! The admission layer trusts a validated [`Actor`]; this module turns
//! the asserted email from the request context into one by looking the
//! user up in the store.

use tracing::error;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::Actor;
use crate::state::AppState;

pub async fn resolve_actor(state: &AppState, ctx: &RequestContext) -> Result<Actor, ApiError> {
    let request_id = &ctx.request_id;

    let Some(email) = ctx.actor_email.as_deref() else {
        return Err(ApiError::unauthorized(
            "unauthorized",
            "Missing or invalid Authorization token",
        )
        .with_request_id(request_id.clone()));
    };

    let user = state
        .store()
        .user_by_email(email)
        .await
        .map_err(|e| {
            error!(error = %e, request_id = %request_id, "Failed to load user");
            ApiError::internal("internal_error", "Failed to authorize request")
                .with_request_id(request_id.clone())
        })?;

    let Some(user) = user else {
        return Err(ApiError::forbidden("forbidden", "Unknown user")
            .with_request_id(request_id.clone()));
    };

    Ok(Actor {
        user_id: user.id,
        org_id: user.org_id,
        role: user.role,
    })
}
