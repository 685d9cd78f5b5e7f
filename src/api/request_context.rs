//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::api::error::ApiError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub idempotency_key: Option<String>,
    /// Email asserted by the (out-of-scope) authentication layer via a
    /// `Bearer user:<email>` token. Identity is resolved against the
    /// store per request.
    pub actor_email: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn email_from_authorization(
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Option<String>, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let Some(email) = token.trim().strip_prefix("user:") else {
        return Err(ApiError::unauthorized(
            "invalid_token",
            "token must be in the form 'user:<email>'",
        )
        .with_request_id(request_id.to_string()));
    };

    let email = email.trim();
    if email.is_empty() || email.len() > 320 || !email.contains('@') {
        return Err(ApiError::unauthorized(
            "invalid_token",
            "token must carry a valid email",
        )
        .with_request_id(request_id.to_string()));
    }

    Ok(Some(email.to_string()))
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, "x-request-id")
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let idempotency_key = header_string(&parts.headers, IDEMPOTENCY_KEY_HEADER);
        if let Some(key) = &idempotency_key {
            if !(8..=128).contains(&key.len()) {
                return Err(ApiError::bad_request(
                    "invalid_idempotency_key",
                    "Idempotency-Key must be between 8 and 128 characters",
                )
                .with_request_id(request_id));
            }
        }

        let actor_email = email_from_authorization(&parts.headers, &request_id)?;

        Ok(Self {
            request_id,
            idempotency_key,
            actor_email,
        })
    }
}
