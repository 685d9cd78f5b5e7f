//! Idempotency helpers for retry-safe write endpoints.

use axum::http::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::store::{IdempotencyCheck, IdempotencyRecord};

fn canonicalize_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();

            let mut ordered = serde_json::Map::new();
            for key in keys {
                if let Some(mut value) = map.remove(&key) {
                    canonicalize_json(&mut value);
                    ordered.insert(key, value);
                }
            }

            *map = ordered;
        }
        serde_json::Value::Array(items) => {
            for item in items {
                canonicalize_json(item);
            }
        }
        _ => {}
    }
}

pub fn request_hash(endpoint_name: &str, request: &impl Serialize) -> Result<String, ApiError> {
    let mut value = serde_json::to_value(request).map_err(|e| {
        ApiError::internal(
            "internal_error",
            format!("Failed to serialize request body: {e}"),
        )
    })?;

    canonicalize_json(&mut value);
    let canonical = serde_json::to_string(&value).map_err(|e| {
        ApiError::internal(
            "internal_error",
            format!("Failed to serialize canonical request body: {e}"),
        )
    })?;

    let mut hasher = Sha256::new();
    hasher.update(endpoint_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn check(
    state: &AppState,
    org_scope: &str,
    actor_id: &str,
    endpoint_name: &str,
    idempotency_key: &str,
    request_hash: &str,
    request_id: &str,
) -> Result<Option<(StatusCode, Option<serde_json::Value>)>, ApiError> {
    let check = state
        .store()
        .idempotency_check(org_scope, actor_id, endpoint_name, idempotency_key, request_hash)
        .await
        .map_err(|e| {
            error!(error = %e, request_id, "Failed to check idempotency record");
            ApiError::internal("internal_error", "Failed to process request")
                .with_request_id(request_id.to_string())
        })?;

    match check {
        IdempotencyCheck::NotFound => Ok(None),
        IdempotencyCheck::Found { status_code, body } => {
            let status = StatusCode::from_u16(status_code as u16).unwrap_or(StatusCode::OK);
            Ok(Some((status, body)))
        }
        IdempotencyCheck::Conflict => Err(ApiError::conflict(
            "idempotency_key_conflict",
            "Idempotency-Key was already used with a different request",
        )
        .with_request_id(request_id.to_string())),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn store(
    state: &AppState,
    org_scope: &str,
    actor_id: &str,
    endpoint_name: &str,
    idempotency_key: &str,
    request_hash: &str,
    status: StatusCode,
    body: Option<serde_json::Value>,
    request_id: &str,
) -> Result<(), ApiError> {
    state
        .store()
        .idempotency_store(IdempotencyRecord {
            org_id: org_scope.to_string(),
            actor_id: actor_id.to_string(),
            endpoint_name: endpoint_name.to_string(),
            idempotency_key: idempotency_key.to_string(),
            request_hash: request_hash.to_string(),
            response_status_code: status.as_u16() as i32,
            response_body: body,
        })
        .await
        .map_err(|e| {
            error!(error = %e, request_id, "Failed to store idempotency record");
            ApiError::internal("internal_error", "Failed to process request")
                .with_request_id(request_id.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_ignores_key_order() {
        let a = serde_json::json!({"name": "web", "cluster_id": 1});
        let b = serde_json::json!({"cluster_id": 1, "name": "web"});
        assert_eq!(
            request_hash("deployments.create", &a).unwrap(),
            request_hash("deployments.create", &b).unwrap()
        );
    }

    #[test]
    fn test_request_hash_differs_by_endpoint() {
        let body = serde_json::json!({"name": "web"});
        assert_ne!(
            request_hash("deployments.create", &body).unwrap(),
            request_hash("clusters.create", &body).unwrap()
        );
    }
}
