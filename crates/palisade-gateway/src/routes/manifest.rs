//! Manifest validation endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use palisade_core::manifest::ManifestSubmission;
use palisade_core::policy::UNKNOWN_POLICY_VERSION;

use super::{ip_of, map_json_rejection};
use crate::auth::{optional_bearer, RequestMeta};
use crate::error::ApiError;
use crate::orchestrator::{self, ValidationOutcome};
use crate::state::AppState;

/// `POST /v1/manifest/validate` — the hot path.
///
/// Backpressure and the overall request deadline are enforced here: excess
/// in-flight requests answer 503 with `Retry-After`, and a pipeline that
/// outlives the deadline answers 504 (any state already committed to the
/// ledger stays committed).
pub(super) async fn validate(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ManifestSubmission>, JsonRejection>,
) -> Result<Json<ValidationOutcome>, ApiError> {
    let Json(submission) = payload.map_err(|r| map_json_rejection(&r))?;
    let meta = RequestMeta::new("/v1/manifest/validate", ip_of(connect_info.as_ref()));

    let _permit = state
        .validate_permits
        .try_acquire()
        .map_err(|_| ApiError::overloaded(1))?;

    let auth = optional_bearer(&state, &headers, &meta)?;

    let deadline = Duration::from_secs(state.config.server.request_deadline_secs);
    let outcome = tokio::time::timeout(
        deadline,
        orchestrator::validate(&state, submission, auth.as_ref(), &meta),
    )
    .await
    .map_err(|_| ApiError::deadline_exceeded())??;

    Ok(Json(outcome))
}

/// `GET /v1/manifest/health` — policy-engine status.
pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let engine_available = state.adapter.health().await;
    let cached_version = state.adapter.cached_version();

    Json(json!({
        "status": if engine_available { "healthy" } else { "degraded" },
        "engine_available": engine_available,
        "policy_version": cached_version
            .as_deref()
            .unwrap_or(UNKNOWN_POLICY_VERSION),
        "policy_loaded": cached_version.is_some(),
    }))
}
