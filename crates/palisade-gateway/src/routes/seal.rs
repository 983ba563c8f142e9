//! Seal verification and execution endpoints.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use palisade_core::ledger::ExecutionOutcome;
use palisade_core::seal::verify_signature;

use super::{format_time, map_query_rejection};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct SealIdParams {
    seal_id: String,
}

/// The response of `GET /v1/seal/verify`.
#[derive(Debug, Serialize)]
pub(super) struct VerifyResponse {
    seal_id: String,
    valid: bool,
    approved: bool,
    expired: bool,
    already_executed: bool,
    manifest_id: Uuid,
    issued_at: String,
    expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// `GET /v1/seal/verify` — independent verification.
///
/// Signature validity is recomputed from the seal's stored fields against
/// the public key it carries; execution state is read from the ledger in
/// the same snapshot, so a seal never reports both `valid` and
/// `already_executed = false` after an execution has committed.
pub(super) async fn verify(
    State(state): State<AppState>,
    params: Result<Query<SealIdParams>, QueryRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Query(params) = params.map_err(|r| map_query_rejection(&r))?;

    let seal = state.ledger.get_seal(&params.seal_id)?;

    let signature_valid = verify_signature(&seal);
    let expired = seal.is_expired(Utc::now());
    let already_executed = seal.was_executed;
    let valid = signature_valid && seal.approved && !expired && !already_executed;

    let reason = if valid {
        None
    } else if !signature_valid {
        Some(String::from("invalid cryptographic signature"))
    } else if !seal.approved {
        seal.denial_reason
            .clone()
            .map(|r| format!("action was denied: {r}"))
            .or_else(|| Some(String::from("action was denied")))
    } else if expired {
        Some(String::from("seal has expired"))
    } else {
        Some(String::from("seal has already been executed"))
    };

    Ok(Json(VerifyResponse {
        seal_id: seal.seal_id,
        valid,
        approved: seal.approved,
        expired,
        already_executed,
        manifest_id: seal.manifest_id,
        issued_at: format_time(seal.issued_at),
        expires_at: format_time(seal.expires_at),
        reason,
    }))
}

/// `POST /v1/seal/mark-executed` — one-time-use enforcement.
///
/// The transition is serialized by the store; at most one caller observes
/// success. The second call answers 409 and conveys the first call's
/// timestamp. Expired seals are refused before any state change.
pub(super) async fn mark_executed(
    State(state): State<AppState>,
    params: Result<Query<SealIdParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(params) = params.map_err(|r| map_query_rejection(&r))?;
    let now = Utc::now();

    let seal = state.ledger.get_seal(&params.seal_id)?;
    if !seal.was_executed && seal.is_expired(now) {
        return Err(ApiError::new(ErrorCode::SealExpired, "seal has expired")
            .with_details(json!({
                "seal_id": seal.seal_id,
                "expires_at": format_time(seal.expires_at),
            })));
    }

    match state.ledger.mark_executed(&params.seal_id, now)? {
        ExecutionOutcome::Executed { executed_at } => Ok(Json(json!({
            "seal_id": params.seal_id,
            "marked_executed": true,
            "executed_at": format_time(executed_at),
        }))),
        ExecutionOutcome::AlreadyExecuted { executed_at } => Err(ApiError::new(
            ErrorCode::AlreadyExecuted,
            "seal has already been executed",
        )
        .with_details(json!({
            "seal_id": params.seal_id,
            "already_executed": true,
            "executed_at": format_time(executed_at),
        }))),
    }
}
