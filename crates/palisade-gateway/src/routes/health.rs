//! Liveness and service-discovery endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` — liveness plus dependency status.
pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let database_healthy = state.ledger.is_healthy();
    let engine_healthy = state.adapter.health().await;

    Json(json!({
        "status": if database_healthy && engine_healthy { "healthy" } else { "unhealthy" },
        "database": if database_healthy { "healthy" } else { "unhealthy" },
        "policy_engine": if engine_healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /` — service discovery.
pub(super) async fn root() -> Json<Value> {
    Json(json!({
        "service": "palisade-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "authorization gateway for agent actions, with signed seals and an immutable audit ledger",
        "endpoints": {
            "validate": "POST /v1/manifest/validate",
            "verify": "GET /v1/seal/verify",
            "mark_executed": "POST /v1/seal/mark-executed",
            "audit": "GET /v1/audit/query",
            "stats": "GET /v1/audit/stats",
            "register_org": "POST /v1/orgs/register",
            "get_org": "GET /v1/orgs/{org_id}",
            "register_agent": "POST /v1/agents/register",
            "list_agents": "GET /v1/agents",
            "health": "GET /health",
            "manifest_health": "GET /v1/manifest/health",
        },
    }))
}
