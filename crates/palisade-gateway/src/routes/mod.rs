//! REST endpoint wiring.
//!
//! Schema validation happens before any other work: bodies and query
//! strings deserialize strictly (unknown fields rejected) and rejections
//! map to the problem shape with stable error codes. Layers attach the
//! body-size limit, request tracing, and (optionally) CORS.

mod agents;
mod audit;
mod health;
mod manifest;
mod orgs;
mod seal;

use std::net::SocketAddr;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, DefaultBodyLimit};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, SecondsFormat, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

/// Builds the gateway router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/v1/manifest/validate", post(manifest::validate))
        .route("/v1/manifest/health", get(manifest::health))
        .route("/v1/seal/verify", get(seal::verify))
        .route("/v1/seal/mark-executed", post(seal::mark_executed))
        .route("/v1/audit/query", get(audit::query))
        .route("/v1/audit/stats", get(audit::stats))
        .route("/v1/orgs/register", post(orgs::register))
        .route("/v1/orgs/:org_id", get(orgs::get_org))
        .route("/v1/agents/register", post(agents::register))
        .route("/v1/agents", get(agents::list))
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http());

    if state.config.server.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// Extracts the client address when the transport provides one.
pub(crate) fn ip_of(connect_info: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    connect_info.map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Maps a body rejection to the problem shape.
pub(crate) fn map_json_rejection(rejection: &JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(ErrorCode::PayloadTooLarge, "request body too large")
    } else {
        ApiError::schema(rejection.body_text())
    }
}

/// Maps a query-string rejection to the problem shape.
pub(crate) fn map_query_rejection(rejection: &QueryRejection) -> ApiError {
    ApiError::schema(rejection.body_text())
}

/// Formats response timestamps the single way the gateway emits them.
pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a client-supplied RFC 3339 timestamp.
pub(crate) fn parse_time(raw: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::schema(format!("{field}: invalid RFC 3339 timestamp: {e}")))
}
