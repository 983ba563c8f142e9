//! Bearer-token authentication for the HTTP surface.
//!
//! Tokens ride in the `Authorization: Bearer` header. Validation checks the
//! HMAC, the expiry, and that the `(agent, org)` pair is still active in
//! the registry. Every acceptance and rejection of a presented credential
//! lands in the auth-event trail.

use axum::http::HeaderMap;

use palisade_core::ledger::{AuthEvent, AuthEventKind};

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated caller, as carried through a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Authenticated agent.
    pub agent_id: String,

    /// The agent's organization.
    pub org_id: String,
}

/// Client metadata attached to auth events.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Endpoint path being accessed.
    pub endpoint: &'static str,

    /// Client address, when known.
    pub ip: Option<String>,
}

impl RequestMeta {
    /// Builds metadata for an endpoint.
    #[must_use]
    pub fn new(endpoint: &'static str, ip: Option<String>) -> Self {
        Self { endpoint, ip }
    }

    fn event(&self, kind: AuthEventKind, success: bool) -> AuthEvent {
        let mut event = AuthEvent::new(kind, success).endpoint(self.endpoint);
        if let Some(ip) = &self.ip {
            event = event.ip(ip.clone());
        }
        event
    }
}

/// Authenticates a request where a token is mandatory.
///
/// # Errors
///
/// Returns 401 when the token is absent, malformed, expired, forged, or
/// names an inactive agent. Each rejection is recorded as an auth event.
pub fn require_bearer(
    state: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
) -> Result<AuthContext, ApiError> {
    authenticate(state, headers, meta, true)?
        .ok_or_else(|| ApiError::unauthorized("authorization token required"))
}

/// Authenticates a request where a token is optional unless the deployment
/// requires one.
///
/// Returns `None` when no token was presented and none is required.
///
/// # Errors
///
/// Returns 401 under the same conditions as [`require_bearer`] whenever a
/// token was presented or is required.
pub fn optional_bearer(
    state: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
) -> Result<Option<AuthContext>, ApiError> {
    authenticate(state, headers, meta, state.config.auth.required)
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
    required: bool,
) -> Result<Option<AuthContext>, ApiError> {
    let Some(token) = bearer_token(headers) else {
        if required {
            record(
                state,
                meta.event(AuthEventKind::AuthFailure, false)
                    .failure_reason("missing authorization token"),
            );
            return Err(ApiError::unauthorized("authorization token required"));
        }
        return Ok(None);
    };

    let claims = match state.tokens.verify(token, chrono::Utc::now()) {
        Ok(claims) => claims,
        Err(e) => {
            record(
                state,
                meta.event(AuthEventKind::TokenValidateFail, false)
                    .failure_reason(e.to_string()),
            );
            return Err(ApiError::unauthorized("invalid or expired token"));
        },
    };

    match state.identity.agent_is_active(&claims.sub, &claims.org) {
        Ok(true) => {},
        Ok(false) => {
            record(
                state,
                meta.event(AuthEventKind::AuthFailure, false)
                    .agent(claims.sub.clone(), claims.org.clone())
                    .failure_reason("agent not found or inactive"),
            );
            return Err(ApiError::unauthorized("agent not found or inactive"));
        },
        Err(e) => return Err(e.into()),
    }

    record(
        state,
        meta.event(AuthEventKind::AuthSuccess, true)
            .agent(claims.sub.clone(), claims.org.clone()),
    );

    Ok(Some(AuthContext {
        agent_id: claims.sub,
        org_id: claims.org,
    }))
}

/// Extracts the token from an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Records an auth event; failures to record are logged, not fatal to the
/// request being authenticated.
pub(crate) fn record(state: &AppState, event: AuthEvent) {
    if let Err(e) = state.ledger.record_auth_event(&event) {
        tracing::error!(error = %e, "failed to record auth event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn rejects_non_bearer_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn rejects_empty_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer ".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
