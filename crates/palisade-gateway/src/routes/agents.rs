//! Agent endpoints.

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use palisade_core::identity::{hash_api_key, IdentityError, IdentityStore};
use palisade_core::ledger::{AuthEvent, AuthEventKind};

use super::{format_time, ip_of, map_json_rejection};
use crate::auth::{record, require_bearer, RequestMeta};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AgentRegisterRequest {
    agent_name: String,
    #[serde(default)]
    description: Option<String>,
    /// Optional long-lived credential; only its hash is stored.
    #[serde(default)]
    api_key: Option<String>,
}

/// The response of `POST /v1/agents/register`.
#[derive(Debug, Serialize)]
pub(super) struct AgentRegisterResponse {
    agent_id: String,
    org_id: String,
    agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    created_at: String,
    active: bool,
    jwt_token: String,
    token_type: &'static str,
    expires_in: i64,
}

/// `POST /v1/agents/register` — create an agent under the caller's
/// organization and return a bearer token for it.
pub(super) async fn register(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<AgentRegisterRequest>, JsonRejection>,
) -> Result<Json<AgentRegisterResponse>, ApiError> {
    let meta = RequestMeta::new("/v1/agents/register", ip_of(connect_info.as_ref()));
    let ctx = require_bearer(&state, &headers, &meta)?;

    let Json(request) = payload.map_err(|r| map_json_rejection(&r))?;
    if request.agent_name.trim().is_empty() {
        return Err(ApiError::schema("agent_name must not be empty"));
    }

    let api_key_hash = request.api_key.as_deref().map(hash_api_key);

    let agent = match state.identity.create_agent(
        &IdentityStore::generate_agent_id(),
        &ctx.org_id,
        &request.agent_name,
        request.description.as_deref(),
        api_key_hash.as_deref(),
    ) {
        Ok(agent) => agent,
        Err(IdentityError::AlreadyRegistered { .. }) => state.identity.create_agent(
            &IdentityStore::generate_agent_id(),
            &ctx.org_id,
            &request.agent_name,
            request.description.as_deref(),
            api_key_hash.as_deref(),
        )?,
        Err(e) => return Err(e.into()),
    };

    let jwt_token = state.tokens.mint(&agent.agent_id, &agent.org_id, Utc::now());

    let mut issued = AuthEvent::new(AuthEventKind::TokenIssue, true)
        .agent(agent.agent_id.clone(), agent.org_id.clone())
        .endpoint(meta.endpoint);
    if let Some(ip) = meta.ip.clone() {
        issued = issued.ip(ip);
    }
    record(&state, issued);

    tracing::info!(agent_id = %agent.agent_id, org_id = %agent.org_id, "agent registered");

    Ok(Json(AgentRegisterResponse {
        agent_id: agent.agent_id,
        org_id: agent.org_id,
        agent_name: agent.agent_name,
        description: agent.description,
        created_at: format_time(agent.created_at),
        active: agent.active,
        jwt_token,
        token_type: "bearer",
        expires_in: state.tokens.expiry_secs(),
    }))
}

/// `GET /v1/agents` — list the caller's organization's agents.
pub(super) async fn list(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let meta = RequestMeta::new("/v1/agents", ip_of(connect_info.as_ref()));
    let ctx = require_bearer(&state, &headers, &meta)?;

    let agents = state.identity.list_agents(&ctx.org_id)?;
    let agents: Vec<Value> = agents
        .into_iter()
        .map(|agent| {
            json!({
                "agent_id": agent.agent_id,
                "org_id": agent.org_id,
                "agent_name": agent.agent_name,
                "description": agent.description,
                "created_at": format_time(agent.created_at),
                "active": agent.active,
            })
        })
        .collect();

    Ok(Json(json!({
        "org_id": ctx.org_id,
        "agents": agents,
    })))
}
