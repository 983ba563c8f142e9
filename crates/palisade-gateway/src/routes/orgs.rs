//! Organization endpoints.

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use palisade_core::identity::{IdentityError, IdentityStore};
use palisade_core::ledger::{AuthEvent, AuthEventKind};

use super::{format_time, ip_of, map_json_rejection};
use crate::auth::{record, require_bearer, RequestMeta};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct OrgRegisterRequest {
    org_name: String,
    contact_email: String,
}

/// Summary of the bootstrap agent created with an organization.
#[derive(Debug, Serialize)]
pub(super) struct AdminAgentInfo {
    agent_id: String,
    agent_name: String,
}

/// The response of `POST /v1/orgs/register`.
#[derive(Debug, Serialize)]
pub(super) struct OrgRegisterResponse {
    org_id: String,
    org_name: String,
    contact_email: String,
    created_at: String,
    admin_agent: AdminAgentInfo,
    jwt_token: String,
    token_type: &'static str,
    expires_in: i64,
}

/// `POST /v1/orgs/register` — first-use bootstrap, unauthenticated.
///
/// Creates the organization and its admin agent and returns a bearer token
/// for immediate use.
pub(super) async fn register(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<OrgRegisterRequest>, JsonRejection>,
) -> Result<Json<OrgRegisterResponse>, ApiError> {
    let Json(request) = payload.map_err(|r| map_json_rejection(&r))?;

    if request.org_name.trim().is_empty() {
        return Err(ApiError::schema("org_name must not be empty"));
    }
    if request.contact_email.trim().is_empty() || !request.contact_email.contains('@') {
        return Err(ApiError::schema("contact_email must be a valid address"));
    }

    // Identifier collisions are vanishingly rare; one retry mirrors the
    // manifest-id policy.
    let org = match state.identity.create_org(
        &IdentityStore::generate_org_id(),
        &request.org_name,
        &request.contact_email,
    ) {
        Ok(org) => org,
        Err(IdentityError::AlreadyRegistered { .. }) => state.identity.create_org(
            &IdentityStore::generate_org_id(),
            &request.org_name,
            &request.contact_email,
        )?,
        Err(e) => return Err(e.into()),
    };

    let admin_agent = state.identity.create_agent(
        &IdentityStore::admin_agent_id(&org.org_id),
        &org.org_id,
        "admin-agent",
        Some("bootstrap agent created with the organization"),
        None,
    )?;

    let jwt_token = state
        .tokens
        .mint(&admin_agent.agent_id, &org.org_id, Utc::now());

    let mut issued = AuthEvent::new(AuthEventKind::TokenIssue, true)
        .agent(admin_agent.agent_id.clone(), org.org_id.clone())
        .endpoint("/v1/orgs/register");
    if let Some(ip) = ip_of(connect_info.as_ref()) {
        issued = issued.ip(ip);
    }
    record(&state, issued);

    tracing::info!(org_id = %org.org_id, "organization registered");

    Ok(Json(OrgRegisterResponse {
        org_id: org.org_id,
        org_name: org.org_name,
        contact_email: org.contact_email,
        created_at: format_time(org.created_at),
        admin_agent: AdminAgentInfo {
            agent_id: admin_agent.agent_id,
            agent_name: admin_agent.agent_name,
        },
        jwt_token,
        token_type: "bearer",
        expires_in: state.tokens.expiry_secs(),
    }))
}

/// The response of `GET /v1/orgs/{org_id}`.
#[derive(Debug, Serialize)]
pub(super) struct OrgInfoResponse {
    org_id: String,
    org_name: String,
    contact_email: String,
    agents_count: u64,
    created_at: String,
    active: bool,
}

/// `GET /v1/orgs/{org_id}` — organization summary, scoped to the caller's
/// own organization.
pub(super) async fn get_org(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
) -> Result<Json<OrgInfoResponse>, ApiError> {
    let meta = RequestMeta::new("/v1/orgs/{org_id}", ip_of(connect_info.as_ref()));
    let ctx = require_bearer(&state, &headers, &meta)?;

    if org_id != ctx.org_id {
        record(
            &state,
            AuthEvent::new(AuthEventKind::AuthFailure, false)
                .agent(ctx.agent_id.clone(), ctx.org_id.clone())
                .endpoint(meta.endpoint)
                .failure_reason(format!("token is scoped to {}, path names {org_id}", ctx.org_id)),
        );
        return Err(ApiError::forbidden("cannot view another organization"));
    }

    let org = state.identity.get_org(&org_id)?;
    let agents_count = state.identity.count_agents(&org_id)?;

    Ok(Json(OrgInfoResponse {
        org_id: org.org_id,
        org_name: org.org_name,
        contact_email: org.contact_email,
        agents_count,
        created_at: format_time(org.created_at),
        active: org.active,
    }))
}
