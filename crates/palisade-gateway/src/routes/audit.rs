//! Audit query and statistics endpoints.
//!
//! When a request is authenticated, results are scoped to the token's
//! organization; asking for another organization's records is a scope
//! violation, answered 403 and itself audited. Unauthenticated requests may
//! filter by any single organization; every filter narrows, so no filter
//! combination widens access.

use std::net::SocketAddr;

use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use palisade_core::ledger::{AuthEvent, AuthEventKind, Page, QueryFilters};

use super::{ip_of, map_query_rejection, parse_time};
use crate::auth::{optional_bearer, record, AuthContext, RequestMeta};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(super) struct AuditParams {
    org_id: Option<String>,
    agent_id: Option<String>,
    provider: Option<String>,
    approved: Option<bool>,
    created_after: Option<String>,
    created_before: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl AuditParams {
    /// Resolves the effective filters, enforcing organization scope.
    fn filters(
        &self,
        state: &AppState,
        auth: Option<&AuthContext>,
        meta: &RequestMeta,
    ) -> Result<QueryFilters, ApiError> {
        let org_id = match (auth, &self.org_id) {
            // A token scopes the query to its own organization; naming a
            // different one is a cross-tenant read attempt.
            (Some(ctx), Some(requested)) if requested != &ctx.org_id => {
                record(
                    state,
                    AuthEvent::new(AuthEventKind::AuthFailure, false)
                        .agent(ctx.agent_id.clone(), ctx.org_id.clone())
                        .endpoint(meta.endpoint)
                        .failure_reason(format!(
                            "token is scoped to {}, query names {requested}",
                            ctx.org_id
                        )),
                );
                return Err(ApiError::forbidden(
                    "cannot query another organization's audit records",
                ));
            },
            (Some(ctx), _) => Some(ctx.org_id.clone()),
            (None, requested) => requested.clone(),
        };

        Ok(QueryFilters {
            org_id,
            agent_id: self.agent_id.clone(),
            provider: self.provider.clone(),
            approved: self.approved,
            created_after: self
                .created_after
                .as_deref()
                .map(|raw| parse_time(raw, "created_after"))
                .transpose()?,
            created_before: self
                .created_before
                .as_deref()
                .map(|raw| parse_time(raw, "created_before"))
                .transpose()?,
        })
    }

    fn page(&self) -> Page {
        Page {
            limit: self.limit.unwrap_or(Page::default().limit),
            offset: self.offset.unwrap_or(0),
        }
    }
}

/// `GET /v1/audit/query` — filtered, paginated ledger reads.
pub(super) async fn query(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    params: Result<Query<AuditParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params.map_err(|r| map_query_rejection(&r))?;
    let meta = RequestMeta::new("/v1/audit/query", ip_of(connect_info.as_ref()));

    let auth = optional_bearer(&state, &headers, &meta)?;
    let filters = params.filters(&state, auth.as_ref(), &meta)?;
    let page = params.page();

    let records = state.ledger.query(&filters, page)?;

    Ok(Json(json!({
        "total": records.len(),
        "limit": page.clamped_limit(),
        "offset": page.offset,
        "records": records,
    })))
}

/// `GET /v1/audit/stats` — aggregates over the filtered window.
pub(super) async fn stats(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    params: Result<Query<AuditParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params.map_err(|r| map_query_rejection(&r))?;
    let meta = RequestMeta::new("/v1/audit/stats", ip_of(connect_info.as_ref()));

    let auth = optional_bearer(&state, &headers, &meta)?;
    let filters = params.filters(&state, auth.as_ref(), &meta)?;

    let stats = state.ledger.stats(&filters)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        ApiError::internal(format!("stats serialization failed: {e}"))
    })?))
}
