//! End-to-end tests against the gateway router.
//!
//! The policy engine is replaced with an in-process transport that speaks
//! the engine's wire shape and implements a payments policy: allow
//! `stripe/create_payment` when `parameters.amount < 5000`, deny otherwise.
//! Everything else (ledger, seals, identity, auth) is the real thing.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use palisade_core::config::GatewayConfig;
use palisade_core::identity::TokenMinter;
use palisade_core::ledger::{AuditLedger, QueryFilters};
use palisade_core::policy::{EngineTransport, PolicyEngineAdapter, TransportError};
use palisade_core::seal::{verify_signature, Seal, SealEngine, SealKeypair};
use palisade_gateway::{routes, AppState};

const ENGINE_VERSION: &str = "vfeedc0de00000001";
const OVER_LIMIT_REASON: &str = "Payment amount exceeds $50.00 limit";

/// In-process stand-in for the external policy engine.
struct FakeEngine {
    available: bool,
}

#[async_trait]
impl EngineTransport for FakeEngine {
    async fn query(&self, _entrypoint: &str, input: &Value) -> Result<Value, TransportError> {
        if !self.available {
            return Err(TransportError::Status { status: 502 });
        }

        let provider = input["action"]["provider"].as_str().unwrap_or_default();
        let method = input["action"]["method"].as_str().unwrap_or_default();
        let amount = input["action"]["parameters"]["amount"]
            .as_i64()
            .unwrap_or(i64::MAX);

        let allow = provider == "stripe" && method == "create_payment" && amount < 5000;
        let (deny_reasons, matched) = if allow {
            (vec![], vec!["allow-small-payments"])
        } else {
            (vec![OVER_LIMIT_REASON], vec!["deny-large-payments"])
        };

        Ok(json!({
            "result": {
                "allow": allow,
                "deny_reasons": deny_reasons,
                "version": ENGINE_VERSION,
                "matched_rules": matched,
            }
        }))
    }

    async fn put_policy(&self, _name: &str, _module: &str) -> Result<(), TransportError> {
        if self.available {
            Ok(())
        } else {
            Err(TransportError::Status { status: 502 })
        }
    }

    async fn health(&self) -> bool {
        self.available
    }
}

struct TestGateway {
    app: Router,
    state: AppState,
}

fn gateway_with(config: GatewayConfig, engine_available: bool) -> TestGateway {
    let ledger = AuditLedger::in_memory().unwrap();
    let adapter = PolicyEngineAdapter::new(
        Box::new(FakeEngine {
            available: engine_available,
        }),
        "gateway.policies.main",
        "main",
    );
    let seals = SealEngine::new(SealKeypair::generate(), config.seal.ttl_minutes);
    let tokens = TokenMinter::with_expiry(
        SecretString::from("integration-test-token-secret"),
        config.auth.token_expiry_secs,
    );

    let state = AppState::new(config, ledger, adapter, seals, tokens);
    TestGateway {
        app: routes::router(state.clone()),
        state,
    }
}

fn gateway() -> TestGateway {
    gateway_with(GatewayConfig::default(), true)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn payment_manifest(agent_id: &str, org_id: &str, amount: i64) -> Value {
    json!({
        "agent": { "agent_id": agent_id, "org_id": org_id },
        "action": {
            "provider": "stripe",
            "method": "create_payment",
            "parameters": { "amount": amount, "currency": "USD" }
        },
        "justification": {
            "reasoning": "customer approved the quote",
            "confidence_score": 0.95
        },
        "environment": "production"
    })
}

async fn register_org(app: &Router, name: &str) -> (String, String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/v1/orgs/register",
        Some(json!({ "org_name": name, "contact_email": "ops@example.com" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    (
        body["org_id"].as_str().unwrap().to_string(),
        body["admin_agent"]["agent_id"].as_str().unwrap().to_string(),
        body["jwt_token"].as_str().unwrap().to_string(),
    )
}

// ---------------------------------------------------------------------------
// Hot path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approved_under_limit_payment() {
    let gw = gateway();

    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 3500)),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], true);
    assert_eq!(body["policy_version"], ENGINE_VERSION);
    assert!(body.get("denial_reason").is_none());

    // The returned seal is complete, signed, and offline-verifiable.
    let seal: Seal = serde_json::from_value(body["seal"].clone()).unwrap();
    assert!(seal.approved);
    assert!(verify_signature(&seal));
    assert_eq!(
        (seal.expires_at - seal.issued_at).num_seconds(),
        300,
        "expiry is issuance plus the five-minute TTL"
    );

    // Exactly one manifest row and one approved seal row in the ledger.
    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].approved);
    assert_eq!(records[0].seal_id, seal.seal_id);

    // The verify endpoint agrees.
    let (status, verdict) = send(
        &gw.app,
        "GET",
        &format!("/v1/seal/verify?seal_id={}", seal.seal_id),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["valid"], true);
    assert_eq!(verdict["approved"], true);
    assert_eq!(verdict["expired"], false);
    assert_eq!(verdict["already_executed"], false);
}

#[tokio::test]
async fn denied_over_limit_payment() {
    let gw = gateway();

    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 7500)),
        None,
    )
    .await;

    // A denial is a successful response, not an error.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], false);
    assert_eq!(body["denial_reason"], OVER_LIMIT_REASON);
    assert!(body.get("seal").is_none(), "no usable authorization returned");

    // The evidentiary seal is persisted with approved = false.
    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].approved);
    assert_eq!(records[0].denial_reason.as_deref(), Some(OVER_LIMIT_REASON));

    let seal = gw.state.ledger.get_seal(&records[0].seal_id).unwrap();
    assert!(!seal.approved);
    assert!(verify_signature(&seal), "evidentiary seals are signed too");
}

#[tokio::test]
async fn seal_replay_is_refused() {
    let gw = gateway();

    let (_, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 4500)),
        None,
    )
    .await;
    let seal_id = body["seal"]["seal_id"].as_str().unwrap().to_string();

    let (status, first) = send(
        &gw.app,
        "POST",
        &format!("/v1/seal/mark-executed?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["marked_executed"], true);
    let executed_at = first["executed_at"].as_str().unwrap().to_string();

    // The second call conveys the first call's timestamp, as a conflict.
    let (status, second) = send(
        &gw.app,
        "POST",
        &format!("/v1/seal/mark-executed?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["error_code"], "already_executed");
    assert_eq!(second["details"]["executed_at"], executed_at.as_str());

    let (_, verdict) = send(
        &gw.app,
        "GET",
        &format!("/v1/seal/verify?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(verdict["already_executed"], true);
    assert_eq!(verdict["valid"], false);
}

#[tokio::test]
async fn engine_unavailable_fails_closed_but_ledgers() {
    let gw = gateway_with(GatewayConfig::default(), false);

    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 10)),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], false);
    assert_eq!(body["denial_reason"], "policy engine unavailable");
    assert_eq!(body["policy_version"], "unknown");
    assert!(body.get("seal").is_none());

    // The denial itself is auditable.
    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].policy_version, "unknown");
}

#[tokio::test]
async fn tampered_seal_fails_verification() {
    let gw = gateway();

    let (_, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 100)),
        None,
    )
    .await;

    let mut seal: Seal = serde_json::from_value(body["seal"].clone()).unwrap();
    let seal_id = seal.seal_id.clone();

    // Flip one bit in the signature.
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    let mut raw = STANDARD.decode(&seal.signature).unwrap();
    raw[0] ^= 0x01;
    seal.signature = STANDARD.encode(raw);
    assert!(!verify_signature(&seal));

    // The ledger copy is unaffected; the server still verifies it.
    let (_, verdict) = send(
        &gw.app,
        "GET",
        &format!("/v1/seal/verify?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(verdict["valid"], true);
}

#[tokio::test]
async fn expired_seal_is_refused() {
    let mut config = GatewayConfig::default();
    config.seal.ttl_minutes = 0;
    let gw = gateway_with(config, true);

    let (_, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("sales-agent-001", "acme-corp", 100)),
        None,
    )
    .await;
    let seal_id = body["seal"]["seal_id"].as_str().unwrap().to_string();

    let (_, verdict) = send(
        &gw.app,
        "GET",
        &format!("/v1/seal/verify?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(verdict["expired"], true);
    assert_eq!(verdict["valid"], false);

    let (status, refusal) = send(
        &gw.app,
        "POST",
        &format!("/v1/seal/mark-executed?seal_id={seal_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(refusal["error_code"], "seal_expired");
}

#[tokio::test]
async fn dry_run_skips_the_ledger() {
    let gw = gateway();

    let mut manifest = payment_manifest("sales-agent-001", "acme-corp", 100);
    manifest["dry_run"] = json!(true);

    let (status, body) = send(&gw.app, "POST", "/v1/manifest/validate", Some(manifest), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], true);

    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn repeated_validation_is_deterministic() {
    let gw = gateway();

    let mut decisions = Vec::new();
    for _ in 0..3 {
        let (_, body) = send(
            &gw.app,
            "POST",
            "/v1/manifest/validate",
            Some(payment_manifest("sales-agent-001", "acme-corp", 4999)),
            None,
        )
        .await;
        decisions.push((
            body["approved"].as_bool().unwrap(),
            body["policy_version"].as_str().unwrap().to_string(),
        ));
    }

    assert!(decisions.windows(2).all(|w| w[0] == w[1]));
    // Each validation is an independent event with its own ledger row.
    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert_eq!(records.len(), 3);
}

// ---------------------------------------------------------------------------
// Schema strictness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let gw = gateway();

    let mut manifest = payment_manifest("a", "o", 1);
    manifest["surprise"] = json!("field");

    let (status, body) = send(&gw.app, "POST", "/v1/manifest/validate", Some(manifest), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "schema_violation");
}

#[tokio::test]
async fn field_constraints_are_enforced() {
    let gw = gateway();

    let mut manifest = payment_manifest("a", "o", 1);
    manifest["justification"]["confidence_score"] = json!(1.5);

    let (status, body) = send(&gw.app, "POST", "/v1/manifest/validate", Some(manifest), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "schema_violation");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("confidence_score"));
}

#[tokio::test]
async fn oversize_bodies_answer_413() {
    let mut config = GatewayConfig::default();
    config.server.max_body_bytes = 1024;
    let gw = gateway_with(config, true);

    let mut manifest = payment_manifest("a", "o", 1);
    manifest["justification"]["reasoning"] = json!("x".repeat(4096));

    let (status, body) = send(&gw.app, "POST", "/v1/manifest/validate", Some(manifest), None)
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error_code"], "payload_too_large");
}

// ---------------------------------------------------------------------------
// Identity and tenancy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn org_bootstrap_and_agent_lifecycle() {
    let gw = gateway();

    let (org_id, admin_agent_id, token) = register_org(&gw.app, "Acme").await;
    assert!(org_id.starts_with("org_"));
    assert_eq!(admin_agent_id, format!("agent_{org_id}_admin"));

    // The bootstrap token works immediately.
    let (status, org) = send(&gw.app, "GET", &format!("/v1/orgs/{org_id}"), None, Some(&token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(org["org_id"], org_id.as_str());
    assert_eq!(org["agents_count"], 1);

    // Register a second agent and list both.
    let (status, agent) = send(
        &gw.app,
        "POST",
        "/v1/agents/register",
        Some(json!({ "agent_name": "worker", "description": "queue worker" })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["org_id"], org_id.as_str());
    assert!(agent["jwt_token"].is_string());

    let (status, listing) = send(&gw.app, "GET", "/v1/agents", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["agents"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn protected_endpoints_require_tokens() {
    let gw = gateway();

    let (status, body) = send(&gw.app, "GET", "/v1/agents", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "unauthorized");

    let (status, _) = send(&gw.app, "GET", "/v1/agents", None, Some("garbage.token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cross_org_reads_are_refused_and_audited() {
    let gw = gateway();

    let (_org_a, _, token_a) = register_org(&gw.app, "OrgA").await;
    let (org_b, _, _) = register_org(&gw.app, "OrgB").await;

    let (status, body) = send(
        &gw.app,
        "GET",
        &format!("/v1/audit/query?org_id={org_b}"),
        None,
        Some(&token_a),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "forbidden");

    let events = gw.state.ledger.auth_events(50).unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == "auth_failure" && !e.success),
        "the cross-tenant attempt is recorded"
    );
}

#[tokio::test]
async fn cross_org_views_are_refused() {
    let gw = gateway();

    let (_org_a, _, token_a) = register_org(&gw.app, "OrgA").await;
    let (org_b, _, _) = register_org(&gw.app, "OrgB").await;

    let (status, _) = send(&gw.app, "GET", &format!("/v1/orgs/{org_b}"), None, Some(&token_a))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn token_cannot_validate_for_another_org() {
    let gw = gateway();

    let (org_a, admin_a, token_a) = register_org(&gw.app, "OrgA").await;
    let (org_b, admin_b, _) = register_org(&gw.app, "OrgB").await;

    // A token for org A cannot cause an org B manifest to be decided.
    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest(&admin_b, &org_b, 10)),
        Some(&token_a),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "forbidden");

    // Nothing reached the ledger's decision trail.
    let records = gw
        .state
        .ledger
        .query(&QueryFilters::default(), Default::default())
        .unwrap();
    assert!(records.is_empty());

    let events = gw.state.ledger.auth_events(50).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "manifest_auth_fail" && !e.success));

    // The same token validates its own org's manifests.
    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest(&admin_a, &org_a, 10)),
        Some(&token_a),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["approved"], true);
}

#[tokio::test]
async fn auth_required_mode_rejects_anonymous_validation() {
    let mut config = GatewayConfig::default();
    config.auth.required = true;
    let gw = gateway_with(config, true);

    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/manifest/validate",
        Some(payment_manifest("a", "o", 10)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "unauthorized");
}

// ---------------------------------------------------------------------------
// Audit surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn audit_query_filters_and_paginates() {
    let gw = gateway();

    for amount in [100, 200, 9000] {
        send(
            &gw.app,
            "POST",
            "/v1/manifest/validate",
            Some(payment_manifest("agent-1", "acme", amount)),
            None,
        )
        .await;
    }

    let (status, body) = send(&gw.app, "GET", "/v1/audit/query?approved=false", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["records"][0]["denial_reason"], OVER_LIMIT_REASON);

    let (_, page) = send(&gw.app, "GET", "/v1/audit/query?limit=2&offset=2", None, None)
        .await;
    assert_eq!(page["records"].as_array().unwrap().len(), 1);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["offset"], 2);

    let (status, body) = send(&gw.app, "GET", "/v1/audit/query?surprise=1", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "schema_violation");
}

#[tokio::test]
async fn audit_stats_aggregate() {
    let gw = gateway();

    for amount in [100, 200, 9000, 9001] {
        send(
            &gw.app,
            "POST",
            "/v1/manifest/validate",
            Some(payment_manifest("agent-1", "acme", amount)),
            None,
        )
        .await;
    }

    let (status, stats) = send(&gw.app, "GET", "/v1/audit/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 4);
    assert_eq!(stats["approved"], 2);
    assert_eq!(stats["denied"], 2);
    assert_eq!(stats["approval_rate"], 50.0);
    assert_eq!(stats["by_provider"][0]["provider"], "stripe");
    assert_eq!(stats["denials_by_reason"][0]["reason"], OVER_LIMIT_REASON);
}

// ---------------------------------------------------------------------------
// Health and discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_dependencies() {
    let gw = gateway();
    let (status, body) = send(&gw.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");
    assert_eq!(body["policy_engine"], "healthy");

    let degraded = gateway_with(GatewayConfig::default(), false);
    let (_, body) = send(&degraded.app, "GET", "/health", None, None).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["policy_engine"], "unhealthy");
}

#[tokio::test]
async fn manifest_health_reports_engine_state() {
    let gw = gateway();
    let (_, body) = send(&gw.app, "GET", "/v1/manifest/health", None, None).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["engine_available"], true);
    // Nothing loaded through this adapter yet.
    assert_eq!(body["policy_loaded"], false);
    assert_eq!(body["policy_version"], "unknown");
}

#[tokio::test]
async fn root_lists_endpoints() {
    let gw = gateway();
    let (status, body) = send(&gw.app, "GET", "/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "palisade-gateway");
    assert!(body["endpoints"]["validate"].is_string());
}

#[tokio::test]
async fn unknown_seal_is_404() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        "GET",
        "/v1/seal/verify?seal_id=seal_0_missing",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "not_found");
}
