//! The validation orchestrator: the gateway's hot path.
//!
//! One call runs the whole decision pipeline: identity consistency, policy
//! evaluation, seal issuance, and the atomic ledger append. The pipeline
//! fails closed at every stage: an unreachable policy engine becomes a
//! denial, and a failed append means no seal reaches the client.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use palisade_core::ledger::{AuthEvent, AuthEventKind, LedgerError};
use palisade_core::manifest::{Manifest, ManifestSubmission};
use palisade_core::policy::Decision;
use palisade_core::seal::Seal;

use crate::auth::{record, AuthContext, RequestMeta};
use crate::error::ApiError;
use crate::state::AppState;

/// The response of `POST /v1/manifest/validate`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    /// Server-assigned manifest identifier.
    pub manifest_id: Uuid,

    /// The decision.
    pub approved: bool,

    /// The seal, present only when approved. Denied manifests still record
    /// an evidentiary seal in the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seal: Option<Seal>,

    /// Why the action was denied, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,

    /// Version of the policy that decided.
    pub policy_version: String,
}

/// Runs the validation pipeline for one submission.
///
/// 1. Field-level validation (schema shape was checked at the surface).
/// 2. Token/manifest identity consistency; a mismatch is rejected before
///    the policy engine or ledger are touched, but is itself audited.
/// 3. Policy evaluation, fail-closed.
/// 4. Seal issuance, approved or evidentiary.
/// 5. Atomic ledger append, skipped for dry runs.
///
/// # Errors
///
/// Returns 400 on field-level violations, 403 on identity mismatch, and
/// 5xx when the ledger cannot record the decision. Policy-engine
/// unavailability is NOT an error: it yields a denied outcome.
pub async fn validate(
    state: &AppState,
    submission: ManifestSubmission,
    auth: Option<&AuthContext>,
    meta: &RequestMeta,
) -> Result<ValidationOutcome, ApiError> {
    submission.validate()?;

    if let Some(ctx) = auth {
        check_identity_consistency(state, &submission, ctx, meta)?;
    }

    let manifest = Manifest::from_submission(&submission, Utc::now());
    let decision = state.adapter.evaluate(&manifest.to_policy_input()).await;

    let seal = issue_seal(state, &manifest, &decision)?;

    let (manifest, seal) = if submission.dry_run {
        (manifest, seal)
    } else {
        append_with_retry(state, manifest, seal, &decision)?
    };

    tracing::info!(
        manifest_id = %manifest.manifest_id,
        agent_id = %manifest.agent.agent_id,
        org_id = %manifest.agent.org_id,
        provider = %manifest.action.provider,
        method = %manifest.action.method,
        approved = decision.is_approved(),
        policy_version = %decision.policy_version(),
        dry_run = submission.dry_run,
        "manifest validated"
    );

    Ok(ValidationOutcome {
        manifest_id: manifest.manifest_id,
        approved: decision.is_approved(),
        seal: decision.is_approved().then_some(seal),
        denial_reason: decision.denial_reason().map(ToString::to_string),
        policy_version: decision.policy_version().to_string(),
    })
}

/// Rejects a manifest whose identity contradicts the presented token.
fn check_identity_consistency(
    state: &AppState,
    submission: &ManifestSubmission,
    ctx: &AuthContext,
    meta: &RequestMeta,
) -> Result<(), ApiError> {
    let matches =
        submission.agent.org_id == ctx.org_id && submission.agent.agent_id == ctx.agent_id;

    if matches {
        record(
            state,
            with_meta(
                AuthEvent::new(AuthEventKind::ManifestAuthOk, true)
                    .agent(ctx.agent_id.clone(), ctx.org_id.clone()),
                meta,
            ),
        );
        return Ok(());
    }

    record(
        state,
        with_meta(
            AuthEvent::new(AuthEventKind::ManifestAuthFail, false)
                .agent(ctx.agent_id.clone(), ctx.org_id.clone())
                .failure_reason(format!(
                    "token is for {}/{}, manifest names {}/{}",
                    ctx.org_id, ctx.agent_id, submission.agent.org_id, submission.agent.agent_id
                )),
            meta,
        ),
    );

    Err(ApiError::forbidden(
        "manifest identity does not match the presented token",
    ))
}

fn with_meta(mut event: AuthEvent, meta: &RequestMeta) -> AuthEvent {
    event = event.endpoint(meta.endpoint);
    if let Some(ip) = &meta.ip {
        event = event.ip(ip.clone());
    }
    event
}

fn issue_seal(
    state: &AppState,
    manifest: &Manifest,
    decision: &Decision,
) -> Result<Seal, ApiError> {
    Ok(state.seals.issue(
        manifest.manifest_id,
        decision.is_approved(),
        decision.policy_version(),
        decision.denial_reason(),
        Utc::now(),
    )?)
}

/// Appends manifest and seal; on the vanishingly rare manifest-id
/// collision, regenerates the id, re-signs, and retries once. A second
/// collision is a server fault.
fn append_with_retry(
    state: &AppState,
    manifest: Manifest,
    seal: Seal,
    decision: &Decision,
) -> Result<(Manifest, Seal), ApiError> {
    match state.ledger.append(&manifest, &seal) {
        Ok(()) => Ok((manifest, seal)),
        Err(LedgerError::DuplicateManifest { manifest_id }) => {
            tracing::warn!(%manifest_id, "manifest id collision, retrying with a fresh id");

            let manifest = manifest.with_fresh_id();
            let seal = issue_seal(state, &manifest, decision)?;
            match state.ledger.append(&manifest, &seal) {
                Ok(()) => Ok((manifest, seal)),
                Err(LedgerError::DuplicateManifest { .. }) => Err(ApiError::internal(
                    "manifest id collided twice; refusing to record",
                )),
                Err(e) => Err(e.into()),
            }
        },
        Err(e) => Err(e.into()),
    }
}
