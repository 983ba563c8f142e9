//! Manifest types: the structured record of a proposed agent action.
//!
//! A manifest is submitted by an agent, schema-checked at the HTTP surface,
//! evaluated against policy, and persisted to the audit ledger regardless of
//! the decision. Unknown fields are rejected at every level so the wire
//! contract cannot drift silently between SDK and server.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length accepted for `provider` and `method` tags.
pub const MAX_TAG_LEN: usize = 100;

/// Errors raised while validating a manifest submission.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ManifestError {
    /// A required identity field is empty.
    #[error("{field} must not be empty")]
    EmptyField {
        /// Path of the offending field.
        field: &'static str,
    },

    /// A tag field contains characters outside `[a-z0-9_-]`.
    #[error("{field} must be lowercase alphanumeric (underscores and hyphens allowed)")]
    InvalidTag {
        /// Path of the offending field.
        field: &'static str,
    },

    /// A tag field exceeds [`MAX_TAG_LEN`].
    #[error("{field} exceeds {MAX_TAG_LEN} characters")]
    TagTooLong {
        /// Path of the offending field.
        field: &'static str,
    },

    /// `confidence_score` is outside the closed interval [0, 1].
    #[error("confidence_score must be within [0.0, 1.0], got {value}")]
    ConfidenceOutOfRange {
        /// The rejected score.
        value: f64,
    },

    /// `parameters` is not a JSON object.
    #[error("action.parameters must be a JSON object")]
    ParametersNotObject,
}

/// Agent identity carried on a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentContext {
    /// Unique identifier of the submitting agent.
    pub agent_id: String,

    /// Organization the agent belongs to.
    pub org_id: String,

    /// User on whose behalf the agent acts, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The side-effecting operation the agent proposes to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    /// Service provider tag, e.g. `stripe` or `aws`.
    pub provider: String,

    /// Operation tag, e.g. `create_payment` or `delete_bucket`.
    pub method: String,

    /// Opaque action parameters, passed through to the policy engine and
    /// stored verbatim.
    pub parameters: Value,
}

/// The agent's stated reasoning for the action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Justification {
    /// Natural-language explanation of why the action is needed.
    pub reasoning: String,

    /// Agent's confidence in the action, within [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

/// A manifest submission as received on the wire.
///
/// This is the schema of `POST /v1/manifest/validate`. All fields are
/// required unless optional here; unknown top-level fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ManifestSubmission {
    /// Agent identity and context.
    pub agent: AgentContext,

    /// The action being requested.
    pub action: ActionRequest,

    /// The agent's reasoning.
    pub justification: Justification,

    /// Deployment environment, e.g. `production` or `staging`.
    pub environment: String,

    /// When true, evaluate and sign but skip the ledger append.
    #[serde(default)]
    pub dry_run: bool,
}

impl ManifestSubmission {
    /// Validates field-level constraints that the schema alone cannot
    /// express.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on empty identity fields, malformed
    /// provider/method tags, non-object `parameters`, or an out-of-range
    /// `confidence_score`.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.agent.agent_id.trim().is_empty() {
            return Err(ManifestError::EmptyField {
                field: "agent.agent_id",
            });
        }
        if self.agent.org_id.trim().is_empty() {
            return Err(ManifestError::EmptyField {
                field: "agent.org_id",
            });
        }
        if self.environment.trim().is_empty() {
            return Err(ManifestError::EmptyField { field: "environment" });
        }
        if self.justification.reasoning.trim().is_empty() {
            return Err(ManifestError::EmptyField {
                field: "justification.reasoning",
            });
        }

        validate_tag(&self.action.provider, "action.provider")?;
        validate_tag(&self.action.method, "action.method")?;

        if !self.action.parameters.is_object() {
            return Err(ManifestError::ParametersNotObject);
        }

        if let Some(score) = self.justification.confidence_score {
            if !(0.0..=1.0).contains(&score) || score.is_nan() {
                return Err(ManifestError::ConfidenceOutOfRange { value: score });
            }
        }

        Ok(())
    }
}

/// Validates a provider/method tag: non-empty, bounded, lowercase
/// alphanumeric plus `-` and `_`.
fn validate_tag(tag: &str, field: &'static str) -> Result<(), ManifestError> {
    if tag.is_empty() {
        return Err(ManifestError::EmptyField { field });
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(ManifestError::TagTooLong { field });
    }
    let ok = tag
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ManifestError::InvalidTag { field })
    }
}

/// A validated manifest with its server-assigned identity.
///
/// Created by the validation orchestrator from an accepted submission; never
/// mutated after persistence.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Manifest {
    /// Server-assigned unique identifier.
    pub manifest_id: Uuid,

    /// Server clock at assignment time.
    pub created_at: DateTime<Utc>,

    /// Agent identity.
    pub agent: AgentContext,

    /// Requested action.
    pub action: ActionRequest,

    /// Agent reasoning.
    pub justification: Justification,

    /// Deployment environment.
    pub environment: String,

    /// The full serialized submission, retained for the audit trail.
    pub raw_manifest: String,
}

impl Manifest {
    /// Builds a manifest from a validated submission, assigning identity and
    /// the creation timestamp.
    ///
    /// Timestamps are truncated to whole seconds so their serialized form
    /// survives storage round-trips exactly.
    #[must_use]
    pub fn from_submission(submission: &ManifestSubmission, now: DateTime<Utc>) -> Self {
        let raw_manifest = serde_json::to_string(submission)
            .unwrap_or_else(|_| String::from("{}"));

        Self {
            manifest_id: Uuid::new_v4(),
            created_at: truncate_to_seconds(now),
            agent: submission.agent.clone(),
            action: submission.action.clone(),
            justification: submission.justification.clone(),
            environment: submission.environment.clone(),
            raw_manifest,
        }
    }

    /// Replaces the server-assigned identity.
    ///
    /// Used on the (vanishingly rare) duplicate-id collision retry.
    #[must_use]
    pub fn with_fresh_id(mut self) -> Self {
        self.manifest_id = Uuid::new_v4();
        self
    }

    /// Projects the manifest into the policy engine's query input.
    ///
    /// The projection carries the agent, action, justification, and
    /// environment; server-assigned identity rides along for traceability.
    #[must_use]
    pub fn to_policy_input(&self) -> Value {
        serde_json::json!({
            "manifest_id": self.manifest_id.to_string(),
            "timestamp": self.created_at_rfc3339(),
            "agent": self.agent,
            "action": self.action,
            "justification": self.justification,
            "environment": self.environment,
        })
    }

    /// The creation timestamp in RFC 3339 form at second precision.
    #[must_use]
    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Truncates a timestamp to whole seconds.
#[must_use]
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}
