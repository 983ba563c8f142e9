//! Record and filter types for the audit ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::seal::types::rfc3339_secs;

/// Maximum rows a single query may return.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// A persisted manifest, as read back from the ledger.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ManifestRecord {
    /// Server-assigned manifest identifier.
    pub manifest_id: Uuid,

    /// Server clock at creation.
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,

    /// Submitting agent.
    pub agent_id: String,

    /// Owning organization.
    pub org_id: String,

    /// User on whose behalf the agent acted, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Provider tag.
    pub provider: String,

    /// Method tag.
    pub method: String,

    /// Action parameters, verbatim.
    pub parameters: Value,

    /// Agent reasoning.
    pub reasoning: String,

    /// Agent confidence, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,

    /// Deployment environment.
    pub environment: String,

    /// The full serialized submission.
    pub raw_manifest: String,
}

/// One row of an audit query: a manifest joined with its seal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditRecord {
    /// Manifest identifier.
    pub manifest_id: Uuid,

    /// Creation time.
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,

    /// Submitting agent.
    pub agent_id: String,

    /// Owning organization.
    pub org_id: String,

    /// Provider tag.
    pub provider: String,

    /// Method tag.
    pub method: String,

    /// Action parameters, verbatim.
    pub parameters: Value,

    /// Agent reasoning.
    pub reasoning: String,

    /// Deployment environment.
    pub environment: String,

    /// Decision recorded on the seal.
    pub approved: bool,

    /// Policy version that decided.
    pub policy_version: String,

    /// Denial reason, when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,

    /// The seal's identifier.
    pub seal_id: String,

    /// Whether the sealed action was executed.
    pub was_executed: bool,
}

/// Filters for audit queries and statistics.
///
/// All filters are conjunctive; absent filters match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    /// Restrict to one organization.
    pub org_id: Option<String>,

    /// Restrict to one agent.
    pub agent_id: Option<String>,

    /// Restrict to one provider.
    pub provider: Option<String>,

    /// Restrict by decision.
    pub approved: Option<bool>,

    /// Only manifests created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,

    /// Only manifests created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

/// Pagination window for audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum rows to return, clamped to [`MAX_PAGE_SIZE`].
    pub limit: u32,

    /// Rows to skip.
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Page {
    /// The effective limit after clamping.
    #[must_use]
    pub fn clamped_limit(self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// Aggregate statistics over a filtered window of the ledger.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AuditStats {
    /// Manifests in the window.
    pub total: u64,

    /// Approved decisions.
    pub approved: u64,

    /// Denied decisions.
    pub denied: u64,

    /// Seals marked executed.
    pub executed: u64,

    /// Approval percentage over the window, rounded to two decimals.
    pub approval_rate: f64,

    /// Manifest counts per provider, descending.
    pub by_provider: Vec<ProviderCount>,

    /// Most active agents, descending, at most five.
    pub top_agents: Vec<AgentCount>,

    /// Denial counts per reason, descending.
    pub denials_by_reason: Vec<ReasonCount>,
}

/// Manifest count for one provider.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderCount {
    /// Provider tag.
    pub provider: String,
    /// Manifests carrying it.
    pub count: u64,
}

/// Manifest count for one agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentCount {
    /// Agent identifier.
    pub agent_id: String,
    /// Manifests it submitted.
    pub count: u64,
}

/// Denial count for one reason.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReasonCount {
    /// The denial reason as recorded on seals.
    pub reason: String,
    /// Denials carrying it.
    pub count: u64,
}

/// Outcome of a `mark_executed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// This call performed the transition.
    Executed {
        /// The recorded execution time.
        executed_at: DateTime<Utc>,
    },

    /// A previous call already performed it.
    AlreadyExecuted {
        /// The original execution time.
        executed_at: DateTime<Utc>,
    },
}

/// Classification of an authentication or authorization event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    /// A bearer token was issued.
    TokenIssue,
    /// A presented token failed validation.
    TokenValidateFail,
    /// A manifest's identity matched its token.
    ManifestAuthOk,
    /// A manifest's identity contradicted its token.
    ManifestAuthFail,
    /// A protected endpoint accepted a credential.
    AuthSuccess,
    /// A protected endpoint rejected a credential.
    AuthFailure,
}

impl AuthEventKind {
    /// The stable string stored in the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenIssue => "token_issue",
            Self::TokenValidateFail => "token_validate_fail",
            Self::ManifestAuthOk => "manifest_auth_ok",
            Self::ManifestAuthFail => "manifest_auth_fail",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
        }
    }
}

/// An authentication event to append to the forensic trail.
#[derive(Debug, Clone, Default)]
pub struct AuthEvent {
    /// Event classification.
    pub kind: Option<AuthEventKind>,

    /// Agent involved, when known.
    pub agent_id: Option<String>,

    /// Organization involved, when known.
    pub org_id: Option<String>,

    /// Endpoint being accessed.
    pub endpoint: Option<String>,

    /// Client address.
    pub ip: Option<String>,

    /// Whether the event represents a success.
    pub success: bool,

    /// Why it failed, when it did.
    pub failure_reason: Option<String>,
}

impl AuthEvent {
    /// Starts an event of the given kind.
    #[must_use]
    pub fn new(kind: AuthEventKind, success: bool) -> Self {
        Self {
            kind: Some(kind),
            success,
            ..Self::default()
        }
    }

    /// Attaches the agent identity.
    #[must_use]
    pub fn agent(mut self, agent_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self.org_id = Some(org_id.into());
        self
    }

    /// Attaches the endpoint path.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attaches the client address.
    #[must_use]
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Attaches the failure reason.
    #[must_use]
    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// A persisted auth event, as read back for tests and forensics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuthEventRecord {
    /// Event identifier.
    pub event_id: Uuid,

    /// Stable event type string.
    pub event_type: String,

    /// Agent involved, when known.
    pub agent_id: Option<String>,

    /// Organization involved, when known.
    pub org_id: Option<String>,

    /// Endpoint being accessed.
    pub endpoint: Option<String>,

    /// Client address.
    pub ip: Option<String>,

    /// Whether the event represents a success.
    pub success: bool,

    /// Why it failed, when it did.
    pub failure_reason: Option<String>,

    /// When the event was recorded.
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,
}
