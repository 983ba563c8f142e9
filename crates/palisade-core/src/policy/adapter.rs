//! Fail-closed adapter for the external policy engine.
//!
//! The adapter owns the REST RPC with the engine and presents a single
//! operation to the orchestrator: `evaluate(input) -> Decision`. Every
//! failure mode — unreachable engine, malformed response, deadline overrun —
//! collapses into [`Decision::EngineUnavailable`], which the caller treats
//! as a denial and still ledgers. There is no retry here; retries belong at
//! the HTTP layer if anywhere.
//!
//! Policy load is atomic from the adapter's view: in-flight evaluations
//! complete against the old version, subsequent ones observe the new one.
//! The version cache is a reader-preferring swap; readers never block
//! readers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::compiler::CompiledPolicy;

/// Denial reason reported when the engine cannot produce a decision.
pub const ENGINE_UNAVAILABLE_REASON: &str = "policy engine unavailable";

/// Policy version reported when the engine cannot produce a decision.
pub const UNKNOWN_POLICY_VERSION: &str = "unknown";

/// Default deadline for a single evaluation RPC.
pub const DEFAULT_EVALUATE_DEADLINE: Duration = Duration::from_secs(2);

/// The outcome of a policy evaluation.
///
/// A closed sum so the orchestrator never branches on strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The action is permitted.
    Approved {
        /// Version of the policy that decided.
        policy_version: String,
        /// Ids of the rules that matched.
        matched_rules: Vec<String>,
    },

    /// The action is refused.
    Denied {
        /// Version of the policy that decided.
        policy_version: String,
        /// Human-readable reason for the refusal.
        reason: String,
        /// Ids of the rules that matched.
        matched_rules: Vec<String>,
    },

    /// The engine could not produce a decision; treated as a denial.
    EngineUnavailable,
}

impl Decision {
    /// Whether the action was approved.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// The policy version to record; `"unknown"` when the engine was
    /// unavailable.
    #[must_use]
    pub fn policy_version(&self) -> &str {
        match self {
            Self::Approved { policy_version, .. } | Self::Denied { policy_version, .. } => {
                policy_version
            },
            Self::EngineUnavailable => UNKNOWN_POLICY_VERSION,
        }
    }

    /// The denial reason, if the action was not approved.
    #[must_use]
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Self::Approved { .. } => None,
            Self::Denied { reason, .. } => Some(reason),
            Self::EngineUnavailable => Some(ENGINE_UNAVAILABLE_REASON),
        }
    }

    /// Ids of the rules that matched, empty when unavailable.
    #[must_use]
    pub fn matched_rules(&self) -> &[String] {
        match self {
            Self::Approved { matched_rules, .. } | Self::Denied { matched_rules, .. } => {
                matched_rules
            },
            Self::EngineUnavailable => &[],
        }
    }
}

/// Errors crossing the engine transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The request could not be sent or the response not read.
    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The engine answered with a non-success status.
    #[error("engine returned status {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The response body was not valid JSON.
    #[error("engine response malformed: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },
}

/// The wire operations the adapter needs from the engine.
///
/// Concrete deployments use [`HttpEngineTransport`]; tests substitute a
/// scripted stub.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Queries the data document at `entrypoint` with the given input.
    async fn query(&self, entrypoint: &str, input: &Value) -> Result<Value, TransportError>;

    /// Uploads a policy module under a stable name.
    async fn put_policy(&self, name: &str, module: &str) -> Result<(), TransportError>;

    /// Probes the engine's health endpoint.
    async fn health(&self) -> bool;
}

/// REST transport for an OPA-style policy engine.
pub struct HttpEngineTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngineTransport {
    /// Creates a transport for the engine at `base_url` with a per-request
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, deadline: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EngineTransport for HttpEngineTransport {
    async fn query(&self, entrypoint: &str, input: &Value) -> Result<Value, TransportError> {
        let path = entrypoint.replace('.', "/");
        let url = format!("{}/v1/data/{path}", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Malformed {
                message: e.to_string(),
            })
    }

    async fn put_policy(&self, name: &str, module: &str) -> Result<(), TransportError> {
        let url = format!("{}/v1/policies/{name}", self.base_url);

        let response = self
            .client
            .put(&url)
            .header("content-type", "text/plain")
            .body(module.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
            })
        }
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// The structured output the engine must return for an evaluation.
#[derive(Debug, Deserialize)]
struct EngineOutput {
    allow: bool,
    #[serde(default)]
    deny_reasons: Vec<String>,
    version: String,
    #[serde(default)]
    matched_rules: Vec<String>,
}

/// Adapter between the orchestrator and the external policy engine.
pub struct PolicyEngineAdapter {
    transport: Box<dyn EngineTransport>,
    entrypoint: String,
    policy_name: String,
    /// Cached version of the most recently loaded or observed policy.
    /// Swapped atomically; readers clone the `Arc`.
    version: RwLock<Option<Arc<str>>>,
}

impl PolicyEngineAdapter {
    /// Creates an adapter querying `entrypoint` and publishing policies
    /// under `policy_name`.
    #[must_use]
    pub fn new(
        transport: Box<dyn EngineTransport>,
        entrypoint: impl Into<String>,
        policy_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            entrypoint: entrypoint.into(),
            policy_name: policy_name.into(),
            version: RwLock::new(None),
        }
    }

    /// Evaluates a manifest projection against the current policy.
    ///
    /// Never fails: every transport or shape problem collapses to
    /// [`Decision::EngineUnavailable`], which callers treat as a denial.
    pub async fn evaluate(&self, input: &Value) -> Decision {
        let raw = match self.transport.query(&self.entrypoint, input).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "policy evaluation failed, failing closed");
                return Decision::EngineUnavailable;
            },
        };

        // The engine wraps the document in {"result": ...}; an absent result
        // means the policy is not loaded, which is indistinguishable from an
        // unavailable engine for our purposes.
        let Some(result) = raw.get("result") else {
            tracing::warn!("policy engine response missing result, failing closed");
            return Decision::EngineUnavailable;
        };

        let output: EngineOutput = match serde_json::from_value(result.clone()) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "policy engine response malformed, failing closed");
                return Decision::EngineUnavailable;
            },
        };

        self.observe_version(&output.version);

        if output.allow {
            Decision::Approved {
                policy_version: output.version,
                matched_rules: output.matched_rules,
            }
        } else {
            let reason = if output.deny_reasons.is_empty() {
                String::from("Policy violation")
            } else {
                output.deny_reasons.join("; ")
            };
            Decision::Denied {
                policy_version: output.version,
                reason,
                matched_rules: output.matched_rules,
            }
        }
    }

    /// Uploads a compiled policy and swaps the cached version.
    ///
    /// In-flight evaluations finish against the old version; later ones see
    /// the new one.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the upload fails; the cached version is
    /// left untouched in that case.
    pub async fn load(&self, compiled: &CompiledPolicy) -> Result<(), TransportError> {
        self.transport
            .put_policy(&self.policy_name, &compiled.module)
            .await?;

        let mut cached = self.version.write().unwrap();
        *cached = Some(Arc::from(compiled.version.as_str()));
        tracing::info!(version = %compiled.version, package = %compiled.package, "policy loaded");
        Ok(())
    }

    /// The cached policy version, if one has been loaded or observed.
    #[must_use]
    pub fn cached_version(&self) -> Option<Arc<str>> {
        self.version.read().unwrap().clone()
    }

    /// Probes the engine.
    pub async fn health(&self) -> bool {
        self.transport.health().await
    }

    /// Reconciles the cache with the version the engine actually used.
    ///
    /// Drift happens when an operator uploads policy out of band; the
    /// decision is recorded with the engine's version either way, so the
    /// cache only serves health reporting.
    fn observe_version(&self, seen: &str) {
        let stale = {
            let cached = self.version.read().unwrap();
            cached.as_deref() != Some(seen)
        };
        if stale {
            let mut cached = self.version.write().unwrap();
            if cached.as_deref() != Some(seen) {
                tracing::warn!(version = %seen, "policy version drift observed; cache updated");
                *cached = Some(Arc::from(seen));
            }
        }
    }
}
