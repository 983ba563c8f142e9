//! Gateway configuration.
//!
//! Loaded from a TOML file at startup; every field has a default so a
//! missing file yields a working development configuration. Binary flags
//! override file values. Secrets are wrapped in [`SecretString`] so they
//! never appear in debug output.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or contains unknown keys.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Audit ledger database settings.
    pub database: DatabaseConfig,

    /// Policy engine and policy source settings.
    pub policy: PolicyConfig,

    /// Seal issuance settings.
    pub seal: SealConfig,

    /// Bearer-token authentication settings.
    pub auth: AuthConfig,
}

impl GatewayConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the server binds to.
    pub listen_addr: String,

    /// Overall per-request deadline in seconds; expiry answers 504.
    pub request_deadline_secs: u64,

    /// Maximum accepted request body in bytes; larger bodies answer 413.
    pub max_body_bytes: usize,

    /// Bound on concurrent in-flight validate requests; excess answers 503.
    pub max_in_flight_validates: usize,

    /// Whether to attach a permissive CORS layer.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::from("127.0.0.1:8400"),
            request_deadline_secs: 5,
            max_body_bytes: 256 * 1024,
            max_in_flight_validates: 64,
            cors: true,
        }
    }
}

/// Audit ledger database settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path of the `SQLite` database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("palisade.db"),
        }
    }
}

/// Policy engine and policy source settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Base URL of the external policy engine.
    pub engine_url: String,

    /// Data-document entrypoint queried per evaluation, dot-separated.
    pub entrypoint: String,

    /// Name the compiled policy is uploaded under.
    pub policy_name: String,

    /// Deadline for a single evaluation RPC, in milliseconds.
    pub evaluate_deadline_ms: u64,

    /// Declarative policy source compiled and uploaded at startup, if set.
    pub source_path: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine_url: String::from("http://127.0.0.1:8181"),
            entrypoint: String::from("gateway.policies.main"),
            policy_name: String::from("main"),
            evaluate_deadline_ms: 2000,
            source_path: None,
        }
    }
}

/// Seal issuance settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SealConfig {
    /// Seal time-to-live in minutes.
    pub ttl_minutes: i64,

    /// Base64-encoded Ed25519 signing key. A fresh key is generated when
    /// absent; seals issued against a generated key cannot be verified
    /// after a restart, so production deployments must set this.
    pub signing_key: Option<SecretString>,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: crate::seal::DEFAULT_TTL_MINUTES,
            signing_key: None,
        }
    }
}

/// Bearer-token authentication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Whether `validate` requires a bearer token. Single-trust-domain
    /// deployments leave this off; multi-tenant ones turn it on.
    pub required: bool,

    /// Secret for token signing. Generated at startup when absent, which
    /// invalidates outstanding tokens on restart.
    pub token_secret: Option<SecretString>,

    /// Token lifetime in seconds.
    pub token_expiry_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: false,
            token_secret: None,
            token_expiry_secs: crate::identity::DEFAULT_TOKEN_EXPIRY_SECS,
        }
    }
}
