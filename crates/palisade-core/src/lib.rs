//! # palisade-core
//!
//! Core library for Palisade - an authorization gateway that sits between
//! autonomous software agents and externally-visible side-effecting
//! operations (payments, infrastructure mutations, data exports).
//!
//! For every proposed action the gateway evaluates a declarative policy,
//! issues a short-lived cryptographically signed authorization token (a
//! "seal") when permitted, and records an immutable audit entry. Downstream
//! executors accept the action only if accompanied by a verifiable,
//! unexpired, unconsumed seal.
//!
//! ## Features
//!
//! - **Canonical serialization**: Deterministic byte encoding over which
//!   seal signatures are computed
//! - **Seal engine**: Ed25519 sign/verify with TTL and one-time-use
//!   enforcement
//! - **Policy compilation**: Declarative YAML policy sources compiled to the
//!   policy engine's native rule language
//! - **Policy evaluation**: Fail-closed adapter for the external policy
//!   engine's REST API
//! - **Audit ledger**: Append-only `SQLite` storage with immutability
//!   enforced by the schema itself
//! - **Identity**: Organizations, agents, and HMAC-signed bearer tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use palisade_core::ledger::AuditLedger;
//! use palisade_core::seal::{SealEngine, SealKeypair};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = AuditLedger::in_memory()?;
//! let engine = SealEngine::new(SealKeypair::generate(), 5);
//! # let _ = (ledger, engine);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod config;
pub mod identity;
pub mod ledger;
pub mod manifest;
pub mod policy;
pub mod seal;

pub use config::GatewayConfig;
pub use ledger::AuditLedger;
pub use manifest::Manifest;
pub use policy::{Decision, PolicyEngineAdapter};
pub use seal::{Seal, SealEngine};
