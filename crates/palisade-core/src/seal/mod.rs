//! Cryptographic seals: signed evidence of an authorization decision.
//!
//! A seal binds exactly one manifest to the decision that was made for it.
//! The Ed25519 signature covers the canonical encoding of
//! `{manifest_id, approved, policy_version, issued_at, expires_at,
//! denial_reason?}`, so any holder can verify a seal from its stored fields
//! alone, without a server round-trip. Execution state (one-time use) lives
//! in the audit ledger; this module owns key handling, issuance, and
//! signature verification.
//!
//! # Keys
//!
//! A single active signing key per deployment, provisioned out of band. The
//! private key never leaves the engine. Verifiers use the public key carried
//! in the seal itself, so key rotation never invalidates already-issued
//! seals.

mod engine;
mod keys;
pub(crate) mod types;

pub use engine::{verify_signature, SealEngine, SealError, DEFAULT_TTL_MINUTES};
pub use keys::{KeyError, SealKeypair};
pub use types::{Seal, SealPayload};
