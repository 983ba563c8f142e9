//! Seal issuance and signature verification.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer as _, Verifier as _, VerifyingKey};
use thiserror::Error;
use uuid::Uuid;

use super::keys::SealKeypair;
use super::types::{Seal, SealPayload};
use crate::canonical::CanonicalError;
use crate::manifest::truncate_to_seconds;

/// Default seal time-to-live.
///
/// Long enough to bridge normal network execution latency, short enough
/// that a leaked seal has a bounded blast radius.
pub const DEFAULT_TTL_MINUTES: i64 = 5;

/// Errors raised during seal issuance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SealError {
    /// The payload could not be canonicalized.
    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
}

/// Issues seals with the deployment's signing key.
///
/// The private key is read-only after initialization and never leaves this
/// engine; the corresponding public key is embedded in every issued seal so
/// verification needs no key registry.
pub struct SealEngine {
    keypair: SealKeypair,
    public_key_b64: String,
    ttl: Duration,
}

impl SealEngine {
    /// Creates an engine from a keypair and a TTL in minutes.
    #[must_use]
    pub fn new(keypair: SealKeypair, ttl_minutes: i64) -> Self {
        let public_key_b64 = keypair.public_key_base64();
        Self {
            keypair,
            public_key_b64,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// The base64-encoded public key embedded in issued seals.
    #[must_use]
    pub fn public_key_base64(&self) -> &str {
        &self.public_key_b64
    }

    /// The configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a seal for a decision.
    ///
    /// A seal is issued for denials too: it is evidentiary (signed, with
    /// `approved = false`) and no executor will honor it.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the payload cannot be canonicalized.
    pub fn issue(
        &self,
        manifest_id: Uuid,
        approved: bool,
        policy_version: &str,
        denial_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Seal, SealError> {
        let issued_at = truncate_to_seconds(now);
        let expires_at = issued_at + self.ttl;

        let payload = SealPayload {
            manifest_id,
            approved,
            policy_version: policy_version.to_string(),
            issued_at,
            expires_at,
            denial_reason: denial_reason.map(ToString::to_string),
        };

        let bytes = payload.canonical_bytes()?;
        let signature = self.keypair.signing_key().sign(&bytes);

        Ok(Seal {
            seal_id: generate_seal_id(issued_at, manifest_id),
            manifest_id,
            approved,
            policy_version: payload.policy_version,
            denial_reason: payload.denial_reason,
            signature: STANDARD.encode(signature.to_bytes()),
            public_key: self.public_key_b64.clone(),
            issued_at,
            expires_at,
            was_executed: false,
            executed_at: None,
        })
    }
}

/// Verifies a seal's signature against the public key it carries.
///
/// The payload is recomputed from the seal's stored fields, so no server
/// state is needed. Returns `false` on any decoding or verification failure;
/// a tampered seal is indistinguishable from a malformed one.
#[must_use]
pub fn verify_signature(seal: &Seal) -> bool {
    let Ok(bytes) = seal.payload().canonical_bytes() else {
        return false;
    };

    let Ok(key_bytes) = STANDARD.decode(&seal.public_key) else {
        return false;
    };
    let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };

    let Ok(sig_bytes) = STANDARD.decode(&seal.signature) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);

    verifying_key.verify(&bytes, &signature).is_ok()
}

/// Generates a seal identifier: `seal_<unix-seconds>_<manifest-prefix>`.
///
/// The manifest prefix carries the random high bits of the UUID, so two
/// seals collide only if issued the same second for manifests sharing a
/// 32-bit prefix; the ledger's unique constraint backstops that case.
fn generate_seal_id(issued_at: DateTime<Utc>, manifest_id: Uuid) -> String {
    let prefix = manifest_id
        .to_string()
        .split('-')
        .next()
        .unwrap_or("00000000")
        .to_string();
    format!("seal_{}_{}", issued_at.timestamp(), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SealEngine {
        SealEngine::new(SealKeypair::generate(), DEFAULT_TTL_MINUTES)
    }

    #[test]
    fn issued_seal_verifies() {
        let engine = engine();
        let seal = engine
            .issue(Uuid::new_v4(), true, "v0123456789abcdef", None, Utc::now())
            .unwrap();

        assert!(seal.approved);
        assert!(verify_signature(&seal));
    }

    #[test]
    fn denied_seal_is_signed_and_verifies() {
        let engine = engine();
        let seal = engine
            .issue(
                Uuid::new_v4(),
                false,
                "v0123456789abcdef",
                Some("Payment amount exceeds $50.00 limit"),
                Utc::now(),
            )
            .unwrap();

        assert!(!seal.approved);
        assert_eq!(
            seal.denial_reason.as_deref(),
            Some("Payment amount exceeds $50.00 limit")
        );
        assert!(verify_signature(&seal));
    }

    #[test]
    fn expiry_is_issued_at_plus_ttl() {
        let engine = engine();
        let seal = engine
            .issue(Uuid::new_v4(), true, "v0", None, Utc::now())
            .unwrap();
        assert_eq!(seal.expires_at - seal.issued_at, Duration::minutes(5));
    }

    #[test]
    fn tampered_signature_fails() {
        let engine = engine();
        let mut seal = engine
            .issue(Uuid::new_v4(), true, "v0", None, Utc::now())
            .unwrap();

        // Flip one bit in the decoded signature and re-encode.
        let mut raw = STANDARD.decode(&seal.signature).unwrap();
        raw[0] ^= 0x01;
        seal.signature = STANDARD.encode(raw);

        assert!(!verify_signature(&seal));
    }

    #[test]
    fn tampered_field_fails() {
        let engine = engine();
        let mut seal = engine
            .issue(Uuid::new_v4(), false, "v0", Some("denied"), Utc::now())
            .unwrap();

        seal.approved = true;
        assert!(!verify_signature(&seal));
    }

    #[test]
    fn garbage_encodings_fail_closed() {
        let engine = engine();
        let mut seal = engine
            .issue(Uuid::new_v4(), true, "v0", None, Utc::now())
            .unwrap();

        seal.public_key = "%%%not-base64%%%".into();
        assert!(!verify_signature(&seal));

        let mut seal2 = engine
            .issue(Uuid::new_v4(), true, "v0", None, Utc::now())
            .unwrap();
        seal2.signature = STANDARD.encode([0u8; 10]);
        assert!(!verify_signature(&seal2));
    }

    #[test]
    fn expiry_comparison_is_inclusive() {
        let engine = engine();
        let seal = engine
            .issue(Uuid::new_v4(), true, "v0", None, Utc::now())
            .unwrap();

        assert!(!seal.is_expired(seal.expires_at - Duration::seconds(1)));
        assert!(seal.is_expired(seal.expires_at));
        assert!(seal.is_expired(seal.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn seal_id_embeds_timestamp_and_prefix() {
        let engine = engine();
        let manifest_id = Uuid::new_v4();
        let seal = engine
            .issue(manifest_id, true, "v0", None, Utc::now())
            .unwrap();

        let expected_prefix = manifest_id.to_string()[..8].to_string();
        assert!(seal.seal_id.starts_with("seal_"));
        assert!(seal.seal_id.ends_with(&expected_prefix));
    }

    #[test]
    fn verification_survives_serde_round_trip() {
        let engine = engine();
        let seal = engine
            .issue(Uuid::new_v4(), true, "v0123", None, Utc::now())
            .unwrap();

        let json = serde_json::to_string(&seal).unwrap();
        let restored: Seal = serde_json::from_str(&json).unwrap();
        assert!(verify_signature(&restored));
    }
}
