//! The seal record and its signable payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::{self, CanonicalError};

/// A seal: signed evidence of a decision for exactly one manifest.
///
/// All fields except the execution pair are frozen at insert; the ledger
/// enforces that `(was_executed, executed_at)` transitions at most once,
/// from `(false, None)` to `(true, t)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seal {
    /// Opaque, globally unique seal identifier.
    pub seal_id: String,

    /// The manifest this seal decides.
    pub manifest_id: Uuid,

    /// Whether the action was approved. A denied seal is evidentiary only;
    /// no executor honors it.
    pub approved: bool,

    /// Content-derived version of the policy that produced the decision.
    pub policy_version: String,

    /// Reason for denial; present iff `approved` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,

    /// Base64-encoded Ed25519 signature over the canonical payload.
    pub signature: String,

    /// Base64-encoded public key of the issuer.
    pub public_key: String,

    /// Issuance time, second precision.
    #[serde(with = "rfc3339_secs")]
    pub issued_at: DateTime<Utc>,

    /// Expiry time: `issued_at` plus the configured TTL.
    #[serde(with = "rfc3339_secs")]
    pub expires_at: DateTime<Utc>,

    /// Whether the sealed action has been executed.
    #[serde(default)]
    pub was_executed: bool,

    /// When the action was executed, if it was.
    #[serde(default, with = "rfc3339_secs_opt", skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl Seal {
    /// The payload this seal's signature covers, rebuilt from stored fields.
    #[must_use]
    pub fn payload(&self) -> SealPayload {
        SealPayload {
            manifest_id: self.manifest_id,
            approved: self.approved,
            policy_version: self.policy_version.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            denial_reason: self.denial_reason.clone(),
        }
    }

    /// True once wall time has reached `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The exact structure covered by a seal signature.
///
/// Verification is reproducible from these fields alone; canonical encoding
/// pins the byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealPayload {
    /// The manifest being decided.
    pub manifest_id: Uuid,

    /// The decision.
    pub approved: bool,

    /// Policy version that produced the decision.
    pub policy_version: String,

    /// Issuance time, second precision.
    pub issued_at: DateTime<Utc>,

    /// Expiry time.
    pub expires_at: DateTime<Utc>,

    /// Denial reason, present iff denied.
    pub denial_reason: Option<String>,
}

impl SealPayload {
    /// Produces the canonical bytes the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if the payload cannot be canonicalized;
    /// with string and boolean fields only this does not occur in practice.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "manifest_id".into(),
            Value::String(self.manifest_id.to_string()),
        );
        fields.insert("approved".into(), Value::Bool(self.approved));
        fields.insert(
            "policy_version".into(),
            Value::String(self.policy_version.clone()),
        );
        fields.insert("issued_at".into(), Value::String(to_rfc3339(self.issued_at)));
        fields.insert(
            "expires_at".into(),
            Value::String(to_rfc3339(self.expires_at)),
        );
        if let Some(reason) = &self.denial_reason {
            fields.insert("denial_reason".into(), Value::String(reason.clone()));
        }

        canonical::canonicalize_value(&Value::Object(fields)).map(String::into_bytes)
    }
}

/// Formats a timestamp the single way seals serialize them.
fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serde adapter: RFC 3339 at second precision, `Z` suffix.
pub(crate) mod rfc3339_secs {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamps.
pub(crate) mod rfc3339_secs_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match t {
            Some(t) => {
                serializer.serialize_some(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
            },
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::truncate_to_seconds;

    fn payload(approved: bool) -> SealPayload {
        let issued = truncate_to_seconds(Utc::now());
        SealPayload {
            manifest_id: Uuid::new_v4(),
            approved,
            policy_version: "v1a2b3c4d5e6f708".into(),
            issued_at: issued,
            expires_at: issued + chrono::Duration::minutes(5),
            denial_reason: (!approved).then(|| "over limit".to_string()),
        }
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let p = payload(true);
        assert_eq!(p.canonical_bytes().unwrap(), p.canonical_bytes().unwrap());
    }

    #[test]
    fn denial_reason_changes_the_payload() {
        let approved = payload(true);
        let mut denied = approved.clone();
        denied.approved = false;
        denied.denial_reason = Some("over limit".into());
        assert_ne!(
            approved.canonical_bytes().unwrap(),
            denied.canonical_bytes().unwrap()
        );
    }

    #[test]
    fn canonical_bytes_sort_keys() {
        let p = payload(false);
        let text = String::from_utf8(p.canonical_bytes().unwrap()).unwrap();
        let approved_pos = text.find("\"approved\"").unwrap();
        let denial_pos = text.find("\"denial_reason\"").unwrap();
        let expires_pos = text.find("\"expires_at\"").unwrap();
        let issued_pos = text.find("\"issued_at\"").unwrap();
        let manifest_pos = text.find("\"manifest_id\"").unwrap();
        let version_pos = text.find("\"policy_version\"").unwrap();
        assert!(approved_pos < denial_pos);
        assert!(denial_pos < expires_pos);
        assert!(expires_pos < issued_pos);
        assert!(issued_pos < manifest_pos);
        assert!(manifest_pos < version_pos);
    }

    #[test]
    fn seal_serde_round_trip() {
        let issued = truncate_to_seconds(Utc::now());
        let seal = Seal {
            seal_id: "seal_1700000000_550e8400".into(),
            manifest_id: Uuid::new_v4(),
            approved: true,
            policy_version: "v0011223344556677".into(),
            denial_reason: None,
            signature: "c2ln".into(),
            public_key: "cGs=".into(),
            issued_at: issued,
            expires_at: issued + chrono::Duration::minutes(5),
            was_executed: false,
            executed_at: None,
        };

        let json = serde_json::to_string(&seal).unwrap();
        let back: Seal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seal);
        // Second-precision timestamps survive the trip exactly, which is
        // what keeps recomputed payloads byte-identical.
        assert_eq!(back.payload().canonical_bytes().unwrap(),
                   seal.payload().canonical_bytes().unwrap());
    }
}
