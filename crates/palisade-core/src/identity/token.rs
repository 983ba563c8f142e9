//! HMAC-signed bearer tokens.
//!
//! A token is `base64url(claims-json) "." base64url(hmac-sha256)`, signed
//! with a deployment-wide secret. Verification recomputes the MAC over the
//! claims segment and compares in constant time before trusting anything
//! inside; only then are the claims parsed and the expiry checked.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime: one hour.
pub const DEFAULT_TOKEN_EXPIRY_SECS: i64 = 3600;

/// Clock-skew leeway applied to expiry checks.
const EXPIRY_LEEWAY_SECS: i64 = 10;

/// Errors raised while minting or verifying tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    /// The token does not have the `claims.mac` shape.
    #[error("malformed token")]
    Malformed,

    /// The MAC does not match the claims.
    #[error("token signature mismatch")]
    BadSignature,

    /// The token's expiry has passed.
    #[error("token expired")]
    Expired,
}

/// The claims carried inside a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject: the agent the token was issued to.
    pub sub: String,

    /// Organization the agent belongs to.
    pub org: String,

    /// Scope of the token. Currently always `"org"`.
    pub scope: String,

    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

/// Mints and verifies bearer tokens with a deployment-wide secret.
pub struct TokenMinter {
    secret: SecretString,
    expiry: Duration,
}

impl TokenMinter {
    /// Creates a minter with the given secret and the default expiry.
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self::with_expiry(secret, DEFAULT_TOKEN_EXPIRY_SECS)
    }

    /// Creates a minter with an explicit expiry in seconds.
    #[must_use]
    pub fn with_expiry(secret: SecretString, expiry_secs: i64) -> Self {
        Self {
            secret,
            expiry: Duration::seconds(expiry_secs),
        }
    }

    /// Generates a random secret, for deployments that did not configure
    /// one. Tokens minted against a generated secret do not survive a
    /// restart.
    #[must_use]
    pub fn generate_secret() -> SecretString {
        let bytes: [u8; 32] = rand::random();
        SecretString::from(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The configured token lifetime in seconds.
    #[must_use]
    pub fn expiry_secs(&self) -> i64 {
        self.expiry.num_seconds()
    }

    /// Mints a token for an agent.
    #[must_use]
    pub fn mint(&self, agent_id: &str, org_id: &str, now: DateTime<Utc>) -> String {
        let claims = Claims {
            sub: agent_id.to_string(),
            org: org_id.to_string(),
            scope: String::from("org"),
            iat: now.timestamp(),
            exp: (now + self.expiry).timestamp(),
        };

        // Claims are a plain struct; serialization cannot fail.
        let body = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let mac = self.mac_of(encoded.as_bytes());

        format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(mac))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] on shape or encoding problems,
    /// [`TokenError::BadSignature`] when the MAC does not match, and
    /// [`TokenError::Expired`] when `exp` has passed (with a small leeway
    /// for clock skew).
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let (encoded, mac_part) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let presented = URL_SAFE_NO_PAD
            .decode(mac_part)
            .map_err(|_| TokenError::Malformed)?;
        let expected = self.mac_of(encoded.as_bytes());

        if presented.ct_eq(&expected).unwrap_u8() != 1 {
            return Err(TokenError::BadSignature);
        }

        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)?;

        if now.timestamp() > claims.exp + EXPIRY_LEEWAY_SECS {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    fn mac_of(&self, message: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message);
        mac.finalize().into_bytes().into()
    }
}
