//! API error taxonomy and HTTP mapping.
//!
//! Every error response carries the compact problem shape
//! `{error_code, message, details?}`. Error codes are stable across
//! releases; clients branch on them, not on messages. Denials are not
//! errors: they are successful responses with `approved = false`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use thiserror::Error;

use palisade_core::identity::IdentityError;
use palisade_core::ledger::LedgerError;
use palisade_core::manifest::ManifestError;
use palisade_core::seal::SealError;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request body or query failed schema validation.
    SchemaViolation,
    /// Authentication is required or the credential is invalid.
    Unauthorized,
    /// The credential is valid but does not grant this access.
    Forbidden,
    /// The referenced seal, manifest, organization, or agent is missing.
    NotFound,
    /// The seal's execution transition already happened.
    AlreadyExecuted,
    /// The seal's TTL has passed.
    SealExpired,
    /// A manifest-id collision survived the retry.
    ManifestConflict,
    /// The request body exceeds the configured limit.
    PayloadTooLarge,
    /// The server is at its concurrency bound; retry later.
    Overloaded,
    /// The request deadline expired.
    DeadlineExceeded,
    /// The audit ledger refused or failed an operation.
    LedgerFailure,
    /// Unclassified internal fault.
    Internal,
}

impl ErrorCode {
    /// The wire string for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SchemaViolation => "schema_violation",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::AlreadyExecuted => "already_executed",
            Self::SealExpired => "seal_expired",
            Self::ManifestConflict => "manifest_conflict",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Overloaded => "overloaded",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::LedgerFailure => "ledger_failure",
            Self::Internal => "internal",
        }
    }

    /// The HTTP status this code maps to.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::SchemaViolation => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExecuted | Self::SealExpired | Self::ManifestConflict => {
                StatusCode::CONFLICT
            },
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::LedgerFailure | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An API-level error, rendered as the problem shape.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    /// Stable code.
    pub code: ErrorCode,

    /// Human-readable message.
    pub message: String,

    /// Optional structured context.
    pub details: Option<Value>,

    /// Seconds the client should wait before retrying, for 503s.
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Builds an error with a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// A schema violation with the offending field path in the message.
    #[must_use]
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaViolation, message)
    }

    /// A missing-credential or bad-credential error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// A scope violation.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// A missing entity.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// The backpressure response, with `Retry-After`.
    #[must_use]
    pub fn overloaded(retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            message: String::from("too many in-flight requests"),
            details: None,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// The deadline response.
    #[must_use]
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "request deadline exceeded")
    }

    /// An unclassified internal fault. The message is logged, not leaked.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "internal fault");
        Self::new(ErrorCode::Internal, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let mut body = serde_json::Map::new();
        body.insert(
            "error_code".into(),
            Value::String(self.code.as_str().to_string()),
        );
        body.insert("message".into(), Value::String(self.message));
        if let Some(details) = self.details {
            body.insert("details".into(), details);
        }

        let mut response = (status, Json(Value::Object(body))).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<ManifestError> for ApiError {
    fn from(e: ManifestError) -> Self {
        Self::schema(e.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ManifestNotFound { .. } | LedgerError::SealNotFound { .. } => {
                Self::not_found(e.to_string())
            },
            LedgerError::DuplicateManifest { .. } => {
                Self::new(ErrorCode::ManifestConflict, e.to_string())
            },
            LedgerError::Database(_) | LedgerError::Corrupt { .. } => {
                tracing::error!(error = %e, "ledger failure");
                Self::new(ErrorCode::LedgerFailure, "audit ledger failure")
            },
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::OrgNotFound { .. } | IdentityError::AgentNotFound { .. } => {
                Self::not_found(e.to_string())
            },
            IdentityError::AlreadyRegistered { .. } => Self::internal(e.to_string()),
            IdentityError::Database(_) | IdentityError::Corrupt { .. } => {
                tracing::error!(error = %e, "identity store failure");
                Self::new(ErrorCode::LedgerFailure, "identity store failure")
            },
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<SealError> for ApiError {
    fn from(e: SealError) -> Self {
        Self::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_documented_statuses() {
        assert_eq!(ErrorCode::SchemaViolation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::AlreadyExecuted.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ManifestConflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ErrorCode::Overloaded.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::DeadlineExceeded.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ErrorCode::LedgerFailure.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn ledger_errors_map_by_kind() {
        let not_found = ApiError::from(LedgerError::SealNotFound {
            seal_id: "seal_x".into(),
        });
        assert_eq!(not_found.code, ErrorCode::NotFound);

        let duplicate = ApiError::from(LedgerError::DuplicateManifest {
            manifest_id: uuid::Uuid::new_v4(),
        });
        assert_eq!(duplicate.code, ErrorCode::ManifestConflict);
    }

    #[test]
    fn internal_messages_are_not_leaked() {
        let error = ApiError::internal("sqlite file is corrupt at page 7");
        assert_eq!(error.message, "internal error");
    }
}
