//! Error types for web handlers.
//!
//! Bridges [`pclink_core::CoreError`] (and other handler-local failures)
//! to HTTP responses. Every non-2xx response carries `{detail, code}`
//! (spec.md §6), and every non-2xx is logged at `warn!` or above
//! (spec.md §7).

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pclink_core::CoreError;
use pclink_core::devices::AuthError as DeviceAuthError;
use serde::Serialize;

/// Application error type for web handlers: an HTTP status, a stable
/// machine-readable `code`, and a human-readable `detail`.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    detail: String,
    code: String,
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Construct directly from parts.
    #[must_use]
    pub const fn new(status: StatusCode, detail: String, code: String) -> Self {
        Self {
            status,
            detail,
            code,
            source: None,
        }
    }

    /// Attach an internal source error for logging (never serialized to
    /// the client).
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400 with code `BAD_REQUEST`.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail.into(), "BAD_REQUEST".into())
    }

    /// 401 with code `missing_credential`, `invalid_credential`, or
    /// `revoked_credential`.
    #[must_use]
    pub fn unauthorized(detail: impl Into<String>, code: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail.into(), code.to_string())
    }

    /// 403 with an explicit code (`service_disabled`, `path_forbidden`,
    /// `pairing_denied`, ...).
    #[must_use]
    pub fn forbidden(detail: impl Into<String>, code: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail.into(), code.to_string())
    }

    /// 404 with code `NOT_FOUND`.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail.into(), "NOT_FOUND".into())
    }

    /// 409 with an explicit code (`conflict_exists`, `transfer_paused`,
    /// `transfer_cancelled`, ...).
    #[must_use]
    pub fn conflict(detail: impl Into<String>, code: &str) -> Self {
        Self::new(StatusCode::CONFLICT, detail.into(), code.to_string())
    }

    /// 422 with code `VALIDATION_ERROR`.
    #[must_use]
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            detail.into(),
            "VALIDATION_ERROR".into(),
        )
    }

    /// 408 with code `pairing_timeout`.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::REQUEST_TIMEOUT,
            detail.into(),
            "pairing_timeout".into(),
        )
    }

    /// 429 with code `rate_limited`.
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate limited, retry after {retry_after_secs}s"),
            "rate_limited".into(),
        )
    }

    /// 500 with an opaque incident id, per spec.md §7.
    #[must_use]
    pub fn internal(incident_id: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal error (incident {incident_id})"),
            "INTERNAL_SERVER_ERROR".into(),
        )
    }

    /// 507 with code `disk_full`.
    #[must_use]
    pub fn disk_full() -> Self {
        Self::new(
            StatusCode::INSUFFICIENT_STORAGE,
            "disk full".into(),
            "disk_full".into(),
        )
    }

    /// 503 with code `SERVICE_UNAVAILABLE`.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            detail.into(),
            "SERVICE_UNAVAILABLE".into(),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.detail)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = %self.code,
                detail = %self.detail,
                error = self.source.as_ref().map(ToString::to_string),
                "internal server error"
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                status = %self.status,
                code = %self.code,
                detail = %self.detail,
                "request rejected"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let incident_id = uuid::Uuid::new_v4().to_string();
        Self::internal(&incident_id).with_source(err)
    }
}

/// Map [`CoreError`] onto the HTTP status/code taxonomy of spec.md §7.
impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Configuration(msg) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg, "CONFIGURATION_ERROR".into())
            },
            CoreError::MissingCredential => {
                Self::unauthorized("missing credential", "missing_credential")
            },
            CoreError::InvalidCredential => {
                Self::unauthorized("invalid credential", "invalid_credential")
            },
            CoreError::RevokedCredential => {
                Self::unauthorized("credential has been revoked", "revoked_credential")
            },
            CoreError::ServiceDisabled(name) => Self::forbidden(
                format!("service '{name}' is disabled"),
                "service_disabled",
            ),
            CoreError::RateLimited { retry_after_secs } => Self::rate_limited(retry_after_secs),
            CoreError::PathForbidden => Self::forbidden("path forbidden", "path_forbidden"),
            CoreError::PathInvalid(msg) => Self::bad_request(msg).with_code("path_invalid"),
            CoreError::SizeMismatch => Self::bad_request("size mismatch").with_code("size_mismatch"),
            CoreError::ChunkOutOfRange => {
                Self::bad_request("chunk out of range").with_code("chunk_out_of_range")
            },
            CoreError::ConflictExists => Self::conflict("conflict exists", "conflict_exists"),
            CoreError::TransferPaused => Self::conflict("transfer is paused", "transfer_paused"),
            CoreError::TransferStale => Self::new(
                StatusCode::GONE,
                "transfer is stale".into(),
                "transfer_stale".into(),
            ),
            CoreError::TransferCancelled => {
                Self::conflict("transfer was cancelled", "transfer_cancelled")
            },
            CoreError::DiskFull => Self::disk_full(),
            CoreError::Io(msg) => {
                let incident_id = uuid::Uuid::new_v4().to_string();
                tracing::error!(error = %msg, incident_id = %incident_id, "io error");
                Self::internal(&incident_id)
            },
            CoreError::PairingDenied => Self::forbidden("pairing request denied", "pairing_denied"),
            CoreError::PairingTimeout => Self::timeout("pairing request timed out"),
            CoreError::PairingInvalidName => {
                Self::bad_request("invalid device name").with_code("pairing_invalid_name")
            },
            CoreError::Internal { incident_id } => Self::internal(&incident_id),
        }
    }
}

impl From<DeviceAuthError> for AppError {
    fn from(err: DeviceAuthError) -> Self {
        match err {
            DeviceAuthError::Missing => {
                Self::unauthorized("missing credential", "missing_credential")
            },
            DeviceAuthError::Invalid => {
                Self::unauthorized("invalid credential", "invalid_credential")
            },
            DeviceAuthError::Revoked => {
                Self::unauthorized("credential has been revoked", "revoked_credential")
            },
        }
    }
}

impl AppError {
    /// Override the `code` field after construction; used where a
    /// `bad_request`-shaped status needs a spec-specific code.
    #[must_use]
    fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_code_and_detail() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn core_error_maps_to_expected_status() {
        let err: AppError = CoreError::PathForbidden.into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, "path_forbidden");
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err: AppError = CoreError::RateLimited { retry_after_secs: 30 }.into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "rate_limited");
    }

    #[test]
    fn transfer_stale_maps_to_410() {
        let err: AppError = CoreError::TransferStale.into();
        assert_eq!(err.status, StatusCode::GONE);
    }

    #[test]
    fn revoked_credential_maps_to_401() {
        let err: AppError = DeviceAuthError::Revoked.into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, "revoked_credential");
    }
}
