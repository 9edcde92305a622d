//! Error taxonomy for the PCLink domain layer.
//!
//! Mirrors spec.md §7's categories (Configuration, Authorization,
//! Validation, Transfer, Pairing, Internal). `pclink-web` maps each variant
//! onto an HTTP status and a stable machine-readable `code`.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Comprehensive error taxonomy for the PCLink host daemon's core layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    // ── Configuration (fatal at startup) ──────────────────────────────
    /// A configuration or persisted-state file failed to load or validate.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Authorization ──────────────────────────────────────────────────
    /// No credential was presented where one is required.
    #[error("missing credential")]
    MissingCredential,

    /// The presented credential does not match any known device or the
    /// server API key.
    #[error("invalid credential")]
    InvalidCredential,

    /// The presented credential belonged to a device that has since been
    /// revoked.
    #[error("revoked credential")]
    RevokedCredential,

    /// The requested operation is gated by a `ServiceToggle` that is off.
    #[error("service disabled: {0}")]
    ServiceDisabled(String),

    /// The caller has exceeded a rate limit.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    // ── Validation ──────────────────────────────────────────────────────
    /// The requested path escapes every configured allow-listed root.
    #[error("path forbidden")]
    PathForbidden,

    /// The requested path is otherwise invalid (not canonicalizable, etc).
    #[error("path invalid: {0}")]
    PathInvalid(String),

    /// Declared size does not match the bytes actually received/available.
    #[error("size mismatch")]
    SizeMismatch,

    /// A chunk index falls outside `[0, total_chunks)`.
    #[error("chunk out of range")]
    ChunkOutOfRange,

    /// The target path already exists and the conflict policy forbids it.
    #[error("conflict exists")]
    ConflictExists,

    // ── Transfer ──────────────────────────────────────────────────────
    /// The transfer session is paused and cannot accept this operation.
    #[error("transfer paused")]
    TransferPaused,

    /// The transfer session was reaped for staleness.
    #[error("transfer stale")]
    TransferStale,

    /// The transfer session was cancelled.
    #[error("transfer cancelled")]
    TransferCancelled,

    /// The underlying filesystem is out of space.
    #[error("disk full")]
    DiskFull,

    /// An I/O error occurred while servicing a transfer.
    #[error("io error: {0}")]
    Io(String),

    // ── Pairing ─────────────────────────────────────────────────────────
    /// The operator denied the pairing request.
    #[error("pairing denied")]
    PairingDenied,

    /// No operator decision arrived within the pairing window.
    #[error("pairing timed out")]
    PairingTimeout,

    /// The device name supplied with a pairing request is invalid.
    #[error("invalid pairing device name")]
    PairingInvalidName,

    // ── Internal ────────────────────────────────────────────────────────
    /// An unexpected internal failure. Carries an opaque incident id that
    /// is also present in the accompanying log line.
    #[error("internal error (incident {incident_id})")]
    Internal {
        /// Opaque identifier correlating this response with server logs.
        incident_id: String,
    },
}

impl CoreError {
    /// Build an [`CoreError::Internal`] with a freshly generated incident id.
    #[must_use]
    pub fn internal() -> Self {
        Self::Internal {
            incident_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// `true` if this error stems from invalid caller input rather than
    /// server state, used to decide whether to log at `warn!` vs `error!`.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::PathInvalid(_)
                | Self::SizeMismatch
                | Self::ChunkOutOfRange
                | Self::PairingInvalidName
                | Self::ConflictExists
        )
    }

    /// `true` if this error represents a security-relevant rejection
    /// (credential or path-escape failures), useful for audit logging.
    #[must_use]
    pub const fn is_security_issue(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential
                | Self::RevokedCredential
                | Self::PathForbidden
                | Self::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
