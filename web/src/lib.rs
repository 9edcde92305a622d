//! Axum HTTP/WebSocket surface for the PCLink host daemon.
//!
//! Wires the domain components in `pclink-core` (device registry,
//! pairing broker, session hub, transfer engine, listener control) to
//! the route table in [`router`], with auth and service-toggle
//! enforcement expressed as per-handler extractors
//! ([`middleware::DeviceAuth`], [`middleware::OperatorGuard`],
//! [`middleware::require_toggle`]) rather than a single global
//! middleware stack, since which credential class a route needs varies
//! route by route (spec.md §4.8).
//!
//! # Request flow
//!
//! 1. `tower` layers: correlation-id injection, then the `/auth/login`
//!    rate limiter.
//! 2. Handler-level extractors classify the credential (`DeviceAuth` /
//!    `OperatorGuard`) and reject before the handler body runs.
//! 3. Handlers that gate a toggleable feature call
//!    [`middleware::require_toggle`] before touching `pclink-core`.
//! 4. [`error::AppError`] maps every failure onto `{detail, code}` JSON
//!    plus the right HTTP status (spec.md §7).

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

pub use error::AppError;
pub use extractors::{ClientIp, CorrelationId, UserAgent};
pub use middleware::{
    correlation_id_layer, login_rate_limit_layer, require_toggle, CorrelationIdExt, DeviceAuth,
    DeviceIdentity, OperatorGuard, CORRELATION_ID_HEADER,
};
pub use router::build as build_router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
