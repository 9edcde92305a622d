//! Axum middleware for request tracking and observability.
//!
//! This module provides middleware layers for:
//! - **Correlation ID tracking**: Extract or generate correlation IDs for distributed tracing
//! - **Response headers**: Automatically inject correlation ID into responses
//! - **Tracing integration**: Create spans with correlation context
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use pclink_web::middleware::correlation_id_layer;
//!
//! let app = Router::new()
//!     .route("/api/users", get(list_users))
//!     .layer(correlation_id_layer());
//! ```
//!
//! # Flow
//!
//! 1. **Extract** correlation ID from `X-Correlation-ID` header (or generate new UUID)
//! 2. **Store** in request extensions for handler access
//! 3. **Create tracing span** with correlation_id field
//! 4. **Inject** correlation ID into response `X-Correlation-ID` header
//!
//! # Benefits
//!
//! - **Automatic**: No manual extraction needed in handlers
//! - **Consistent**: Every request has a correlation ID
//! - **Observable**: Tracing spans include correlation context
//! - **Client-friendly**: Clients receive their correlation ID back

use axum::{
    extract::Request,
    http::HeaderValue,
    response::Response,
};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use uuid::Uuid;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Create a layer that adds correlation ID tracking to all requests.
///
/// This layer:
/// - Extracts correlation ID from request header or generates new UUID
/// - Stores correlation ID in request extensions
/// - Creates tracing span with correlation_id field
/// - Injects correlation ID into response header
///
/// # Example
///
/// ```ignore
/// use axum::Router;
/// use pclink_web::middleware::correlation_id_layer;
///
/// let app = Router::new()
///     .route("/api/users", get(list_users))
///     .layer(correlation_id_layer());
/// ```
#[must_use]
pub fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // Extract correlation ID from header or generate new
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        // Store in request extensions for handler access
        req.extensions_mut().insert(correlation_id);

        // Create tracing span with correlation context
        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            // Execute request within span
            let mut response = fut.instrument(span).await?;

            // Inject correlation ID into response header
            if let Ok(header_value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response
                    .headers_mut()
                    .insert(CORRELATION_ID_HEADER, header_value);
            }

            Ok(response)
        })
    }
}

/// Extension trait for extracting correlation ID from request extensions.
///
/// This trait provides a convenience method for handlers to extract
/// the correlation ID that was injected by the middleware.
///
/// # Example
///
/// ```ignore
/// use pclink_web::middleware::CorrelationIdExt;
///
/// async fn handler(Extension(req): Extension<Request>) -> String {
///     let correlation_id = req.correlation_id();
///     format!("Request ID: {correlation_id}")
/// }
/// ```
pub trait CorrelationIdExt {
    /// Get the correlation ID from request extensions.
    ///
    /// # Panics
    ///
    /// Panics if the correlation ID middleware is not installed.
    /// Always use `correlation_id_layer()` in your router.
    fn correlation_id(&self) -> Uuid;

    /// Try to get the correlation ID from request extensions.
    ///
    /// Returns `None` if the correlation ID middleware is not installed.
    fn try_correlation_id(&self) -> Option<Uuid>;
}

impl CorrelationIdExt for Request {
    fn correlation_id(&self) -> Uuid {
        self.extensions()
            .get::<Uuid>()
            .copied()
            .expect("CorrelationId middleware not installed")
    }

    fn try_correlation_id(&self) -> Option<Uuid> {
        self.extensions().get::<Uuid>().copied()
    }
}

// Re-export tracing for use with Instrument
use tracing::Instrument;

use crate::error::AppError;
use crate::extractors::{ApiKeyHeader, OperatorCookie};
use crate::state::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use pclink_core::devices::AuthOutcome;
use std::net::IpAddr;
use uuid::Uuid;

fn extract_client_ip_sync(headers: &axum::http::HeaderMap) -> IpAddr {
    if let Some(forwarded) = headers.get("X-Forwarded-For") {
        if let Ok(s) = forwarded.to_str() {
            if let Some(first) = s.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }
    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(s) = real_ip.to_str() {
            if let Ok(ip) = s.parse::<IpAddr>() {
                return ip;
            }
        }
    }
    "127.0.0.1".parse().expect("Valid IP")
}

/// Which credential authorized a device-class request (spec.md §4.2,
/// §4.4: the server's own API key authorizes identically to a device
/// key but is reported distinctly for audit purposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdentity {
    /// A specific paired device.
    Device(Uuid),
    /// The server's own API key.
    Server,
}

/// Extractor guarding device-class endpoints: requires a valid
/// `X-API-Key` matching either a paired device or the server itself
/// (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
pub struct DeviceAuth(pub DeviceIdentity);

#[async_trait]
impl FromRequestParts<AppState> for DeviceAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ApiKeyHeader(key) = match ApiKeyHeader::from_request_parts(parts, state).await {
            Ok(v) => v,
            Err(never) => match never {},
        };
        let key = key.ok_or(pclink_core::devices::AuthError::Missing)?;
        let outcome = state.devices.authorize(&key).await?;
        Ok(Self(match outcome {
            AuthOutcome::Device(id) => DeviceIdentity::Device(id),
            AuthOutcome::Server => DeviceIdentity::Server,
        }))
    }
}

/// Extractor guarding operator-class endpoints: requires a valid
/// `pclink_session` cookie bound to the request's source IP
/// (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct OperatorGuard(pub pclink_core::auth::OperatorSession);

#[async_trait]
impl FromRequestParts<AppState> for OperatorGuard {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let OperatorCookie(token) = match OperatorCookie::from_request_parts(parts, state).await {
            Ok(v) => v,
            Err(never) => match never {},
        };
        let token = token.ok_or_else(|| {
            AppError::unauthorized("missing operator session", "missing_credential")
        })?;
        let client_ip = extract_client_ip_sync(&parts.headers);
        state
            .operator_auth
            .validate_session(&token, client_ip)
            .await
            .map(OperatorGuard)
            .ok_or_else(|| AppError::unauthorized("invalid or expired session", "invalid_credential"))
    }
}

/// Reject with 403 `service_disabled` unless `name`'s [`ServiceToggle`]
/// is on (spec.md §4.4, §4.8 "service-toggle" middleware stage).
///
/// # Errors
///
/// Returns [`AppError::forbidden`] if the toggle is off or unknown.
pub async fn require_toggle(state: &AppState, name: &str) -> Result<(), AppError> {
    let enabled = state.config.read().await.toggles.get(name).unwrap_or(false);
    if enabled {
        Ok(())
    } else {
        Err(AppError::forbidden(
            format!("service '{name}' is disabled"),
            "service_disabled",
        ))
    }
}

/// Layer applying the login-attempt rate limiter to `POST /auth/login`
/// only (spec.md §4.8 middleware order: request-id, rate limiter(login
/// only), auth, service-toggle, handler). Attached per-route rather than
/// globally since it's scoped to exactly one endpoint.
#[must_use]
pub fn login_rate_limit_layer(state: AppState) -> LoginRateLimitLayer {
    LoginRateLimitLayer { state }
}

/// Layer for [`login_rate_limit_layer`].
#[derive(Clone)]
pub struct LoginRateLimitLayer {
    state: AppState,
}

impl<S> Layer<S> for LoginRateLimitLayer {
    type Service = LoginRateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoginRateLimitMiddleware {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Middleware service for [`LoginRateLimitLayer`].
#[derive(Clone)]
pub struct LoginRateLimitMiddleware<S> {
    inner: S,
    state: AppState,
}

impl<S> Service<axum::extract::Request> for LoginRateLimitMiddleware<S>
where
    S: Service<axum::extract::Request, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: axum::extract::Request) -> Self::Future {
        let client_ip = extract_client_ip_sync(req.headers());
        let limiter = self.state.login_limiter.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            use pclink_core::ratelimit::RateLimitDecision;
            match limiter.check_and_record(&client_ip.to_string()).await {
                RateLimitDecision::Limited { retry_after_secs } => {
                    let err = AppError::rate_limited(retry_after_secs);
                    Ok(err.into_response())
                },
                RateLimitDecision::Allowed => inner.call(req).await,
            }
        })
    }
}
