//! Operator password lifecycle: setup, login, logout, change-password,
//! status, check (spec.md §4.4, §6).

use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderValue, SET_COOKIE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::extractors::{ClientIp, OperatorCookie, OPERATOR_SESSION_COOKIE};
use crate::middleware::OperatorGuard;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PasswordBody {
    password: String,
}

/// `POST /auth/setup`: set the operator password for the first time.
///
/// # Errors
///
/// Returns [`AppError::conflict`] if setup already completed.
pub async fn setup(
    State(state): State<AppState>,
    Json(body): Json<PasswordBody>,
) -> Result<(), AppError> {
    if state.operator_auth.is_set_up().await {
        return Err(AppError::conflict("setup already completed", "already_set_up"));
    }
    state.operator_auth.set_password(&body.password).await?;
    let mut config = state.config.write().await;
    config.setup_complete = true;
    config.operator_password_hash = state.operator_auth.password_hash_snapshot().await;
    config.persist(&state.config_path).map_err(AppError::from)?;
    Ok(())
}

fn session_cookie(token: &str) -> HeaderValue {
    let max_age = pclink_core::config::OPERATOR_SESSION_TTL.as_secs();
    HeaderValue::from_str(&format!(
        "{OPERATOR_SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Strict; Max-Age={max_age}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `POST /auth/login`: verify the operator password and issue a session
/// cookie. Rate-limited at the router layer, not here (spec.md §4.4).
///
/// # Errors
///
/// Returns [`AppError::unauthorized`] on a bad password.
pub async fn login(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(body): Json<PasswordBody>,
) -> Result<Response, AppError> {
    if !state.operator_auth.verify_password(&body.password).await {
        return Err(AppError::unauthorized("invalid password", "invalid_credential"));
    }
    let session = state.operator_auth.login(client_ip).await;
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, session_cookie(&session.token));
    Ok((headers, Json(serde_json::json!({"expires_at": session.expires_at}))).into_response())
}

/// `POST /auth/logout`: destroy the presented session, if any.
pub async fn logout(State(state): State<AppState>, OperatorCookie(token): OperatorCookie) {
    if let Some(token) = token {
        state.operator_auth.logout(&token).await;
    }
}

/// `POST /auth/change-password`: requires an active operator session.
///
/// # Errors
///
/// Returns [`AppError::internal`] if hashing the new password fails.
pub async fn change_password(
    State(state): State<AppState>,
    _operator: OperatorGuard,
    Json(body): Json<PasswordBody>,
) -> Result<(), AppError> {
    state.operator_auth.set_password(&body.password).await?;
    let mut config = state.config.write().await;
    config.operator_password_hash = state.operator_auth.password_hash_snapshot().await;
    config.persist(&state.config_path).map_err(AppError::from)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct AuthStatusResponse {
    setup_complete: bool,
}

/// `GET /auth/status`: whether first-time setup has completed.
pub async fn status(State(state): State<AppState>) -> Json<AuthStatusResponse> {
    Json(AuthStatusResponse {
        setup_complete: state.operator_auth.is_set_up().await,
    })
}

/// `GET /auth/check`: whether the presented session is currently valid.
pub async fn check(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    OperatorCookie(token): OperatorCookie,
) -> Json<bool> {
    let Some(token) = token else {
        return Json(false);
    };
    Json(state.operator_auth.validate_session(&token, client_ip).await.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let identity = Arc::new(pclink_core::identity::ServerIdentity::generate().expect("generate"));
        let dir = tempfile::tempdir().expect("tempdir");
        let devices = Arc::new(
            pclink_core::devices::DeviceRegistry::load_or_init(
                &dir.path().join("devices.json"),
                identity.clone(),
            )
            .expect("devices"),
        );
        let config = pclink_core::config::Config::new();
        let transfers = Arc::new(
            pclink_core::transfer::TransferEngine::load_or_init(
                &dir.path().join("transfers"),
                config.transfer.clone(),
            )
            .expect("transfers"),
        );
        AppState::new(
            identity,
            devices,
            Arc::new(pclink_core::pairing::PairingBroker::new(
                5,
                std::time::Duration::from_secs(60),
                100,
            )),
            Arc::new(pclink_core::hub::SessionHub::new()),
            Arc::new(pclink_core::auth::OperatorAuth::new()),
            transfers,
            Arc::new(pclink_core::ratelimit::RateLimiter::new(
                5,
                std::time::Duration::from_secs(900),
                1000,
            )),
            Arc::new(tokio::sync::RwLock::new(config)),
            Arc::new(dir.path().join("config.json")),
            Arc::new(pclink_core::listener::ListenerControl::new()),
        )
    }

    #[tokio::test]
    async fn setup_then_login_round_trips() {
        let state = test_state();
        setup(
            State(state.clone()),
            Json(PasswordBody { password: "hunter22".into() }),
        )
        .await
        .expect("setup");

        let ip: std::net::IpAddr = "127.0.0.1".parse().expect("ip");
        let response = login(
            State(state),
            ClientIp(ip),
            Json(PasswordBody { password: "hunter22".into() }),
        )
        .await
        .expect("login");
        assert!(response.headers().get(SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let state = test_state();
        setup(
            State(state.clone()),
            Json(PasswordBody { password: "hunter22".into() }),
        )
        .await
        .expect("setup");
        let ip: std::net::IpAddr = "127.0.0.1".parse().expect("ip");
        let result = login(State(state), ClientIp(ip), Json(PasswordBody { password: "wrong".into() })).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_setup_is_conflict() {
        let state = test_state();
        setup(
            State(state.clone()),
            Json(PasswordBody { password: "hunter22".into() }),
        )
        .await
        .expect("setup");
        let result = setup(State(state), Json(PasswordBody { password: "again".into() })).await;
        assert!(result.is_err());
    }
}
