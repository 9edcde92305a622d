//! Public liveness and pairing-bootstrap endpoints (spec.md §6 `/status`,
//! `/qr-payload`).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: &'static str,
    setup_complete: bool,
    toggles: pclink_core::config::ServiceToggle,
    extensions_path: Option<String>,
}

/// `GET /status`: public liveness probe plus the current feature-flag
/// snapshot (spec.md §6). `extensions_path` surfaces `PCLINK_EXTENSIONS_PATH`
/// verbatim; this crate never loads or sandboxes what's in it (spec.md §9
/// Open Question).
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = state.config.read().await;
    Json(StatusResponse {
        status: "ok",
        setup_complete: config.setup_complete,
        toggles: config.toggles.clone(),
        extensions_path: std::env::var("PCLINK_EXTENSIONS_PATH").ok(),
    })
}

#[derive(Debug, Serialize)]
pub struct QrPayload {
    ip: String,
    port: u16,
    protocol: &'static str,
    api_key: String,
    cert_fingerprint: String,
}

/// `GET /qr-payload`: pairing bootstrap data, served only after
/// first-time setup completes (spec.md §6).
///
/// # Errors
///
/// Returns [`AppError::not_found`] before setup completes.
pub async fn qr_payload(State(state): State<AppState>) -> Result<Json<QrPayload>, AppError> {
    let config = state.config.read().await;
    if !config.setup_complete {
        return Err(AppError::not_found("setup has not completed"));
    }
    let ip = pclink_core::identity::local_non_virtual_ipv4_addrs()
        .into_iter()
        .next()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(Json(QrPayload {
        ip,
        port: config.listen_port,
        protocol: "https",
        api_key: state.identity.api_key.clone(),
        cert_fingerprint: state.identity.cert_fingerprint.clone(),
    }))
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
    async fn status_reports_setup_incomplete_by_default() {
        let state = test_state();
        let Json(resp) = status(State(state)).await;
        assert!(!resp.setup_complete);
    }

    #[tokio::test]
    async fn qr_payload_rejected_before_setup() {
        let state = test_state();
        assert!(qr_payload(State(state)).await.is_err());
    }

    #[tokio::test]
    async fn qr_payload_served_after_setup() {
        let state = test_state();
        {
            let mut config = state.config.write().await;
            config.setup_complete = true;
        }
        let Json(payload) = qr_payload(State(state.clone())).await.expect("payload");
        assert_eq!(payload.api_key, state.identity.api_key);
    }
}
