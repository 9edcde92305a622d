//! Route table wiring every handler to its path, method, and
//! per-route middleware (spec.md §4.8, §6).
//!
//! Auth and service-toggle checks are applied per-handler via
//! extractors (`DeviceAuth`, `OperatorGuard`) and
//! [`crate::middleware::require_toggle`] rather than a global `tower`
//! layer, since which credential class (or none) a route needs varies
//! route by route. Only the two genuinely cross-cutting concerns,
//! correlation-id injection and the `/auth/login` rate limiter, are
//! applied as `tower` layers here (spec.md §4.8 "request-id injection →
//! rate limiter (login only) → auth → service-toggle check → handler").

use axum::routing::{delete, get, patch, post, put};
use axum::Router;

use crate::handlers::{auth, devices, files, pairing, server, status, transfers, ws};
use crate::middleware::{correlation_id_layer, login_rate_limit_layer};
use crate::state::AppState;

/// Build the complete application router over `state`.
#[must_use]
pub fn build(state: AppState) -> Router {
    let login_route = Router::new()
        .route("/auth/login", post(auth::login))
        .layer(login_rate_limit_layer(state.clone()));

    Router::new()
        .route("/status", get(status::status))
        .route("/qr-payload", get(status::qr_payload))
        .route("/pairing/request", post(pairing::request))
        .route("/pairing/approve", post(pairing::approve))
        .route("/pairing/deny", post(pairing::deny))
        .route("/devices", get(devices::list))
        .route("/devices/revoke", post(devices::revoke))
        .route("/devices/remove-all", post(devices::remove_all))
        .route("/auth/setup", post(auth::setup))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/change-password", post(auth::change_password))
        .route("/auth/status", get(auth::status))
        .route("/auth/check", get(auth::check))
        .route("/files/upload", post(files::init_upload))
        .route("/files/upload/:id/:chunk_index", put(files::write_chunk))
        .route("/files/upload/:id/pause", post(files::pause_upload))
        .route("/files/upload/:id/resume", post(files::resume_upload))
        .route("/files/upload/:id", delete(files::cancel_upload))
        .route("/files/*path", put(files::put_direct))
        .route("/files/download/*path", get(files::download))
        .route("/files/stream", get(files::stream))
        .route("/ws", get(ws::device_ws))
        .route("/ws/ui", get(ws::operator_ws))
        .route("/server/start", post(server::start))
        .route("/server/stop", post(server::stop))
        .route("/server/restart", post(server::restart))
        .route("/server/shutdown", post(server::shutdown))
        .route("/transfers/cleanup/status", get(transfers::status))
        .route("/transfers/cleanup/config", patch(transfers::update_config))
        .route("/transfers/cleanup/execute", post(transfers::execute))
        .merge(login_route)
        .layer(correlation_id_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
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
        let mut config = pclink_core::config::Config::new();
        config.transfer = config
            .transfer
            .with_allowed_root(dir.path().to_path_buf());
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
    async fn status_route_is_public() {
        let app = build(test_state());
        let server = TestServer::new(app).expect("server");
        let response = server.get("/status").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn devices_route_requires_operator_session() {
        let app = build(test_state());
        let server = TestServer::new(app).expect("server");
        let response = server.get("/devices").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }
}
