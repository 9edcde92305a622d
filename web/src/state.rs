//! Application state shared across all HTTP handlers.
//!
//! Holds `Arc` handles to every `pclink-core` component plus the loaded
//! [`Config`], and the login-attempt rate limiter that middleware
//! consults ahead of the handler (spec.md §4.8).

use std::sync::Arc;

use pclink_core::auth::OperatorAuth;
use pclink_core::config::Config;
use pclink_core::devices::DeviceRegistry;
use pclink_core::hub::SessionHub;
use pclink_core::identity::ServerIdentity;
use pclink_core::listener::ListenerControl;
use pclink_core::pairing::PairingBroker;
use pclink_core::ratelimit::RateLimiter;
use pclink_core::transfer::TransferEngine;
use tokio::sync::RwLock;

/// Application state shared across all HTTP handlers via `axum::State`.
///
/// Cloning is cheap: every field is an `Arc` (or itself cheaply clonable),
/// matching the donor's convention of state structs holding `Arc<Store<...>>`
/// handles.
#[derive(Clone)]
pub struct AppState {
    /// Server API key + self-signed TLS identity.
    pub identity: Arc<ServerIdentity>,
    /// Paired device bookkeeping and authorization.
    pub devices: Arc<DeviceRegistry>,
    /// Unauthenticated pairing request coordination.
    pub pairing: Arc<PairingBroker>,
    /// Device/operator WebSocket fan-out.
    pub hub: Arc<SessionHub>,
    /// Operator password + session bookkeeping.
    pub operator_auth: Arc<OperatorAuth>,
    /// Resumable upload/download engine.
    pub transfers: Arc<TransferEngine>,
    /// Rate limiter guarding `/auth/login` (spec.md §4.8).
    pub login_limiter: Arc<RateLimiter>,
    /// Live server configuration, behind a lock since `/server/*` and
    /// toggle changes mutate it at runtime.
    pub config: Arc<RwLock<Config>>,
    /// Path to `config.json`, so handlers that mutate `config` can
    /// re-persist it.
    pub config_path: Arc<std::path::PathBuf>,
    /// Listener start/stop/restart/shutdown intent (spec.md §4.8).
    pub listener: Arc<ListenerControl>,
}

impl AppState {
    /// Assemble application state from already-initialized components.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<ServerIdentity>,
        devices: Arc<DeviceRegistry>,
        pairing: Arc<PairingBroker>,
        hub: Arc<SessionHub>,
        operator_auth: Arc<OperatorAuth>,
        transfers: Arc<TransferEngine>,
        login_limiter: Arc<RateLimiter>,
        config: Arc<RwLock<Config>>,
        config_path: Arc<std::path::PathBuf>,
        listener: Arc<ListenerControl>,
    ) -> Self {
        Self {
            identity,
            devices,
            pairing,
            hub,
            operator_auth,
            transfers,
            login_limiter,
            config,
            config_path,
            listener,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let identity = Arc::new(ServerIdentity::generate().expect("generate"));
        let dir = tempfile::tempdir().expect("tempdir");
        let devices = Arc::new(
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity.clone())
                .expect("devices"),
        );
        let config = Config::new();
        let transfers = Arc::new(
            TransferEngine::load_or_init(&dir.path().join("transfers"), config.transfer.clone())
                .expect("transfers"),
        );
        AppState::new(
            identity,
            devices,
            Arc::new(PairingBroker::new(5, std::time::Duration::from_secs(60), 100)),
            Arc::new(SessionHub::new()),
            Arc::new(OperatorAuth::new()),
            transfers,
            Arc::new(RateLimiter::new(5, std::time::Duration::from_secs(900), 1000)),
            Arc::new(RwLock::new(config)),
            Arc::new(dir.path().join("config.json")),
            Arc::new(pclink_core::listener::ListenerControl::new()),
        )
    }

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn test_state_holds_working_components() {
        let state = test_state();
        assert!(!state.operator_auth.is_set_up().await);
    }
}
