//! Server lifecycle control: start/stop/restart/shutdown the TLS
//! listener (spec.md §4.8, §6, operator-only).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::middleware::OperatorGuard;
use crate::state::AppState;
use pclink_core::listener::ListenerState;

#[derive(Debug, Serialize)]
pub struct ListenerStateResponse {
    state: &'static str,
}

fn response_for(state: ListenerState) -> Json<ListenerStateResponse> {
    Json(ListenerStateResponse {
        state: match state {
            ListenerState::Running => "running",
            ListenerState::Stopped => "stopped",
        },
    })
}

/// `POST /server/start`: request the listener bind and begin serving.
pub async fn start(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<ListenerStateResponse> {
    state.listener.start();
    response_for(state.listener.current())
}

/// `POST /server/stop`: request the listener unbind.
pub async fn stop(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<ListenerStateResponse> {
    state.listener.stop();
    response_for(state.listener.current())
}

/// `POST /server/restart`: stop then start, preserving every other
/// piece of server state (spec.md §4.8).
pub async fn restart(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<ListenerStateResponse> {
    state.listener.restart();
    response_for(state.listener.current())
}

/// `POST /server/shutdown`: request the whole process exit.
pub async fn shutdown(State(state): State<AppState>, _operator: OperatorGuard) {
    state.listener.shutdown();
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

    fn operator_guard(state: &AppState) -> OperatorGuard {
        OperatorGuard(pclink_core::auth::OperatorSession {
            token: "t".into(),
            client_ip: "127.0.0.1".parse().expect("ip"),
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }

    #[tokio::test]
    async fn stop_then_start_round_trips() {
        let state = test_state();
        let guard = operator_guard(&state);
        let Json(resp) = stop(State(state.clone()), guard).await;
        assert_eq!(resp.state, "stopped");
        let guard = operator_guard(&state);
        let Json(resp) = start(State(state), guard).await;
        assert_eq!(resp.state, "running");
    }

    #[tokio::test]
    async fn restart_ends_running() {
        let state = test_state();
        let guard = operator_guard(&state);
        let Json(resp) = restart(State(state), guard).await;
        assert_eq!(resp.state, "running");
    }
}
