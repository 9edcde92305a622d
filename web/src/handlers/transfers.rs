//! Stale-transfer cleanup status/config/execute (spec.md §4.7.5, §6,
//! operator-only).

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::middleware::OperatorGuard;
use crate::state::AppState;
use pclink_core::transfer::cleanup::{run_once, CleanupReport};

#[derive(Debug, Serialize)]
pub struct CleanupStatusResponse {
    stale_threshold_secs: u64,
    active_sessions: usize,
}

/// `GET /transfers/cleanup/status`: current threshold and live session
/// count (spec.md §6).
pub async fn status(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<CleanupStatusResponse> {
    let config = state.config.read().await;
    let active_sessions = state.transfers.list().await.len();
    Json(CleanupStatusResponse {
        stale_threshold_secs: config.transfer.stale_threshold.as_secs(),
        active_sessions,
    })
}

#[derive(Debug, Deserialize)]
pub struct CleanupConfigBody {
    stale_threshold_secs: u64,
}

/// `PATCH /transfers/cleanup/config`: change the staleness threshold
/// persisted to disk. Takes effect for the running process on its next
/// restart, since the Transfer Engine reads its threshold once at
/// construction (spec.md §9 Open Question).
///
/// # Errors
///
/// Returns [`AppError::internal`] if persisting the updated config
/// fails.
pub async fn update_config(
    State(state): State<AppState>,
    _operator: OperatorGuard,
    Json(body): Json<CleanupConfigBody>,
) -> Result<(), AppError> {
    let mut config = state.config.write().await;
    config.transfer.stale_threshold = std::time::Duration::from_secs(body.stale_threshold_secs);
    config.persist(&state.config_path).map_err(AppError::from)?;
    Ok(())
}

/// `POST /transfers/cleanup/execute`: run one cleanup pass immediately
/// (spec.md §4.7.5).
pub async fn execute(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<CleanupReport> {
    Json(run_once(&state.transfers).await)
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

    fn operator_guard() -> OperatorGuard {
        OperatorGuard(pclink_core::auth::OperatorSession {
            token: "t".into(),
            client_ip: "127.0.0.1".parse().expect("ip"),
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }

    #[tokio::test]
    async fn execute_runs_a_cleanup_pass() {
        let state = test_state();
        let Json(report) = execute(State(state), operator_guard()).await;
        assert_eq!(report.inspected, 0);
    }

    #[tokio::test]
    async fn update_config_changes_persisted_threshold() {
        let state = test_state();
        update_config(
            State(state.clone()),
            operator_guard(),
            Json(CleanupConfigBody { stale_threshold_secs: 30 }),
        )
        .await
        .expect("update");
        let Json(status) = status(State(state), operator_guard()).await;
        assert_eq!(status.stale_threshold_secs, 30);
    }
}
