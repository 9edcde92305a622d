//! Paired-device listing and revocation (spec.md §4.2, §6, operator-only).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::OperatorGuard;
use crate::state::AppState;
use pclink_core::hub::{EventEnvelope, SubscriberClass};

/// `GET /devices`: list every paired device (spec.md §6).
pub async fn list(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Json<Vec<pclink_core::devices::Device>> {
    Json(state.devices.list().await)
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    device_id: Uuid,
}

/// `POST /devices/revoke`: revoke one device, emitting `device_disconnected`
/// (spec.md §4.2).
///
/// # Errors
///
/// Returns [`AppError::not_found`] if `device_id` is unknown.
pub async fn revoke(
    State(state): State<AppState>,
    _operator: OperatorGuard,
    Json(body): Json<RevokeBody>,
) -> Result<(), AppError> {
    let removed = state
        .devices
        .revoke(body.device_id)
        .await?
        .ok_or_else(|| AppError::not_found("unknown device id"))?;
    state
        .hub
        .publish(
            SubscriberClass::Operator,
            EventEnvelope::new(
                "device_disconnected",
                serde_json::json!({"device_id": removed.id}),
            ),
        )
        .await;
    Ok(())
}

/// `POST /devices/remove-all`: revoke every device at once (spec.md §4.2).
pub async fn remove_all(
    State(state): State<AppState>,
    _operator: OperatorGuard,
) -> Result<Json<usize>, AppError> {
    let count = state.devices.revoke_all().await?;
    state
        .hub
        .publish(
            SubscriberClass::Operator,
            EventEnvelope::new("device_disconnected", serde_json::json!({"all": true})),
        )
        .await;
    Ok(Json(count))
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
    async fn revoke_unknown_device_is_not_found() {
        let state = test_state();
        let ip: std::net::IpAddr = "127.0.0.1".parse().expect("ip");
        let session = state.operator_auth.login(ip).await;
        let guard = OperatorGuard(session);
        let result = revoke(
            State(state),
            guard,
            Json(RevokeBody { device_id: Uuid::new_v4() }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn revoke_all_counts_devices() {
        let state = test_state();
        state
            .devices
            .approve("phone", "ios", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        let ip: std::net::IpAddr = "127.0.0.1".parse().expect("ip");
        let session = state.operator_auth.login(ip).await;
        let guard = OperatorGuard(session);
        let Json(count) = remove_all(State(state), guard).await.expect("remove_all");
        assert_eq!(count, 1);
    }
}
