//! Pairing request/decision handlers (spec.md §4.3, §6).

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::extractors::ClientIp;
use crate::middleware::OperatorGuard;
use crate::state::AppState;
use pclink_core::hub::{EventEnvelope, SubscriberClass};
use pclink_core::pairing::PairingDecision;

#[derive(Debug, Deserialize)]
pub struct PairingRequestBody {
    device_name: String,
    platform: String,
}

#[derive(Debug, Serialize)]
pub struct PairingApprovedResponse {
    api_key: String,
    cert_fingerprint: String,
}

/// `POST /pairing/request`: public, rate-limited pairing initiation that
/// blocks up to 60s for an operator decision (spec.md §4.3).
///
/// # Errors
///
/// Returns [`AppError::forbidden`] with `pairing_denied` if the operator
/// denies, [`AppError::timeout`] if no decision arrives in time, or
/// [`AppError::rate_limited`]/`pairing_invalid_name` per
/// [`pclink_core::CoreError`]'s mapping.
pub async fn request(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(body): Json<PairingRequestBody>,
) -> Result<Json<PairingApprovedResponse>, AppError> {
    let hub = state.hub.clone();
    let ticket = state
        .pairing
        .request_notifying(&body.device_name, &body.platform, client_ip, |ticket| {
            let hub = hub.clone();
            let envelope = EventEnvelope::new(
                "pairing_request",
                json!({
                    "pairing_id": ticket.pairing_id,
                    "device_name": ticket.device_name,
                    "platform": ticket.platform,
                    "client_ip": ticket.client_ip.to_string(),
                }),
            );
            tokio::spawn(async move { hub.publish(SubscriberClass::Operator, envelope).await });
        })
        .await?;

    match ticket.decision {
        PairingDecision::Approved => Ok(Json(PairingApprovedResponse {
            api_key: ticket.result_device_key.unwrap_or_default(),
            cert_fingerprint: state.identity.cert_fingerprint.clone(),
        })),
        PairingDecision::Denied => Err(AppError::forbidden("pairing request denied", "pairing_denied")),
        PairingDecision::Pending | PairingDecision::Expired => {
            Err(AppError::timeout("pairing request timed out"))
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct PairingDecisionBody {
    pairing_id: Uuid,
}

/// `POST /pairing/approve`: creates the Device and resolves the blocked
/// request (spec.md §4.2/§4.3).
///
/// # Errors
///
/// Returns [`AppError::not_found`] for an unknown `pairing_id`.
pub async fn approve(
    State(state): State<AppState>,
    _operator: OperatorGuard,
    Json(body): Json<PairingDecisionBody>,
) -> Result<Json<pclink_core::devices::Device>, AppError> {
    let ticket = state
        .pairing
        .get(body.pairing_id)
        .await
        .ok_or_else(|| AppError::not_found("unknown pairing id"))?;

    let device = state
        .devices
        .approve(&ticket.device_name, &ticket.platform, ticket.client_ip)
        .await?;

    state
        .pairing
        .approve(body.pairing_id, device.device_key.clone())
        .await;

    state
        .hub
        .publish(
            SubscriberClass::Operator,
            EventEnvelope::new("device_connected", serde_json::to_value(&device).unwrap_or_default()),
        )
        .await;

    Ok(Json(device))
}

/// `POST /pairing/deny`: resolves the blocked request with `Denied`
/// (spec.md §4.3).
///
/// # Errors
///
/// Returns [`AppError::not_found`] for an unknown `pairing_id`.
pub async fn deny(
    State(state): State<AppState>,
    _operator: OperatorGuard,
    Json(body): Json<PairingDecisionBody>,
) -> Result<(), AppError> {
    state
        .pairing
        .deny(body.pairing_id)
        .await
        .ok_or_else(|| AppError::not_found("unknown pairing id"))?;
    Ok(())
}
