//! Pairing Broker: unauthenticated device pairing requests, operator
//! approval/denial, and the 60-second blocking-wait contract between them
//! (spec.md §3 `PairingTicket`, §4.3).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::PAIRING_TIMEOUT;
use crate::devices::strip_html_unsafe;
use crate::error::CoreError;
use crate::ratelimit::{RateLimitDecision, RateLimiter};

/// A pairing request's current disposition (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairingDecision {
    /// Awaiting an operator decision.
    Pending,
    /// Operator approved; `result_device_key` is set.
    Approved,
    /// Operator denied.
    Denied,
    /// No decision arrived within 60 seconds.
    Expired,
}

/// A pending or resolved pairing request (spec.md §3). Pending tickets
/// are in-memory only and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingTicket {
    /// Unique id for this pairing request.
    pub pairing_id: Uuid,
    /// Client-supplied device name, sanitized at ticket creation.
    pub device_name: String,
    /// Client-reported platform.
    pub platform: String,
    /// Client IP the request arrived from.
    pub client_ip: IpAddr,
    /// When the request was received.
    pub created_at: DateTime<Utc>,
    /// Current state.
    pub decision: PairingDecision,
    /// Set once `Approved`: the new device's credential.
    pub result_device_key: Option<String>,
}

struct PendingEntry {
    ticket: PairingTicket,
    responder: Option<oneshot::Sender<PairingTicket>>,
}

/// Coordinates pairing requests and operator decisions. The blocking-wait
/// HTTP contract (request blocks up to 60s for a decision) is implemented
/// with a `tokio::sync::oneshot` channel per ticket rather than the
/// donor's generic `Store::send_and_wait_for` machinery — same shape,
/// no generic apparatus (see DESIGN.md).
pub struct PairingBroker {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    limiter: RateLimiter,
}

/// Outcome of submitting a pairing request for approval, passed back to
/// the caller that eventually calls [`PairingBroker::approve`].
pub struct ApprovalOutcome {
    /// The resolved ticket, now `Approved` with `result_device_key` set.
    pub ticket: PairingTicket,
}

impl PairingBroker {
    /// Build a broker with the given rate limiter parameters (spec.md
    /// §4.3: 5 requests/min/IP by default).
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration, capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            limiter: RateLimiter::new(max_attempts, window, capacity),
        }
    }

    /// Submit a new pairing request. Rate-limited by IP; a duplicate
    /// `(client_ip, device_name)` pair within the pairing window returns
    /// the existing ticket rather than creating a new one (spec.md §4.3).
    /// Blocks up to `PAIRING_TIMEOUT` awaiting an operator decision.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RateLimited`] if the IP has exceeded the
    /// pairing request limit, or [`CoreError::PairingInvalidName`] if the
    /// sanitized device name is empty.
    pub async fn request(
        &self,
        device_name: &str,
        platform: &str,
        client_ip: IpAddr,
    ) -> Result<PairingTicket, CoreError> {
        self.request_notifying(device_name, platform, client_ip, |_ticket| {})
            .await
    }

    /// Same as [`PairingBroker::request`], but invokes `on_created` with
    /// the freshly created `Pending` ticket before blocking on a
    /// decision. Lets a caller that holds the Session Hub publish
    /// `pairing_request` to operator subscribers (spec.md §4.3) without
    /// this crate depending on the hub type.
    ///
    /// # Errors
    ///
    /// See [`PairingBroker::request`].
    pub async fn request_notifying<F>(
        &self,
        device_name: &str,
        platform: &str,
        client_ip: IpAddr,
        on_created: F,
    ) -> Result<PairingTicket, CoreError>
    where
        F: FnOnce(&PairingTicket),
    {
        let sanitized_name = strip_html_unsafe(device_name);
        if sanitized_name.trim().is_empty() {
            return Err(CoreError::PairingInvalidName);
        }

        match self.limiter.check_and_record(&client_ip.to_string()).await {
            RateLimitDecision::Limited { retry_after_secs } => {
                return Err(CoreError::RateLimited { retry_after_secs });
            },
            RateLimitDecision::Allowed => {},
        }

        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.values().find(|entry| {
            entry.ticket.client_ip == client_ip
                && entry.ticket.device_name == sanitized_name
                && entry.ticket.decision == PairingDecision::Pending
        }) {
            let ticket = existing.ticket.clone();
            drop(pending);
            return self.await_decision(ticket.pairing_id, Some(ticket)).await;
        }

        let ticket = PairingTicket {
            pairing_id: Uuid::new_v4(),
            device_name: sanitized_name,
            platform: platform.to_string(),
            client_ip,
            created_at: Utc::now(),
            decision: PairingDecision::Pending,
            result_device_key: None,
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(
            ticket.pairing_id,
            PendingEntry {
                ticket: ticket.clone(),
                responder: Some(tx),
            },
        );
        drop(pending);
        on_created(&ticket);

        match tokio::time::timeout(PAIRING_TIMEOUT, rx).await {
            Ok(Ok(resolved)) => Ok(resolved),
            Ok(Err(_)) | Err(_) => self.expire(ticket.pairing_id).await,
        }
    }

    async fn await_decision(
        &self,
        pairing_id: Uuid,
        fallback: Option<PairingTicket>,
    ) -> Result<PairingTicket, CoreError> {
        // A duplicate request joins the same ticket's eventual outcome by
        // polling, since the original responder channel is single-consumer.
        let deadline = tokio::time::Instant::now() + PAIRING_TIMEOUT;
        loop {
            {
                let pending = self.pending.lock().await;
                match pending.get(&pairing_id) {
                    Some(entry) if entry.ticket.decision != PairingDecision::Pending => {
                        return Ok(entry.ticket.clone());
                    },
                    Some(_) => {},
                    None => {
                        return fallback.ok_or(CoreError::PairingTimeout);
                    },
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return self.expire(pairing_id).await;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn expire(&self, pairing_id: Uuid) -> Result<PairingTicket, CoreError> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get_mut(&pairing_id) {
            entry.ticket.decision = PairingDecision::Expired;
            entry.responder = None;
        }
        Err(CoreError::PairingTimeout)
    }

    /// Operator approval: resolves the ticket to `Approved` with the
    /// supplied device key and wakes the blocked requester. Idempotent
    /// per `pairing_id` (spec.md §4.3).
    #[must_use]
    pub async fn approve(&self, pairing_id: Uuid, device_key: String) -> Option<PairingTicket> {
        self.resolve(pairing_id, PairingDecision::Approved, Some(device_key))
            .await
    }

    /// Operator denial: resolves the ticket to `Denied` and wakes the
    /// blocked requester. Idempotent per `pairing_id` (spec.md §4.3).
    #[must_use]
    pub async fn deny(&self, pairing_id: Uuid) -> Option<PairingTicket> {
        self.resolve(pairing_id, PairingDecision::Denied, None).await
    }

    async fn resolve(
        &self,
        pairing_id: Uuid,
        decision: PairingDecision,
        device_key: Option<String>,
    ) -> Option<PairingTicket> {
        let mut pending = self.pending.lock().await;
        let entry = pending.get_mut(&pairing_id)?;
        // Already resolved: idempotent, return the existing outcome rather
        // than re-deciding (spec.md §4.3).
        if entry.ticket.decision != PairingDecision::Pending {
            return Some(entry.ticket.clone());
        }
        entry.ticket.decision = decision;
        entry.ticket.result_device_key = device_key;
        let resolved = entry.ticket.clone();
        if let Some(tx) = entry.responder.take() {
            let _ = tx.send(resolved.clone());
        }
        Some(resolved)
    }

    /// Current ticket state for a pairing id, for operator listing UIs.
    pub async fn get(&self, pairing_id: Uuid) -> Option<PairingTicket> {
        self.pending.lock().await.get(&pairing_id).map(|e| e.ticket.clone())
    }
}

/// Marker re-export so callers can hold a broker behind an `Arc` without
/// importing `std::sync::Arc` separately at every call site.
pub type SharedPairingBroker = Arc<PairingBroker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_then_approve_resolves_immediately() {
        let broker = Arc::new(PairingBroker::new(5, Duration::from_secs(60), 100));
        let ip: IpAddr = "127.0.0.1".parse().expect("ip");
        let broker_clone = broker.clone();
        let handle = tokio::spawn(async move { broker_clone.request("Phone", "ios", ip).await });

        // Give the request task a moment to register its pending ticket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pairing_id = {
            let pending = broker.pending.lock().await;
            *pending.keys().next().expect("pending ticket")
        };
        broker.approve(pairing_id, "devicekey".into()).await;

        let ticket = handle.await.expect("join").expect("approved");
        assert_eq!(ticket.decision, PairingDecision::Approved);
        assert_eq!(ticket.result_device_key.as_deref(), Some("devicekey"));
    }

    #[tokio::test]
    async fn request_then_deny_resolves_immediately() {
        let broker = Arc::new(PairingBroker::new(5, Duration::from_secs(60), 100));
        let ip: IpAddr = "127.0.0.1".parse().expect("ip");
        let broker_clone = broker.clone();
        let handle = tokio::spawn(async move { broker_clone.request("Phone", "ios", ip).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let pairing_id = {
            let pending = broker.pending.lock().await;
            *pending.keys().next().expect("pending ticket")
        };
        broker.deny(pairing_id).await;

        let ticket = handle.await.expect("join").expect("denied");
        assert_eq!(ticket.decision, PairingDecision::Denied);
    }

    #[tokio::test]
    async fn rejects_empty_device_name_after_sanitization() {
        let broker = PairingBroker::new(5, Duration::from_secs(60), 100);
        let ip: IpAddr = "127.0.0.1".parse().expect("ip");
        let result = broker.request("<<<>>>", "ios", ip).await;
        assert!(matches!(result, Err(CoreError::PairingInvalidName)));
    }

    #[tokio::test]
    async fn rate_limits_repeated_requests_from_same_ip() {
        let broker = Arc::new(PairingBroker::new(1, Duration::from_secs(60), 100));
        let ip: IpAddr = "10.0.0.1".parse().expect("ip");

        let b1 = broker.clone();
        let h1 = tokio::spawn(async move { b1.request("A", "ios", ip).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pairing_id = {
            let pending = broker.pending.lock().await;
            *pending.keys().next().expect("pending")
        };
        broker.deny(pairing_id).await;
        h1.await.expect("join").ok();

        let result = broker.request("B", "ios", ip).await;
        assert!(matches!(result, Err(CoreError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn approve_is_idempotent() {
        let broker = Arc::new(PairingBroker::new(5, Duration::from_secs(60), 100));
        let ip: IpAddr = "127.0.0.1".parse().expect("ip");
        let broker_clone = broker.clone();
        let handle = tokio::spawn(async move { broker_clone.request("Phone", "ios", ip).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pairing_id = {
            let pending = broker.pending.lock().await;
            *pending.keys().next().expect("pending")
        };
        let first = broker.approve(pairing_id, "key-a".into()).await;
        let second = broker.approve(pairing_id, "key-b".into()).await;
        assert_eq!(
            first.expect("first").result_device_key,
            second.expect("second").result_device_key
        );
        handle.await.expect("join").ok();
    }
}
