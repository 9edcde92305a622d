//! Operator sessions and password handling (spec.md §3 `OperatorSession`,
//! §4.4, §9).

use std::collections::HashMap;
use std::net::IpAddr;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::OPERATOR_SESSION_TTL;
use crate::error::CoreError;

/// An authenticated operator session bound to an HTTP-only cookie
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorSession {
    /// Opaque bearer token, set as an HTTP-only cookie.
    pub token: String,
    /// IP the session was created from; the session is bound to this IP
    /// (spec.md §3 `bound_ip`).
    pub client_ip: IpAddr,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiration time, 24h from creation by default (spec.md §3).
    pub expires_at: DateTime<Utc>,
}

impl OperatorSession {
    fn new(client_ip: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            token: generate_token(),
            client_ip,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(OPERATOR_SESSION_TTL)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    /// `true` if this session is still within its expiry window.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Result of classifying a presented credential (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialClass {
    /// Presented via `X-API-Key` header: a device or the server itself.
    Device(Uuid),
    /// Presented via operator session cookie.
    Operator,
}

/// Holds the operator's password hash and live sessions. Password
/// hashing uses argon2 (memory-hard, per-password salt stored alongside
/// the hash) per spec.md §9.
pub struct OperatorAuth {
    password_hash: RwLock<Option<String>>,
    sessions: RwLock<HashMap<String, OperatorSession>>,
}

impl OperatorAuth {
    /// Construct with no password set yet (first-time setup pending).
    #[must_use]
    pub fn new() -> Self {
        Self {
            password_hash: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Construct from a previously persisted argon2 hash, or with no
    /// password set if `hash` is `None` (spec.md §6 `config.json` carries
    /// "operator password hash + salt" across restarts).
    #[must_use]
    pub fn from_hash(hash: Option<String>) -> Self {
        Self {
            password_hash: RwLock::new(hash),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot the current password hash for persistence into
    /// `config.json`.
    pub async fn password_hash_snapshot(&self) -> Option<String> {
        self.password_hash.read().await.clone()
    }

    /// `true` once an operator password has been set (spec.md §6
    /// `/auth/setup`).
    pub async fn is_set_up(&self) -> bool {
        self.password_hash.read().await.is_some()
    }

    /// Hash and store a new operator password, overwriting any existing
    /// one (used by both `/auth/setup` and `/auth/change-password`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::internal`] if hashing fails.
    pub async fn set_password(&self, password: &str) -> Result<(), CoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| CoreError::internal())?
            .to_string();
        *self.password_hash.write().await = Some(hash);
        Ok(())
    }

    /// Verify a presented password in constant time relative to a
    /// correct guess (argon2's verifier is itself constant-time on the
    /// hash comparison).
    pub async fn verify_password(&self, password: &str) -> bool {
        let guard = self.password_hash.read().await;
        let Some(stored) = guard.as_deref() else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Create and store a new operator session for `client_ip`.
    pub async fn login(&self, client_ip: IpAddr) -> OperatorSession {
        let session = OperatorSession::new(client_ip);
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Validate a session token, checking expiry and IP binding
    /// (spec.md §3 `bound_ip`). Returns `None` if the token is unknown,
    /// expired, or presented from a different IP.
    pub async fn validate_session(&self, token: &str, client_ip: IpAddr) -> Option<OperatorSession> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(token)?;
        if !session.is_active(Utc::now()) || session.client_ip != client_ip {
            return None;
        }
        Some(session.clone())
    }

    /// Destroy a session (`/auth/logout`).
    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }
}

impl Default for OperatorAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().expect("ip")
    }

    #[tokio::test]
    async fn set_and_verify_password() {
        let auth = OperatorAuth::new();
        assert!(!auth.is_set_up().await);
        auth.set_password("correct horse battery staple").await.expect("hash");
        assert!(auth.is_set_up().await);
        assert!(auth.verify_password("correct horse battery staple").await);
        assert!(!auth.verify_password("wrong").await);
    }

    #[tokio::test]
    async fn login_then_validate_session() {
        let auth = OperatorAuth::new();
        let session = auth.login(ip()).await;
        let validated = auth.validate_session(&session.token, ip()).await;
        assert!(validated.is_some());
    }

    #[tokio::test]
    async fn session_rejected_from_different_ip() {
        let auth = OperatorAuth::new();
        let session = auth.login(ip()).await;
        let other_ip: IpAddr = "10.0.0.5".parse().expect("ip");
        assert!(auth.validate_session(&session.token, other_ip).await.is_none());
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let auth = OperatorAuth::new();
        let session = auth.login(ip()).await;
        auth.logout(&session.token).await;
        assert!(auth.validate_session(&session.token, ip()).await.is_none());
    }
}
