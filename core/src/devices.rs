//! Device Registry: paired-device bookkeeping, authorization, and
//! revocation (spec.md §3 `Device`, §4.2).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::identity::ServerIdentity;

/// A paired device (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Stable device identifier.
    pub id: Uuid,
    /// Operator/user-supplied display name, HTML-unsafe characters
    /// stripped at approval time (spec.md §3/§4.4).
    pub name: String,
    /// Client-reported platform string.
    pub platform: String,
    /// Last-known client IP.
    pub ip: IpAddr,
    /// 128-bit per-device credential, unique across the registry.
    pub device_key: String,
    /// When this device was approved.
    pub approved_at: DateTime<Utc>,
    /// Last time this device authenticated a request.
    pub last_seen: DateTime<Utc>,
}

/// Why a presented credential failed to authorize (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The credential matched a known, approved device.
    Device(Uuid),
    /// The credential matched the server's own API key.
    Server,
}

/// Classification of an authorization failure (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential presented.
    #[error("missing credential")]
    Missing,
    /// Credential belonged to a device that has since been revoked.
    #[error("revoked credential")]
    Revoked,
    /// Credential does not match any known device or the server key.
    #[error("invalid credential")]
    Invalid,
}

#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    devices: Vec<Device>,
    /// Device keys of devices revoked since the registry was created, kept
    /// so `authorize` can distinguish `Revoked` from `Invalid` (spec.md
    /// §4.2, P7) even after the `Device` itself is gone.
    #[serde(default)]
    revoked_keys: Vec<String>,
}

/// The Device Registry: tracks paired devices, authorizes requests by
/// device key or the server API key, and persists itself as a
/// full-rewrite `devices.json` (spec.md §4.2).
pub struct DeviceRegistry {
    path: PathBuf,
    identity: Arc<ServerIdentity>,
    devices: RwLock<HashMap<Uuid, Device>>,
    revoked_keys: RwLock<HashSet<String>>,
}

impl DeviceRegistry {
    /// Load `devices.json` from `path`, or start empty if it doesn't
    /// exist. A corrupt file fails startup loudly (spec.md §4.2).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if the file exists but isn't
    /// valid JSON.
    pub fn load_or_init(path: &Path, identity: Arc<ServerIdentity>) -> CoreResult<Self> {
        let (devices, revoked_keys) = match std::fs::read(path) {
            Ok(bytes) => {
                let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    CoreError::Configuration(format!("devices.json is corrupt: {e}"))
                })?;
                let devices = snapshot
                    .devices
                    .into_iter()
                    .map(|d| (d.id, d))
                    .collect::<HashMap<_, _>>();
                let revoked_keys = snapshot.revoked_keys.into_iter().collect::<HashSet<_>>();
                (devices, revoked_keys)
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashMap::new(), HashSet::new()),
            Err(e) => return Err(CoreError::Io(e.to_string())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            identity,
            devices: RwLock::new(devices),
            revoked_keys: RwLock::new(revoked_keys),
        })
    }

    /// Authorize a presented credential. Checks the server API key first
    /// (constant-time), then every device key (also constant-time),
    /// updating `last_seen` on success. The server key's use is reported
    /// distinctly from a device's for audit purposes (spec.md §4.2).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] classifying why the credential was rejected.
    pub async fn authorize(&self, presented_key: &str) -> Result<AuthOutcome, AuthError> {
        if presented_key.is_empty() {
            return Err(AuthError::Missing);
        }
        if self.identity.matches_api_key(presented_key) {
            return Ok(AuthOutcome::Server);
        }
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            if constant_time_eq::constant_time_eq(
                device.device_key.as_bytes(),
                presented_key.as_bytes(),
            ) {
                device.last_seen = Utc::now();
                return Ok(AuthOutcome::Device(device.id));
            }
        }
        drop(devices);

        let revoked = self.revoked_keys.read().await;
        for key in revoked.iter() {
            if constant_time_eq::constant_time_eq(key.as_bytes(), presented_key.as_bytes()) {
                return Err(AuthError::Revoked);
            }
        }
        Err(AuthError::Invalid)
    }

    /// Approve a pending pairing request into a new `Device`, emitting no
    /// event itself — the caller (Pairing Broker) publishes
    /// `device_connected` via the Session Hub (spec.md §4.2/§4.3).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if persisting the updated registry fails.
    pub async fn approve(
        &self,
        name: &str,
        platform: &str,
        ip: IpAddr,
    ) -> CoreResult<Device> {
        let device = Device {
            id: Uuid::new_v4(),
            name: strip_html_unsafe(name),
            platform: platform.to_string(),
            ip,
            device_key: generate_device_key(),
            approved_at: Utc::now(),
            last_seen: Utc::now(),
        };
        let mut devices = self.devices.write().await;
        devices.insert(device.id, device.clone());
        let snapshot = RegistrySnapshot {
            devices: devices.values().cloned().collect(),
            revoked_keys: self.revoked_keys.read().await.iter().cloned().collect(),
        };
        drop(devices);
        self.persist(&snapshot)?;
        Ok(device)
    }

    /// Revoke a single device, removing it from the registry atomically
    /// and tombstoning its key so a later `authorize` call reports
    /// `Revoked` rather than `Invalid` (spec.md §4.2, P7).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if persisting the updated registry fails.
    pub async fn revoke(&self, device_id: Uuid) -> CoreResult<Option<Device>> {
        let mut devices = self.devices.write().await;
        let removed = devices.remove(&device_id);
        if let Some(device) = &removed {
            self.revoked_keys.write().await.insert(device.device_key.clone());
            let snapshot = RegistrySnapshot {
                devices: devices.values().cloned().collect(),
                revoked_keys: self.revoked_keys.read().await.iter().cloned().collect(),
            };
            drop(devices);
            self.persist(&snapshot)?;
        }
        Ok(removed)
    }

    /// Revoke every device at once, tombstoning each key (spec.md §4.2
    /// `revoke_all`, P7).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if persisting the cleared registry fails.
    pub async fn revoke_all(&self) -> CoreResult<usize> {
        let mut devices = self.devices.write().await;
        let count = devices.len();
        let keys: Vec<String> = devices.values().map(|d| d.device_key.clone()).collect();
        devices.clear();
        drop(devices);

        let mut revoked = self.revoked_keys.write().await;
        revoked.extend(keys);
        let snapshot = RegistrySnapshot {
            devices: Vec::new(),
            revoked_keys: revoked.iter().cloned().collect(),
        };
        drop(revoked);
        self.persist(&snapshot)?;
        Ok(count)
    }

    /// List every currently registered device.
    pub async fn list(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Look up a device by id.
    pub async fn get(&self, device_id: Uuid) -> Option<Device> {
        self.devices.read().await.get(&device_id).cloned()
    }

    fn persist(&self, snapshot: &RegistrySnapshot) -> CoreResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| CoreError::Configuration(format!("cannot serialize devices: {e}")))?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&self.path)
            .map_err(|e| CoreError::Io(e.to_string()))?;
        Ok(())
    }
}

fn generate_device_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Strip characters that would be unsafe to render as HTML from a
/// device name (spec.md §3: "HTML-unsafe stripped").
#[must_use]
pub fn strip_html_unsafe(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '&' | '\0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Arc<ServerIdentity> {
        Arc::new(ServerIdentity::generate().expect("generate"))
    }

    #[test]
    fn strips_html_unsafe_characters() {
        assert_eq!(strip_html_unsafe("<script>alert('x')</script>"), "scriptalert(x)/script");
        assert_eq!(strip_html_unsafe("My Phone"), "My Phone");
    }

    #[tokio::test]
    async fn approve_then_authorize_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity())
                .expect("load");
        let device = registry
            .approve("Phone", "android", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        let outcome = registry.authorize(&device.device_key).await.expect("auth");
        assert_eq!(outcome, AuthOutcome::Device(device.id));
    }

    #[tokio::test]
    async fn server_api_key_authorizes_distinctly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = identity();
        let registry =
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity.clone())
                .expect("load");
        let outcome = registry.authorize(&identity.api_key).await.expect("auth");
        assert_eq!(outcome, AuthOutcome::Server);
    }

    #[tokio::test]
    async fn revoke_removes_device_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        let registry = DeviceRegistry::load_or_init(&path, identity()).expect("load");
        let device = registry
            .approve("Phone", "android", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        registry.revoke(device.id).await.expect("revoke");
        assert_eq!(
            registry.authorize(&device.device_key).await,
            Err(AuthError::Revoked)
        );

        let identity2 = identity();
        let reloaded = DeviceRegistry::load_or_init(&path, identity2).expect("reload");
        assert!(reloaded.get(device.id).await.is_none());
    }

    #[tokio::test]
    async fn authorize_rejects_unknown_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity())
                .expect("load");
        assert_eq!(
            registry.authorize("00000000000000000000000000000000").await,
            Err(AuthError::Invalid)
        );
        assert_eq!(registry.authorize("").await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn revoke_all_clears_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity())
                .expect("load");
        registry
            .approve("A", "ios", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        registry
            .approve("B", "ios", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        let removed = registry.revoke_all().await.expect("revoke_all");
        assert_eq!(removed, 2);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn revoked_device_key_is_distinguished_from_unknown_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            DeviceRegistry::load_or_init(&dir.path().join("devices.json"), identity())
                .expect("load");
        let device = registry
            .approve("Phone", "android", "127.0.0.1".parse().expect("ip"))
            .await
            .expect("approve");
        registry.revoke(device.id).await.expect("revoke");

        assert_eq!(
            registry.authorize(&device.device_key).await,
            Err(AuthError::Revoked)
        );
        assert_eq!(
            registry.authorize("never-issued-key").await,
            Err(AuthError::Invalid)
        );
    }
}
