//! Discovery Beacon: periodic UDP broadcast advertising this host to
//! clients on the local network (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::warn;

/// Magic string identifying a PCLink discovery beacon payload
/// (spec.md §4.5).
pub const BEACON_MAGIC: &str = "PCLINK_DISCOVERY_BEACON_V1";

/// The JSON payload broadcast on every beacon tick (spec.md §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct BeaconPayload {
    /// Always [`BEACON_MAGIC`].
    pub magic: &'static str,
    /// This host's hostname.
    pub hostname: String,
    /// The TLS listener port.
    pub port: u16,
    /// Always `true`: the listener only ever speaks TLS (spec.md §9).
    pub https: bool,
    /// The server certificate's SHA-256 fingerprint.
    pub fingerprint: String,
}

/// Broadcasts [`BeaconPayload`] on UDP `port` every `interval` until
/// `shutdown` fires. Send failures are logged and do not stop the loop
/// (spec.md §4.5: "send failures logged not fatal").
pub async fn run(
    port: u16,
    interval: Duration,
    hostname: String,
    https_port: u16,
    fingerprint: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "discovery beacon: failed to bind broadcast socket");
            return;
        },
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "discovery beacon: failed to enable broadcast");
        return;
    }

    let payload = BeaconPayload {
        magic: BEACON_MAGIC,
        hostname,
        port: https_port,
        https: true,
        fingerprint,
    };
    let Ok(bytes) = serde_json::to_vec(&payload) else {
        warn!("discovery beacon: failed to serialize payload");
        return;
    };
    let bytes = Arc::new(bytes);

    let broadcast_addr = ("255.255.255.255", port);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&bytes, broadcast_addr).await {
                    warn!(error = %e, "discovery beacon: send failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_payload_serializes_with_magic() {
        let payload = BeaconPayload {
            magic: BEACON_MAGIC,
            hostname: "host".into(),
            port: 38080,
            https: true,
            fingerprint: "ab".into(),
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains(BEACON_MAGIC));
        assert!(json.contains("\"https\":true"));
    }
}
