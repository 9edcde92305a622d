//! Thin HTTP client for administrative CLI commands that talk to an
//! already-running `pclink` daemon over its own loopback TLS socket
//! (`status`, `pair`).
//!
//! Certificate pinning (spec.md §4.1 "fingerprint-pinned by clients") is
//! the trust model for *remote* clients validating a fingerprint they
//! scanned off a QR code. This CLI runs as the same local user as the
//! daemon and already has filesystem access to the same data directory
//! the certificate is persisted in, so there's no separate trust
//! bootstrap to perform here: loopback calls accept whatever
//! certificate the locally owned daemon presents.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
}

/// `GET /status` against the local daemon. `None` if it isn't listening
/// or doesn't answer within the timeout.
pub async fn probe_status(port: u16) -> Option<serde_json::Value> {
    let client = client().ok()?;
    let url = format!("https://127.0.0.1:{port}/status");
    client.get(url).send().await.ok()?.json().await.ok()
}

#[derive(Debug, Serialize)]
struct PairingRequestBody<'a> {
    device_name: &'a str,
    platform: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PairingApprovedResponse {
    pub api_key: String,
    pub cert_fingerprint: String,
}

/// `POST /pairing/request`, blocking up to the server's pairing window
/// for an operator decision (spec.md §4.3). The request itself carries
/// no credential; approval is granted or denied by an operator watching
/// the browser UI.
///
/// # Errors
///
/// Returns an error if the daemon isn't reachable, the operator denies
/// the request, or no decision arrives before the server's own timeout.
pub async fn request_pairing(port: u16, device_name: &str) -> anyhow::Result<PairingApprovedResponse> {
    let client = client()?;
    let url = format!("https://127.0.0.1:{port}/pairing/request");
    let response = client
        .post(url)
        .json(&PairingRequestBody { device_name, platform: "cli" })
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("pairing request rejected: HTTP {}", response.status());
    }
    Ok(response.json().await?)
}
