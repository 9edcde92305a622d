//! Config Store: server configuration with atomic on-disk persistence.
//!
//! Knobs are grouped the way the donor auth crate grouped its provider
//! configs (`MagicLinkConfig`, `OAuthConfig`, `PasskeyConfig`), each with a
//! `::new()` plus fluent `with_*` builders and a `Default` carrying the
//! concrete defaults spec.md calls out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default TLS listener port (spec.md §4.8).
pub const DEFAULT_LISTEN_PORT: u16 = 38080;
/// Default discovery beacon UDP port (spec.md §4.5).
pub const DEFAULT_DISCOVERY_PORT: u16 = 38099;
/// Default discovery beacon broadcast interval.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
/// Default transfer chunk size (spec.md §3 `TransferSession`).
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;
/// Default staleness threshold for abandoned transfer sessions.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default pairing decision window (spec.md §4.3).
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(60);
/// Default operator session lifetime (spec.md §3 `OperatorSession`).
pub const OPERATOR_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default WebSocket idle timeout (spec.md §5).
pub const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transfer engine configuration: chunking, allow-listed roots, and
/// staleness handling (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per upload chunk.
    pub chunk_size: u64,
    /// Explicit, operator-configured canonical roots transfers may touch.
    /// Never inferred from OS defaults (spec.md §9 Open Question).
    pub allowed_roots: Vec<PathBuf>,
    /// How long an `Active`/`Paused` session may go untouched before a
    /// cleanup pass reaps it as `Stale`.
    #[serde(with = "duration_secs")]
    pub stale_threshold: Duration,
}

impl TransferConfig {
    /// A config with no allow-listed roots; callers must add at least one
    /// before any upload/download will be accepted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            allowed_roots: Vec::new(),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Set the chunk size used for new upload sessions.
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Add an allow-listed root.
    #[must_use]
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.allowed_roots.push(root.into());
        self
    }

    /// Set the staleness threshold used by the cleanup task.
    #[must_use]
    pub const fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery beacon configuration (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// UDP broadcast port.
    pub port: u16,
    /// Interval between beacon broadcasts.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl DiscoveryConfig {
    /// A config using spec.md's literal defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }

    /// Override the broadcast port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the broadcast interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-route/per-IP rate limiting configuration (spec.md §4.3/§4.4/§9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum pairing requests per IP within `pairing_window`.
    pub pairing_max_attempts: u32,
    /// Window for the pairing request limiter.
    #[serde(with = "duration_secs")]
    pub pairing_window: Duration,
    /// Maximum failed logins per IP within `login_window`.
    pub login_max_attempts: u32,
    /// Window for the login-attempt limiter.
    #[serde(with = "duration_secs")]
    pub login_window: Duration,
}

impl RateLimitConfig {
    /// Spec-literal defaults: 5 pairing requests/min/IP, 5 failed
    /// logins/15min/IP (spec.md §4.3/§4.4).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pairing_max_attempts: 5,
            pairing_window: Duration::from_secs(60),
            login_max_attempts: 5,
            login_window: Duration::from_secs(15 * 60),
        }
    }

    /// Override the pairing-request limiter.
    #[must_use]
    pub const fn with_pairing_limit(mut self, max_attempts: u32, window: Duration) -> Self {
        self.pairing_max_attempts = max_attempts;
        self.pairing_window = window;
        self
    }

    /// Override the login-attempt limiter.
    #[must_use]
    pub const fn with_login_limit(mut self, max_attempts: u32, window: Duration) -> Self {
        self.login_max_attempts = max_attempts;
        self.login_window = window;
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Named capability toggles (spec.md §3 `ServiceToggle`). Every field
/// defaults to `false` except none are on by default, per spec.md the
/// terminal toggle defaults off like the rest; operators opt in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceToggle {
    /// Remote terminal access. Off by default (spec.md §3).
    pub terminal: bool,
    /// File browser surface.
    pub file_browser: bool,
    /// Remote input injection.
    pub input: bool,
    /// Media control/streaming.
    pub media: bool,
    /// Clipboard access.
    pub clipboard: bool,
    /// Screen capture/mirroring.
    pub screen: bool,
    /// Power control (sleep/shutdown/restart).
    pub power: bool,
    /// Third-party extensions.
    pub extensions: bool,
}

impl ServiceToggle {
    /// Every capability off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            terminal: false,
            file_browser: false,
            input: false,
            media: false,
            clipboard: false,
            screen: false,
            power: false,
            extensions: false,
        }
    }

    /// Look up whether the named toggle is enabled. Returns `None` for an
    /// unknown name so callers can distinguish "off" from "no such toggle".
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "terminal" => Some(self.terminal),
            "file_browser" => Some(self.file_browser),
            "input" => Some(self.input),
            "media" => Some(self.media),
            "clipboard" => Some(self.clipboard),
            "screen" => Some(self.screen),
            "power" => Some(self.power),
            "extensions" => Some(self.extensions),
            _ => None,
        }
    }
}

impl Default for ServiceToggle {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level server configuration, persisted as `config.json` under the
/// per-user data directory (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// TLS listener port.
    pub listen_port: u16,
    /// Discovery beacon settings.
    pub discovery: DiscoveryConfig,
    /// Transfer engine settings.
    pub transfer: TransferConfig,
    /// Rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Capability toggles.
    pub toggles: ServiceToggle,
    /// Whether first-time setup (operator password + initial config) has
    /// completed. Gates the discovery beacon and `/qr-payload`
    /// (spec.md §4.5/§6).
    pub setup_complete: bool,
    /// Argon2 hash of the operator password, persisted so a restart
    /// doesn't force operators through setup again (spec.md §6 persisted
    /// state layout: "operator password hash + salt").
    pub operator_password_hash: Option<String>,
}

impl Config {
    /// A config with spec-literal defaults and no allow-listed roots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            discovery: DiscoveryConfig::new(),
            transfer: TransferConfig::new(),
            rate_limit: RateLimitConfig::new(),
            toggles: ServiceToggle::new(),
            setup_complete: false,
            operator_password_hash: None,
        }
    }

    /// Override the TLS listener port.
    #[must_use]
    pub const fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Validate cross-field invariants that can't be expressed in types
    /// alone. A `Configuration` error here is fatal at startup
    /// (spec.md §7).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if the chunk size is zero or
    /// no allow-listed transfer roots are configured.
    pub fn validate(&self) -> CoreResult<()> {
        if self.transfer.chunk_size == 0 {
            return Err(CoreError::Configuration(
                "transfer.chunk_size must be positive".into(),
            ));
        }
        if self.transfer.allowed_roots.is_empty() {
            return Err(CoreError::Configuration(
                "transfer.allowed_roots must name at least one root".into(),
            ));
        }
        Ok(())
    }

    /// Load `config.json` from `path`, or create it with defaults (minus
    /// `allowed_roots`, which callers must add before the transfer engine
    /// will accept anything) if it doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if the file exists but is not
    /// valid JSON, or if persisting a freshly created default fails.
    pub fn load_or_init(path: &Path) -> CoreResult<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Configuration(format!("invalid config.json: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::new();
                config.persist(path)?;
                Ok(config)
            },
            Err(e) => Err(CoreError::Configuration(format!(
                "cannot read config.json: {e}"
            ))),
        }
    }

    /// Persist this config via write-to-temp-then-rename, matching the
    /// atomic-write pattern used by the Credential Store and Device
    /// Registry (spec.md §4.1/§4.2).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] on any filesystem failure.
    pub fn persist(&self, path: &Path) -> CoreResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CoreError::Configuration(format!("cannot serialize config: {e}")))?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(path)
            .map_err(|e| CoreError::Io(e.to_string()))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::new();
        assert_eq!(cfg.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(cfg.discovery.port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!cfg.toggles.terminal);
        assert!(!cfg.setup_complete);
    }

    #[test]
    fn validate_rejects_empty_allowed_roots() {
        let cfg = Config::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_with_root() {
        let cfg = Config::new().with_listen_port(9000);
        let cfg = Config {
            transfer: cfg.transfer.with_allowed_root("/tmp/pclink"),
            ..cfg
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.listen_port, 9000);
    }

    #[test]
    fn load_or_init_creates_then_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let first = Config::load_or_init(&path).expect("init");
        assert!(path.exists());
        let second = Config::load_or_init(&path).expect("reload");
        assert_eq!(first, second);
    }

    #[test]
    fn load_or_init_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"not json").expect("write");
        assert!(Config::load_or_init(&path).is_err());
    }

    #[test]
    fn service_toggle_get_unknown_name() {
        let toggles = ServiceToggle::new();
        assert_eq!(toggles.get("terminal"), Some(false));
        assert_eq!(toggles.get("nonexistent"), None);
    }
}
