//! Per-user data directory resolution (spec.md §6 "persisted state
//! layout", `PCLINK_DATA_DIR`).

use std::path::PathBuf;

use directories::ProjectDirs;

/// Resolve the data directory PCLink persists `config.json`, identity
/// material, the device registry, transfer staging, and logs under.
///
/// `PCLINK_DATA_DIR` overrides the platform default unconditionally
/// (spec.md §6 environment variables). Without it, falls back to the
/// OS-conventional data directory for `dev.pclink.pclink`.
///
/// # Errors
///
/// Returns an error if no override is set and the platform gives no
/// data directory (e.g. `$HOME` unset on a POSIX system).
pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("PCLINK_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let dirs = ProjectDirs::from("dev", "pclink", "pclink")
        .ok_or_else(|| anyhow::anyhow!("could not determine a home directory for this platform"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// The optional extensions directory, read but never loaded or
/// sandboxed by this crate (spec.md §9 Open Question: extensions are
/// out of core scope).
#[must_use]
pub fn extensions_dir() -> Option<PathBuf> {
    std::env::var_os("PCLINK_EXTENSIONS_PATH").map(PathBuf::from)
}

/// `logs/pclink.log` under the data directory.
#[must_use]
pub fn log_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs").join("pclink.log")
}

/// `config.json` under the data directory.
#[must_use]
pub fn config_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("config.json")
}

/// `devices.json` under the data directory.
#[must_use]
pub fn devices_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("devices.json")
}

/// `transfers/` under the data directory.
#[must_use]
pub fn transfers_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("transfers")
}

/// The single-instance advisory lock file.
#[must_use]
pub fn lock_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(".pclink.lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        std::env::set_var("PCLINK_DATA_DIR", "/tmp/pclink-test-data-dir");
        let dir = data_dir().expect("dir");
        assert_eq!(dir, PathBuf::from("/tmp/pclink-test-data-dir"));
        std::env::remove_var("PCLINK_DATA_DIR");
    }

    #[test]
    fn derived_paths_nest_under_data_dir() {
        let base = PathBuf::from("/tmp/pclink-test");
        assert_eq!(config_file(&base), base.join("config.json"));
        assert_eq!(lock_file(&base), base.join(".pclink.lock"));
    }
}
