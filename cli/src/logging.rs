//! Tracing initialization: stderr + stdout by default, file-only under
//! `--startup` (spec.md §6 CLI surface: "`--startup` suppresses browser
//! launch and logs to file only").
//!
//! Grounded in the donor example's `tracing_subscriber::registry()` +
//! `EnvFilter` + `fmt::layer()` init shape.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `startup` selects file-only output to `<data_dir>/logs/pclink.log`
/// (rotated daily); otherwise logs go to stdout as well, which is the
/// mode an operator running `pclink` interactively expects.
///
/// The returned [`WorkerGuard`] must be held for the process lifetime;
/// dropping it early truncates buffered log lines in the file-only
/// path.
///
/// # Errors
///
/// Returns an error if `<data_dir>/logs` can't be created.
pub fn init(data_dir: &Path, startup: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if startup {
        let log_dir = data_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "pclink.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        Ok(None)
    }
}
