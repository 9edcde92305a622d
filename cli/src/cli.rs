//! Command-line surface (spec.md §6 "CLI surface").

use clap::{Parser, Subcommand};

/// PCLink host daemon: pairing, auth, and file transfer over a
/// self-signed TLS listener.
#[derive(Debug, Parser)]
#[command(name = "pclink", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Suppress the browser launch and log to file only, for OS-level
    /// autostart entries.
    #[arg(long, global = true)]
    pub startup: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the foreground (default).
    Start,
    /// Stop an already-running daemon.
    Stop,
    /// Stop then start an already-running daemon.
    Restart,
    /// Report whether a daemon is running and its listener state.
    Status,
    /// Print the tail of the daemon's log file.
    Logs {
        /// Number of trailing lines to print.
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    /// Print the pairing-bootstrap QR payload.
    Qr,
    /// Set the operator password for the first time.
    Setup,
    /// Request pairing against a running daemon as a named device.
    Pair {
        /// Device name to present to the operator for approval.
        #[arg(long, default_value = "pclink-cli")]
        name: String,
    },
}

impl Cli {
    /// The effective subcommand, defaulting to [`Command::Start`].
    #[must_use]
    pub fn command(self) -> (Command, bool) {
        (self.command.unwrap_or(Command::Start), self.startup)
    }
}
