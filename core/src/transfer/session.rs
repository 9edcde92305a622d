//! Transfer session data model (spec.md §3 `TransferSession`).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upload or download (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client is sending bytes to the server.
    Upload,
    /// Client is receiving bytes from the server.
    Download,
}

/// A transfer session's lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Actively accepting chunks / being read from.
    Active,
    /// Paused after a transient I/O error; resumable.
    Paused,
    /// All bytes received/sent and finalized.
    Completed,
    /// Explicitly cancelled by the client or operator.
    Cancelled,
    /// Reaped by the cleanup task for inactivity.
    Stale,
}

impl TransferState {
    /// `true` for any state that will never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Stale
        )
    }
}

/// What to do when the target path already exists at finalize time
/// (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail with `conflict_exists` rather than touch the existing file.
    Abort,
    /// Replace the existing file.
    Overwrite,
    /// Write alongside the existing file under a disambiguated name.
    KeepBoth,
}

/// A resumable file transfer session (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    /// Unique transfer id.
    pub transfer_id: Uuid,
    /// Upload or download.
    pub direction: Direction,
    /// The device that owns this session.
    pub owner_device_id: Uuid,
    /// Canonicalized destination (uploads) or source (downloads) path.
    pub target_path: PathBuf,
    /// Declared total size in bytes.
    pub total_size: u64,
    /// Bytes per chunk for this session.
    pub chunk_size: u64,
    /// Monotonically increasing count of bytes received (uploads).
    pub received_bytes: u64,
    /// Monotonically increasing count of bytes sent (downloads).
    pub sent_bytes: u64,
    /// Current lifecycle state.
    pub state: TransferState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time this session was touched by any operation.
    pub last_activity: DateTime<Utc>,
    /// How to resolve a destination-path conflict at finalize time.
    pub conflict_policy: ConflictPolicy,
    /// Set when `Paused` due to a transient I/O error (spec.md §4.7.6).
    pub recorded_error: Option<String>,
    /// Indices durably written so far. Persisted so a restart can rebuild
    /// the in-memory [`super::ChunkTable`] exactly rather than forgetting
    /// which chunks already landed (spec.md §4.7.1 resumability).
    #[serde(default)]
    pub written_chunks: Vec<u64>,
}

impl TransferSession {
    /// Path the staging file for an in-progress upload lives at, derived
    /// from the transfer id so restarts can relocate it deterministically
    /// (spec.md §4.7.1).
    #[must_use]
    pub fn staging_path(&self, transfers_dir: &std::path::Path) -> PathBuf {
        transfers_dir.join(format!("{}.staging", self.transfer_id))
    }

    /// Path the on-disk catalog entry for this session lives at.
    #[must_use]
    pub fn meta_path(&self, transfers_dir: &std::path::Path) -> PathBuf {
        transfers_dir.join(format!("{}.meta", self.transfer_id))
    }

    /// `true` if every declared byte has arrived (uploads only).
    #[must_use]
    pub const fn is_fully_received(&self) -> bool {
        self.received_bytes >= self.total_size
    }

    /// Number of chunks this session is divided into.
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size.max(1))
    }
}
