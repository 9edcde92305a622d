//! Transfer Engine: resumable chunked uploads, range-capable downloads,
//! and stale-session cleanup (spec.md §4.7).

pub mod chunk;
pub mod cleanup;
pub mod path_safety;
pub mod session;

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use chunk::ChunkTable;
pub use cleanup::CleanupReport;
pub use session::{ConflictPolicy, Direction, TransferSession, TransferState};

use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};

/// Owns the on-disk transfer catalog (`transfers/<id>.meta` +
/// `.staging`), in-memory chunk tables, and the allow-list/chunk-size
/// policy sessions are created under (spec.md §4.7.1).
pub struct TransferEngine {
    transfers_dir: PathBuf,
    config: TransferConfig,
    catalog: RwLock<HashMap<Uuid, TransferSession>>,
    chunk_tables: RwLock<HashMap<Uuid, Arc<ChunkTable>>>,
}

impl TransferEngine {
    /// Load the on-disk catalog under `transfers_dir`, reconstructing
    /// `Active`/`Paused` sessions into memory (with empty chunk tables,
    /// rebuilt lazily from bytes already on the staging file's length).
    /// `Completed`/`Cancelled` entries left behind by an unclean shutdown
    /// are removed (spec.md §4.7.1).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the transfers directory cannot be
    /// created or read.
    pub fn load_or_init(transfers_dir: &Path, config: TransferConfig) -> CoreResult<Self> {
        std::fs::create_dir_all(transfers_dir)?;
        let mut catalog = HashMap::new();
        let mut chunk_tables = HashMap::new();
        for entry in std::fs::read_dir(transfers_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let Ok(session) = serde_json::from_slice::<TransferSession>(&bytes) else {
                continue;
            };
            if session.state.is_terminal() {
                let _ = std::fs::remove_file(&path);
                let _ = std::fs::remove_file(session.staging_path(transfers_dir));
                continue;
            }
            let table = ChunkTable::from_written(&session.written_chunks);
            chunk_tables.insert(session.transfer_id, Arc::new(table));
            catalog.insert(session.transfer_id, session);
        }
        Ok(Self {
            transfers_dir: transfers_dir.to_path_buf(),
            config,
            catalog: RwLock::new(catalog),
            chunk_tables: RwLock::new(chunk_tables),
        })
    }

    /// Begin a resumable upload: validates `requested_path` against the
    /// allow-list, chooses a staging location, and records a new `Active`
    /// session (spec.md §4.7.2 `POST /files/upload`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathForbidden`]/[`CoreError::PathInvalid`] if
    /// the path fails safety checks, or [`CoreError::Io`] on persistence
    /// failure.
    pub async fn init_upload(
        &self,
        owner_device_id: Uuid,
        requested_path: &Path,
        total_size: u64,
        conflict_policy: ConflictPolicy,
    ) -> CoreResult<TransferSession> {
        let target_path = path_safety::resolve(requested_path, &self.config.allowed_roots)?;
        if matches!(conflict_policy, ConflictPolicy::Abort) && target_path.exists() {
            return Err(CoreError::ConflictExists);
        }

        let now = Utc::now();
        let session = TransferSession {
            transfer_id: Uuid::new_v4(),
            direction: Direction::Upload,
            owner_device_id,
            target_path,
            total_size,
            chunk_size: self.config.chunk_size,
            received_bytes: 0,
            sent_bytes: 0,
            state: TransferState::Active,
            created_at: now,
            last_activity: now,
            conflict_policy,
            recorded_error: None,
            written_chunks: Vec::new(),
        };

        let staging = session.staging_path(&self.transfers_dir);
        std::fs::File::create(&staging)?.set_len(total_size)?;

        self.catalog.write().await.insert(session.transfer_id, session.clone());
        self.chunk_tables
            .write()
            .await
            .insert(session.transfer_id, Arc::new(ChunkTable::new()));
        self.persist(&session)?;
        Ok(session)
    }

    /// Write one chunk. Idempotent: a retried chunk index that's already
    /// durable is a no-op that still returns the current
    /// `received_bytes` (spec.md §4.7.2 `PUT /files/upload/{id}/{chunk}`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChunkOutOfRange`],
    /// [`CoreError::TransferPaused`]/[`CoreError::TransferCancelled`]/
    /// [`CoreError::TransferStale`] if the session can't accept writes,
    /// or [`CoreError::Io`] (after the session is moved to `Paused`) on a
    /// transient filesystem error.
    pub async fn write_chunk(
        &self,
        transfer_id: Uuid,
        chunk_index: u64,
        bytes: &[u8],
    ) -> CoreResult<u64> {
        let total_chunks = {
            let catalog = self.catalog.read().await;
            let session = catalog.get(&transfer_id).ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
            ensure_writable(session)?;
            if chunk_index >= session.total_chunks() {
                return Err(CoreError::ChunkOutOfRange);
            }
            session.total_chunks()
        };

        let table = self.chunk_table(transfer_id).await;
        if table.is_written(chunk_index).await {
            let catalog = self.catalog.read().await;
            return Ok(catalog.get(&transfer_id).map(|s| s.received_bytes).unwrap_or(0));
        }

        let staging = {
            let catalog = self.catalog.read().await;
            catalog.get(&transfer_id).map(|s| s.staging_path(&self.transfers_dir))
        };
        let Some(staging) = staging else {
            return Err(CoreError::PathInvalid("unknown transfer".into()));
        };
        let chunk_size = {
            let catalog = self.catalog.read().await;
            catalog.get(&transfer_id).map(|s| s.chunk_size).unwrap_or(0)
        };
        let offset = chunk_index * chunk_size;

        if let Err(e) = write_at_offset(&staging, offset, bytes) {
            let mut catalog = self.catalog.write().await;
            if let Some(session) = catalog.get_mut(&transfer_id) {
                session.state = TransferState::Paused;
                session.recorded_error = Some(e.to_string());
                let snapshot = session.clone();
                drop(catalog);
                let _ = self.persist(&snapshot);
            }
            return Err(CoreError::Io(e.to_string()));
        }

        table.mark_written(chunk_index).await;
        let written = table.written_count().await;

        let mut catalog = self.catalog.write().await;
        let session = catalog
            .get_mut(&transfer_id)
            .ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
        session.received_bytes = (written * session.chunk_size).min(session.total_size);
        session.last_activity = Utc::now();
        if !session.written_chunks.contains(&chunk_index) {
            session.written_chunks.push(chunk_index);
        }
        let received = session.received_bytes;
        let snapshot = session.clone();
        drop(catalog);
        self.persist(&snapshot)?;

        let _ = total_chunks;
        Ok(received)
    }

    /// Finalize an upload once every chunk has arrived: fsync, apply the
    /// conflict policy, atomically rename staging to the destination, and
    /// mark `Completed` (spec.md §4.7.2).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SizeMismatch`] if fewer bytes than declared
    /// have arrived, [`CoreError::ConflictExists`] if the destination
    /// exists under an `Abort` policy, or [`CoreError::Io`] on filesystem
    /// failure (invariant violation: the staging file is deleted
    /// immediately, per spec.md §4.7.6).
    pub async fn finalize(&self, transfer_id: Uuid) -> CoreResult<TransferSession> {
        let table = self.chunk_table(transfer_id).await;
        let mut catalog = self.catalog.write().await;
        let session = catalog
            .get_mut(&transfer_id)
            .ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
        ensure_writable(session)?;

        if !session.is_fully_received() || !table.all_written(session.total_chunks()).await {
            return Err(CoreError::SizeMismatch);
        }

        let staging = session.staging_path(&self.transfers_dir);
        let mut target_path = session.target_path.clone();

        match session.conflict_policy {
            ConflictPolicy::Abort if target_path.exists() => {
                return Err(CoreError::ConflictExists);
            },
            ConflictPolicy::KeepBoth if target_path.exists() => {
                target_path = disambiguate(&target_path);
            },
            _ => {},
        }

        if let Err(e) = fsync_and_rename(&staging, &target_path) {
            let _ = std::fs::remove_file(&staging);
            return Err(CoreError::Io(e.to_string()));
        }

        session.target_path = target_path;
        session.state = TransferState::Completed;
        session.last_activity = Utc::now();
        let resolved = session.clone();
        drop(catalog);

        self.chunk_tables.write().await.remove(&transfer_id);
        let meta = resolved.meta_path(&self.transfers_dir);
        let _ = std::fs::remove_file(meta);
        self.catalog.write().await.remove(&transfer_id);
        Ok(resolved)
    }

    /// Pause an active upload: subsequent chunk PUTs respond with
    /// `TransferPaused` until the client resumes (spec.md §4.7.2
    /// `POST /files/upload/{id}/pause`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathInvalid`] if `transfer_id` is unknown.
    pub async fn pause(&self, transfer_id: Uuid) -> CoreResult<TransferSession> {
        let mut catalog = self.catalog.write().await;
        let session = catalog
            .get_mut(&transfer_id)
            .ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
        session.state = TransferState::Paused;
        session.last_activity = Utc::now();
        let snapshot = session.clone();
        drop(catalog);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Resume a paused upload, allowing chunk PUTs again. A client simply
    /// sending chunks again also works since `write_chunk` only rejects
    /// `Paused` sessions; this exists for an explicit "resume" affordance
    /// mirroring `pause`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathInvalid`] if `transfer_id` is unknown.
    pub async fn resume(&self, transfer_id: Uuid) -> CoreResult<TransferSession> {
        let mut catalog = self.catalog.write().await;
        let session = catalog
            .get_mut(&transfer_id)
            .ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
        if matches!(session.state, TransferState::Paused) {
            session.state = TransferState::Active;
        }
        session.last_activity = Utc::now();
        let snapshot = session.clone();
        drop(catalog);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Cancel a session: removes its staging file and catalog entry
    /// immediately (spec.md §4.7.2).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathInvalid`] if `transfer_id` is unknown.
    pub async fn cancel(&self, transfer_id: Uuid) -> CoreResult<()> {
        let mut catalog = self.catalog.write().await;
        let session = catalog
            .remove(&transfer_id)
            .ok_or(CoreError::PathInvalid("unknown transfer".into()))?;
        drop(catalog);
        self.chunk_tables.write().await.remove(&transfer_id);
        let _ = std::fs::remove_file(session.staging_path(&self.transfers_dir));
        let _ = std::fs::remove_file(session.meta_path(&self.transfers_dir));
        Ok(())
    }

    /// Current state of a session, for the pause-with-resumable-metadata
    /// 409 response (spec.md §4.7.2).
    pub async fn get(&self, transfer_id: Uuid) -> Option<TransferSession> {
        self.catalog.read().await.get(&transfer_id).cloned()
    }

    /// List every non-terminal session, for operator visibility.
    pub async fn list(&self) -> Vec<TransferSession> {
        self.catalog.read().await.values().cloned().collect()
    }

    /// Write a whole file in one call, bypassing the chunk catalog
    /// entirely (spec.md §4.7.4 `PUT /files` direct upload fast path; no
    /// resumption).
    ///
    /// # Errors
    ///
    /// Returns path-safety or conflict errors identically to
    /// [`TransferEngine::init_upload`], or [`CoreError::Io`] on write
    /// failure.
    pub async fn write_direct(
        &self,
        requested_path: &Path,
        bytes: &[u8],
        conflict_policy: ConflictPolicy,
    ) -> CoreResult<PathBuf> {
        let target_path = path_safety::resolve(requested_path, &self.config.allowed_roots)?;
        let mut target_path = target_path;
        match conflict_policy {
            ConflictPolicy::Abort if target_path.exists() => {
                return Err(CoreError::ConflictExists);
            },
            ConflictPolicy::KeepBoth if target_path.exists() => {
                target_path = disambiguate(&target_path);
            },
            _ => {},
        }
        let tmp_dir = target_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(tmp_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target_path)
            .map_err(|e| CoreError::Io(e.to_string()))?;
        Ok(target_path)
    }

    /// Resolve and validate a requested download/stream path against the
    /// allow-list (spec.md §4.7.3). Range serving itself is handled in
    /// `pclink-web` since it's purely an HTTP concern.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathForbidden`]/[`CoreError::PathInvalid`].
    pub fn resolve_download_path(&self, requested_path: &Path) -> CoreResult<PathBuf> {
        path_safety::resolve(requested_path, &self.config.allowed_roots)
    }

    /// Run one stale-session sweep: any non-terminal session whose
    /// `last_activity` is older than the configured threshold is marked
    /// `Stale`, its staging file removed, and its catalog entry dropped
    /// (spec.md §4.7.5).
    pub async fn reap_stale(&self) -> CleanupReport {
        let threshold = self.config.stale_threshold;
        let now = Utc::now();
        let mut catalog = self.catalog.write().await;
        let inspected = catalog.len();
        let stale_ids: Vec<Uuid> = catalog
            .values()
            .filter(|s| {
                !s.state.is_terminal()
                    && now.signed_duration_since(s.last_activity).to_std().unwrap_or_default()
                        >= threshold
            })
            .map(|s| s.transfer_id)
            .collect();
        for id in &stale_ids {
            if let Some(session) = catalog.remove(id) {
                let _ = std::fs::remove_file(session.staging_path(&self.transfers_dir));
                let _ = std::fs::remove_file(session.meta_path(&self.transfers_dir));
            }
        }
        drop(catalog);
        self.chunk_tables.write().await.retain(|id, _| !stale_ids.contains(id));
        CleanupReport {
            reaped: stale_ids.len(),
            inspected,
        }
    }

    async fn chunk_table(&self, transfer_id: Uuid) -> Arc<ChunkTable> {
        let mut tables = self.chunk_tables.write().await;
        tables
            .entry(transfer_id)
            .or_insert_with(|| Arc::new(ChunkTable::new()))
            .clone()
    }

    fn persist(&self, session: &TransferSession) -> CoreResult<()> {
        let path = session.meta_path(&self.transfers_dir);
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes = serde_json::to_vec(session)
            .map_err(|e| CoreError::Configuration(format!("cannot serialize session: {e}")))?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path).map_err(|e| CoreError::Io(e.to_string()))?;
        Ok(())
    }
}

fn ensure_writable(session: &TransferSession) -> CoreResult<()> {
    match session.state {
        TransferState::Active => Ok(()),
        TransferState::Paused => Err(CoreError::TransferPaused),
        TransferState::Cancelled => Err(CoreError::TransferCancelled),
        TransferState::Stale => Err(CoreError::TransferStale),
        TransferState::Completed => Err(CoreError::ConflictExists),
    }
}

fn write_at_offset(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

fn fsync_and_rename(staging: &Path, target: &Path) -> std::io::Result<()> {
    {
        let file = std::fs::OpenOptions::new().write(true).open(staging)?;
        file.sync_all()?;
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(staging, target)
}

fn disambiguate(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    for n in 1..1000 {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allowed: &Path) -> TransferConfig {
        TransferConfig::new()
            .with_chunk_size(4)
            .with_allowed_root(allowed.to_path_buf())
    }

    #[tokio::test]
    async fn upload_chunk_and_finalize_round_trip() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");

        let dest = allowed.path().join("out.bin");
        let session = engine
            .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
            .await
            .expect("init");

        engine.write_chunk(session.transfer_id, 0, b"abcd").await.expect("chunk0");
        engine.write_chunk(session.transfer_id, 1, b"efgh").await.expect("chunk1");

        let finalized = engine.finalize(session.transfer_id).await.expect("finalize");
        assert_eq!(finalized.state, TransferState::Completed);
        assert_eq!(std::fs::read(&dest).expect("read"), b"abcdefgh");
    }

    #[tokio::test]
    async fn chunk_write_is_idempotent() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
        let dest = allowed.path().join("out.bin");
        let session = engine
            .init_upload(Uuid::new_v4(), &dest, 4, ConflictPolicy::Abort)
            .await
            .expect("init");

        let first = engine.write_chunk(session.transfer_id, 0, b"abcd").await.expect("chunk");
        let second = engine.write_chunk(session.transfer_id, 0, b"abcd").await.expect("retry");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn finalize_before_all_chunks_fails() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
        let dest = allowed.path().join("out.bin");
        let session = engine
            .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
            .await
            .expect("init");
        engine.write_chunk(session.transfer_id, 0, b"abcd").await.expect("chunk0");
        let result = engine.finalize(session.transfer_id).await;
        assert!(matches!(result, Err(CoreError::SizeMismatch)));
    }

    #[tokio::test]
    async fn rejects_path_outside_allowed_root() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
        let result = engine
            .init_upload(Uuid::new_v4(), Path::new("/etc/passwd"), 4, ConflictPolicy::Abort)
            .await;
        assert!(matches!(result, Err(CoreError::PathForbidden)));
    }

    #[tokio::test]
    async fn cancel_removes_staging_and_catalog_entry() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
        let dest = allowed.path().join("out.bin");
        let session = engine
            .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
            .await
            .expect("init");
        let staging = session.staging_path(transfers.path());
        assert!(staging.exists());
        engine.cancel(session.transfer_id).await.expect("cancel");
        assert!(!staging.exists());
        assert!(engine.get(session.transfer_id).await.is_none());
    }

    #[tokio::test]
    async fn reap_stale_removes_inactive_sessions() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let cfg = config(allowed.path()).with_stale_threshold(std::time::Duration::from_secs(0));
        let engine = TransferEngine::load_or_init(transfers.path(), cfg).expect("load");
        let dest = allowed.path().join("out.bin");
        engine
            .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
            .await
            .expect("init");
        let report = engine.reap_stale().await;
        assert_eq!(report.reaped, 1);
        assert!(engine.list().await.is_empty());
    }

    #[tokio::test]
    async fn reload_reconstructs_active_sessions() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let session_id = {
            let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
            let dest = allowed.path().join("out.bin");
            let session = engine
                .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
                .await
                .expect("init");
            session.transfer_id
        };
        let reloaded = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("reload");
        assert!(reloaded.get(session_id).await.is_some());
    }

    #[tokio::test]
    async fn reload_preserves_already_written_chunks_so_finalize_still_succeeds() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers = tempfile::tempdir().expect("tempdir");
        let dest = allowed.path().join("out.bin");
        let session_id = {
            let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("load");
            let session = engine
                .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
                .await
                .expect("init");
            engine.write_chunk(session.transfer_id, 0, b"abcd").await.expect("chunk0");
            session.transfer_id
        };

        // Simulate a restart: a fresh engine reloads the on-disk catalog.
        // A well-behaved client only resends chunks it never got acked for,
        // so only chunk 1 arrives post-restart.
        let engine = TransferEngine::load_or_init(transfers.path(), config(allowed.path())).expect("reload");
        engine.write_chunk(session_id, 1, b"efgh").await.expect("chunk1");

        let finalized = engine.finalize(session_id).await.expect("finalize after restart");
        assert_eq!(finalized.state, TransferState::Completed);
        assert_eq!(std::fs::read(&dest).expect("read"), b"abcdefgh");
    }
}
