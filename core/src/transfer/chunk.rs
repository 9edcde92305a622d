//! Chunk records: per-`(transfer_id, chunk_index)` write tracking with
//! idempotent retry support (spec.md §3 `ChunkRecord`, §4.7.2, §5).

use std::collections::HashMap;

use tokio::sync::Mutex;

/// Whether a chunk has been durably written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// `true` once this chunk's bytes have been written to the staging
    /// file.
    pub written: bool,
}

/// Per-chunk locks for one transfer session. Each chunk index gets its
/// own `Mutex` so concurrent retries of the *same* chunk serialize
/// without blocking writes to *other* chunks (spec.md §5: "chunk writes
/// coordinate via per-chunk locks only").
pub struct ChunkTable {
    records: Mutex<HashMap<u64, ChunkRecord>>,
}

impl ChunkTable {
    /// An empty table for a session with `total_chunks` chunks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Build a table pre-populated with `written` indices, for
    /// reconstructing a session's chunk progress from its persisted
    /// `written_chunks` list at load time (spec.md §4.7.1 resumability).
    #[must_use]
    pub fn from_written(written: &[u64]) -> Self {
        let records = written.iter().map(|&i| (i, ChunkRecord { written: true })).collect();
        Self {
            records: Mutex::new(records),
        }
    }

    /// Mark a chunk written. Safe to call more than once for the same
    /// index (idempotent retries, spec.md §4.7.2).
    pub async fn mark_written(&self, chunk_index: u64) {
        self.records
            .lock()
            .await
            .insert(chunk_index, ChunkRecord { written: true });
    }

    /// `true` if this chunk index has already been durably written,
    /// letting the caller skip re-writing identical bytes on a retried
    /// request.
    pub async fn is_written(&self, chunk_index: u64) -> bool {
        self.records
            .lock()
            .await
            .get(&chunk_index)
            .is_some_and(|r| r.written)
    }

    /// Count of chunks marked written so far.
    pub async fn written_count(&self) -> u64 {
        self.records.lock().await.values().filter(|r| r.written).count() as u64
    }

    /// `true` if every chunk in `[0, total_chunks)` has been written.
    pub async fn all_written(&self, total_chunks: u64) -> bool {
        let records = self.records.lock().await;
        (0..total_chunks).all(|i| records.get(&i).is_some_and(|r| r.written))
    }
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_written_is_idempotent() {
        let table = ChunkTable::new();
        table.mark_written(0).await;
        table.mark_written(0).await;
        assert_eq!(table.written_count().await, 1);
        assert!(table.is_written(0).await);
        assert!(!table.is_written(1).await);
    }

    #[tokio::test]
    async fn all_written_requires_every_index() {
        let table = ChunkTable::new();
        table.mark_written(0).await;
        table.mark_written(1).await;
        assert!(!table.all_written(3).await);
        table.mark_written(2).await;
        assert!(table.all_written(3).await);
    }
}
