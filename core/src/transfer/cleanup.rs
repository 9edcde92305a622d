//! Stale transfer cleanup (spec.md §4.7.5).

use std::time::Duration;

use tracing::info;

use super::TransferEngine;

/// Counts of a cleanup pass, returned to both the periodic background
/// task and the operator-triggered `/transfers/cleanup/execute` endpoint
/// (spec.md §4.7.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    /// Number of sessions transitioned to `Stale` and removed.
    pub reaped: usize,
    /// Number of sessions inspected.
    pub inspected: usize,
}

/// Run one cleanup pass against `engine` using its configured staleness
/// threshold.
pub async fn run_once(engine: &TransferEngine) -> CleanupReport {
    let report = engine.reap_stale().await;
    info!(
        reaped = report.reaped,
        inspected = report.inspected,
        "transfer cleanup pass complete"
    );
    report
}

/// Spawn a periodic cleanup task that runs `run_once` every `interval`
/// until `shutdown` fires (spec.md §4.7.5 "periodic task").
pub async fn run_periodic(
    engine: std::sync::Arc<TransferEngine>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(&engine).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
