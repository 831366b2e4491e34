use crate::progress::ProgressTracker;
use anyhow::Result;
use common::db::AsyncDb;
use std::time::Duration;

/// Truncate the SQLite WAL. With only long-lived connections the WAL can
/// grow without bound between restarts; periodic truncation keeps the file
/// size in check.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<(i64, i64)> {
    db.call_named("wal_checkpoint.run", |conn| {
        let mut stmt = conn.prepare("PRAGMA wal_checkpoint(TRUNCATE)")?;
        let (busy, log, checkpointed) = stmt.query_row([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        if busy != 0 {
            tracing::warn!(
                busy,
                log,
                checkpointed,
                "WAL checkpoint: database was busy, partial checkpoint"
            );
            metrics::counter!("regard_wal_checkpoint_total", "status" => "busy").increment(1);
        } else {
            tracing::info!(log, checkpointed, "WAL checkpoint complete");
            metrics::counter!("regard_wal_checkpoint_total", "status" => "ok").increment(1);
        }
        metrics::gauge!("regard_wal_checkpoint_pages").set(checkpointed as f64);
        Ok((log, checkpointed))
    })
    .await
}

/// Drop upload progress entries not touched within the TTL.
pub fn run_progress_purge_once(tracker: &ProgressTracker, ttl: Duration) -> usize {
    let purged = tracker.purge_stale(ttl);
    if purged > 0 {
        tracing::info!(purged, "purged stale upload progress entries");
        metrics::counter!("regard_progress_purged_total").increment(purged as u64);
    }
    purged
}
