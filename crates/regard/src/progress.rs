use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("an upload is already running for this user")]
    UploadInProgress,
}

/// Pipeline stages in execution order. The numeric value doubles as the
/// step counter shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadStage {
    Receive = 1,
    Parse = 2,
    Score = 3,
    Aggregate = 4,
    Save = 5,
}

pub const TOTAL_STEPS: u32 = 5;

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::Receive => "receive",
            UploadStage::Parse => "parse",
            UploadStage::Score => "score",
            UploadStage::Aggregate => "aggregate",
            UploadStage::Save => "save",
        }
    }

    fn step(self) -> u32 {
        self as u32
    }

    /// Human-readable line shown to a polling client.
    fn message(self) -> &'static str {
        match self {
            UploadStage::Receive => "receiving upload",
            UploadStage::Parse => "parsing trade history",
            UploadStage::Score => "scoring tickers",
            UploadStage::Aggregate => "computing your score",
            UploadStage::Save => "saving results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    InProgress,
    Complete,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }
}

/// Point-in-time view of one user's upload.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub user_id: String,
    pub step: u32,
    pub total_steps: u32,
    pub stage: &'static str,
    pub message: &'static str,
    pub percentage: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    step: u32,
    stage: &'static str,
    message: &'static str,
    status: UploadStatus,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Upload progress for all users, kept in process memory. Terminal entries
/// linger so a polling client sees the final state at least once, then get
/// purged by the maintenance job.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload. Rejected while a previous upload for the same
    /// user is still running; a finished (complete or failed) entry is
    /// replaced.
    pub fn begin(&self, user_id: &str) -> Result<(), ProgressError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slots.get(user_id) {
            if !existing.status.is_terminal() {
                return Err(ProgressError::UploadInProgress);
            }
        }
        let now = Utc::now();
        slots.insert(
            user_id.to_string(),
            Slot {
                step: UploadStage::Receive.step(),
                stage: UploadStage::Receive.as_str(),
                message: UploadStage::Receive.message(),
                status: UploadStatus::InProgress,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    /// Move an upload forward. Regressions and updates to finished or
    /// unknown uploads are ignored, so late-arriving task wakeups cannot
    /// walk the progress bar backwards.
    pub fn advance(&self, user_id: &str, stage: UploadStage) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(user_id) {
            if slot.status.is_terminal() || stage.step() <= slot.step {
                return;
            }
            slot.step = stage.step();
            slot.stage = stage.as_str();
            slot.message = stage.message();
            slot.updated_at = Utc::now();
        }
    }

    pub fn complete(&self, user_id: &str) {
        self.finish(user_id, UploadStatus::Complete, None);
    }

    pub fn fail(&self, user_id: &str, reason: &str) {
        self.finish(user_id, UploadStatus::Failed, Some(reason.to_string()));
    }

    fn finish(&self, user_id: &str, status: UploadStatus, error: Option<String>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(user_id) {
            // First terminal state wins.
            if slot.status.is_terminal() {
                return;
            }
            if status == UploadStatus::Complete {
                slot.step = TOTAL_STEPS;
                slot.stage = UploadStage::Save.as_str();
            }
            slot.message = match status {
                UploadStatus::Complete => "analysis complete",
                UploadStatus::Failed => "analysis failed",
                UploadStatus::InProgress => slot.message,
            };
            slot.status = status;
            slot.error = error;
            slot.updated_at = Utc::now();
        }
    }

    pub fn get(&self, user_id: &str) -> Option<UploadProgress> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(user_id).map(|slot| UploadProgress {
            user_id: user_id.to_string(),
            step: slot.step,
            total_steps: TOTAL_STEPS,
            stage: slot.stage,
            message: slot.message,
            percentage: ((slot.step * 100) / TOTAL_STEPS).min(100) as u8,
            status: slot.status,
            error: slot.error.clone(),
            created_at: slot.created_at,
            updated_at: slot.updated_at,
        })
    }

    /// Drop entries not updated within `ttl`. Covers finished uploads the
    /// client has had time to read, and orphaned in-progress entries whose
    /// task died without reaching a terminal state.
    pub fn purge_stale(&self, ttl: Duration) -> usize {
        self.purge_stale_at(Utc::now(), ttl)
    }

    fn purge_stale_at(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|_, slot| slot.updated_at >= cutoff);
        before - slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_poll() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.step, 1);
        assert_eq!(progress.stage, "receive");
        assert_eq!(progress.message, "receiving upload");
        assert_eq!(progress.percentage, 20);
        assert_eq!(progress.status, UploadStatus::InProgress);
        assert_eq!(progress.created_at, progress.updated_at);
    }

    #[test]
    fn test_created_at_survives_stage_and_terminal_updates() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        let created = tracker.get("u1").unwrap().created_at;

        tracker.advance("u1", UploadStage::Parse);
        tracker.complete("u1");

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.created_at, created);
        assert!(progress.updated_at >= progress.created_at);
        assert_eq!(progress.message, "analysis complete");
    }

    #[test]
    fn test_concurrent_upload_rejected() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        assert!(matches!(
            tracker.begin("u1"),
            Err(ProgressError::UploadInProgress)
        ));
        // A different user is unaffected.
        tracker.begin("u2").unwrap();
    }

    #[test]
    fn test_rebegin_after_terminal_replaces() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        tracker.fail("u1", "boom");
        tracker.begin("u1").unwrap();

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::InProgress);
        assert_eq!(progress.error, None);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        tracker.advance("u1", UploadStage::Aggregate);
        tracker.advance("u1", UploadStage::Parse); // late wakeup, ignored

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.step, 4);
        assert_eq!(progress.stage, "aggregate");
        assert_eq!(progress.percentage, 80);
    }

    #[test]
    fn test_complete_reports_full_progress() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        tracker.advance("u1", UploadStage::Score);
        tracker.complete("u1");

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Complete);
        assert_eq!(progress.percentage, 100);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        tracker.fail("u1", "parse error");
        tracker.complete("u1");
        tracker.advance("u1", UploadStage::Save);

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Failed);
        assert_eq!(progress.error.as_deref(), Some("parse error"));
    }

    #[test]
    fn test_unknown_user_is_none() {
        let tracker = ProgressTracker::new();
        assert!(tracker.get("nobody").is_none());
        // Advancing an unknown upload is a no-op, not a panic.
        tracker.advance("nobody", UploadStage::Parse);
    }

    #[test]
    fn test_purge_stale_drops_old_entries() {
        let tracker = ProgressTracker::new();
        tracker.begin("old").unwrap();
        tracker.complete("old");
        tracker.begin("fresh").unwrap();

        let future = Utc::now() + chrono::Duration::seconds(600);
        let purged = tracker.purge_stale_at(future, Duration::from_secs(300));
        assert_eq!(purged, 2);
        assert!(tracker.get("old").is_none());

        let none_purged = tracker.purge_stale_at(Utc::now(), Duration::from_secs(300));
        assert_eq!(none_purged, 0);
    }
}
