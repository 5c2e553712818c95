//! Backfill progress snapshots
//!
//! The orchestrator is the only writer. Status polling reads whatever snapshot
//! is current; snapshots are never mutated after publication, only replaced.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::types::SourceAttemptStatus;

/// Immutable view of a backfill run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillProgress {
    pub total_candidates: usize,
    pub processed: usize,
    pub cover_found: usize,
    pub no_cover_found: usize,
    pub running: bool,
    pub current_book_id: Option<Uuid>,
    pub current_book_title: Option<String>,
    pub current_book_isbn: Option<String>,
    pub current_book_attempts: Vec<SourceAttemptStatus>,
    pub last_completed_book_id: Option<Uuid>,
    pub last_completed_book_title: Option<String>,
    pub last_completed_book_isbn: Option<String>,
    pub last_completed_book_found: Option<bool>,
    pub last_completed_book_attempts: Vec<SourceAttemptStatus>,
}

impl BackfillProgress {
    /// Fresh snapshot for a run that is starting
    pub fn started(total_candidates: usize) -> Self {
        Self {
            total_candidates,
            running: true,
            ..Self::default()
        }
    }
}

/// Holder of the latest snapshot
#[derive(Debug, Default)]
pub struct ProgressTracker {
    current: RwLock<Arc<BackfillProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a zeroed, running one
    pub fn reset(&self, total_candidates: usize) {
        self.update(BackfillProgress::started(total_candidates));
    }

    /// Publish a new snapshot
    pub fn update(&self, snapshot: BackfillProgress) {
        *self.current.write() = Arc::new(snapshot);
    }

    pub fn get(&self) -> Arc<BackfillProgress> {
        Arc::clone(&self.current.read())
    }
}
