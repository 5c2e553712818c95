//! Batch cover backfill
//!
//! One background worker per process. It walks the selected candidates in
//! order, tries providers in priority order until one stores a cover, and
//! publishes a progress snapshot after every attempt. A stored cover only
//! counts once its catalog row is written. Provider failure counters and pause
//! windows live in the worker's [`RunState`] and die with the run.

use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::breaker::ProviderBreaker;
use super::candidates::CandidateSelector;
use super::config::BackfillConfig;
use super::progress::{BackfillProgress, ProgressTracker};
use super::repository::CoverRepository;
use super::sources::CoverProvider;
use super::types::{
    BackfillMode, Candidate, SourceAttemptOutcome, SourceAttemptResult, SourceAttemptStatus,
    LOCAL_VALIDATION,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackfillError {
    #[error("A backfill run is already in progress")]
    AlreadyRunning,
}

/// Counts at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_candidates: usize,
    pub processed: usize,
    pub cover_found: usize,
    pub no_cover_found: usize,
    pub cancelled: bool,
}

enum CandidateOutcome {
    Completed,
    Cancelled,
}

/// Worker-owned state for one run
struct RunState {
    snapshot: BackfillProgress,
    breaker: ProviderBreaker,
    /// A provider has been called in this run, so the next call is paced
    called_provider: bool,
}

impl RunState {
    fn new(total_candidates: usize, config: &BackfillConfig) -> Self {
        Self {
            snapshot: BackfillProgress::started(total_candidates),
            breaker: ProviderBreaker::new(config.failure_threshold, config.pause_duration),
            called_provider: false,
        }
    }

    fn begin(&mut self, candidate: &Candidate) {
        self.snapshot.current_book_id = Some(candidate.book_id);
        self.snapshot.current_book_title = Some(candidate.display_title().to_string());
        self.snapshot.current_book_isbn = candidate.lookup_key().map(str::to_string);
        self.snapshot.current_book_attempts.clear();
    }

    fn push_attempt(&mut self, status: SourceAttemptStatus) {
        self.snapshot.current_book_attempts.push(status);
    }

    fn complete(&mut self, found: bool) {
        let snapshot = &mut self.snapshot;
        snapshot.processed += 1;
        if found {
            snapshot.cover_found += 1;
        } else {
            snapshot.no_cover_found += 1;
        }
        snapshot.last_completed_book_id = snapshot.current_book_id.take();
        snapshot.last_completed_book_title = snapshot.current_book_title.take();
        snapshot.last_completed_book_isbn = snapshot.current_book_isbn.take();
        snapshot.last_completed_book_found = Some(found);
        snapshot.last_completed_book_attempts = std::mem::take(&mut snapshot.current_book_attempts);
    }

    fn finish(&mut self, cancelled: bool) -> RunSummary {
        let snapshot = &mut self.snapshot;
        snapshot.running = false;
        snapshot.current_book_id = None;
        snapshot.current_book_title = None;
        snapshot.current_book_isbn = None;
        snapshot.current_book_attempts.clear();

        RunSummary {
            total_candidates: snapshot.total_candidates,
            processed: snapshot.processed,
            cover_found: snapshot.cover_found,
            no_cover_found: snapshot.no_cover_found,
            cancelled,
        }
    }
}

/// Clears the process-wide running flag when the worker ends, even on panic
struct RunningGuard {
    running: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

struct Inner {
    selector: Arc<dyn CandidateSelector>,
    providers: Vec<Arc<dyn CoverProvider>>,
    repository: Arc<dyn CoverRepository>,
    progress: Arc<ProgressTracker>,
    config: BackfillConfig,
    running: Arc<AtomicBool>,
    idle: Arc<Notify>,
    cancel: Mutex<CancellationToken>,
}

/// Start, cancel, and observe backfill runs
#[derive(Clone)]
pub struct BackfillService {
    inner: Arc<Inner>,
}

impl BackfillService {
    /// `providers` are tried in the given order. Stored covers are recorded
    /// through `repository`, the same one the upload coordinator writes to.
    pub fn new(
        selector: Arc<dyn CandidateSelector>,
        providers: Vec<Arc<dyn CoverProvider>>,
        repository: Arc<dyn CoverRepository>,
        progress: Arc<ProgressTracker>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                selector,
                providers,
                repository,
                progress,
                config,
                running: Arc::new(AtomicBool::new(false)),
                idle: Arc::new(Notify::new()),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Arc<BackfillProgress> {
        self.inner.progress.get()
    }

    /// Launch a run in the background. Rejected while another run is active.
    pub fn start(&self, mode: BackfillMode, limit: i64) -> Result<JoinHandle<RunSummary>, BackfillError> {
        let token = {
            let mut cancel = self.inner.cancel.lock();
            if self
                .inner
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(BackfillError::AlreadyRunning);
            }
            *cancel = CancellationToken::new();
            cancel.clone()
        };

        info!(mode = %mode, limit, "Starting cover backfill");

        let guard = RunningGuard {
            running: Arc::clone(&self.inner.running),
            idle: Arc::clone(&self.inner.idle),
        };
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let summary = inner.run(mode, limit, token).await;
            drop(guard);
            summary
        }))
    }

    /// Request cancellation; false when nothing is running
    pub fn cancel(&self) -> bool {
        let cancel = self.inner.cancel.lock();
        if !self.is_running() {
            return false;
        }
        info!("Cancellation requested for cover backfill");
        cancel.cancel();
        true
    }

    /// Wait until no run is active; false if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let idle = self.inner.idle.notified();
                if !self.is_running() {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Sleep unless cancelled first; false means cancelled
async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Inner {
    #[instrument(skip(self, token))]
    async fn run(&self, mode: BackfillMode, limit: i64, token: CancellationToken) -> RunSummary {
        let candidates = match self.selector.query_candidates(mode, limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to select backfill candidates");
                let mut state = RunState::new(0, &self.config);
                let summary = state.finish(false);
                self.progress.update(state.snapshot);
                return summary;
            }
        };

        let mut state = RunState::new(candidates.len(), &self.config);
        self.progress.reset(candidates.len());
        info!(total = candidates.len(), "Backfill candidates selected");

        let batch_size = self.config.batch_size.max(1);
        let mut cancelled = false;

        for (index, candidate) in candidates.iter().enumerate() {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            if index > 0 && index % batch_size == 0 {
                info!(processed = index, "Batch complete, cooling down");
                if !pause(self.config.batch_cooldown, &token).await {
                    cancelled = true;
                    break;
                }
            }

            match self.process_candidate(candidate, &mut state, &token).await {
                CandidateOutcome::Completed => {}
                CandidateOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        let summary = state.finish(cancelled);
        self.progress.update(state.snapshot);

        info!(
            processed = summary.processed,
            found = summary.cover_found,
            not_found = summary.no_cover_found,
            cancelled,
            "Cover backfill finished"
        );

        summary
    }

    async fn process_candidate(
        &self,
        candidate: &Candidate,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> CandidateOutcome {
        state.begin(candidate);
        self.progress.update(state.snapshot.clone());

        let Some(lookup_key) = candidate.lookup_key() else {
            state.push_attempt(SourceAttemptStatus::now(
                LOCAL_VALIDATION,
                SourceAttemptOutcome::Skipped,
                "No ISBN available for lookup",
            ));
            state.complete(false);
            self.progress.update(state.snapshot.clone());
            return CandidateOutcome::Completed;
        };

        let mut found = false;

        for provider in &self.providers {
            let source = provider.name();

            if let Some(remaining) = state.breaker.paused_for(source) {
                state.push_attempt(SourceAttemptStatus::now(
                    source,
                    SourceAttemptOutcome::Skipped,
                    format!("Paused after repeated failures ({}s remaining)", remaining.as_secs()),
                ));
                record_metric(source, SourceAttemptOutcome::Skipped);
                self.progress.update(state.snapshot.clone());
                continue;
            }

            if state.called_provider && !pause(self.config.pacing, token).await {
                return CandidateOutcome::Cancelled;
            }
            state.called_provider = true;

            let result = AssertUnwindSafe(provider.fetch_cover(lookup_key, candidate.book_id))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| SourceAttemptResult::failure("Provider panicked"));
            let result = match result.outcome {
                SourceAttemptOutcome::Success => self.persist(candidate, source, result).await,
                _ => result,
            };

            if state.breaker.record(source, result.outcome) {
                warn!(
                    source,
                    pause_secs = self.config.pause_duration.as_secs(),
                    "Provider paused after consecutive failures"
                );
            }
            record_metric(source, result.outcome);

            state.push_attempt(SourceAttemptStatus::now(source, result.outcome, result.detail));
            self.progress.update(state.snapshot.clone());

            if result.outcome == SourceAttemptOutcome::Success {
                found = true;
                break;
            }
        }

        state.complete(found);
        self.progress.update(state.snapshot.clone());
        CandidateOutcome::Completed
    }

    /// Write a stored cover to the catalog; a failed write turns the attempt
    /// into a FAILURE
    async fn persist(
        &self,
        candidate: &Candidate,
        source: &'static str,
        result: SourceAttemptResult,
    ) -> SourceAttemptResult {
        let (Some(image_url), Some(stored)) = (result.image_url.as_deref(), result.stored.as_ref())
        else {
            return SourceAttemptResult::failure("Provider reported success without a stored cover");
        };

        let recorded = self
            .repository
            .record_success(candidate.book_id, source, image_url, stored)
            .await;
        match recorded {
            Ok(()) => result,
            Err(e) => {
                warn!(
                    book_id = %candidate.book_id,
                    source,
                    key = %stored.storage_key,
                    error = %e,
                    "Failed to record stored cover"
                );
                SourceAttemptResult::failure(format!("Failed to record cover: {}", e))
            }
        }
    }
}

fn record_metric(source: &'static str, outcome: SourceAttemptOutcome) {
    metrics::counter!(
        "cover_backfill_attempts_total",
        "source" => source,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}
