//! Integration tests for the batch backfill orchestrator
//!
//! Most scenarios use scripted providers under a paused tokio clock so pacing,
//! cooldowns, and pause windows can be asserted exactly. The end-to-end cases
//! drive real provider clients against wiremock.

mod helpers;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use coverfill_server::covers::{
    candidates::CandidateSelector,
    config::BackfillConfig,
    repository::RepositoryError,
    retry::RetryPolicy,
    sources::{CoverProvider, CoverUploader, OpenLibraryProvider},
    types::{SourceAttemptResult, LOCAL_VALIDATION},
    BackfillMode, BackfillService, Candidate, ProgressTracker, SourceAttemptOutcome, StoredCover,
};
use helpers::{
    candidate, cover_png, fast_backfill_config, local_cover_store, FixedSelector,
    MemoryObjectStore, Recorded, RecordingRepository,
};

/// Provider that replays a script of outcomes and records call instants
struct ScriptedProvider {
    name: &'static str,
    script: Mutex<VecDeque<SourceAttemptOutcome>>,
    fallback: SourceAttemptOutcome,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl ScriptedProvider {
    fn always(name: &'static str, outcome: SourceAttemptOutcome) -> Arc<Self> {
        Self::scripted(name, vec![], outcome)
    }

    fn scripted(
        name: &'static str,
        script: Vec<SourceAttemptOutcome>,
        fallback: SourceAttemptOutcome,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl CoverProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_cover(&self, lookup_key: &str, book_id: Uuid) -> SourceAttemptResult {
        self.calls.lock().push((Instant::now(), lookup_key.to_string()));
        let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
        match outcome {
            SourceAttemptOutcome::Success => SourceAttemptResult::success(
                "stored",
                format!("https://img.test/{}.png", lookup_key),
                StoredCover {
                    storage_key: format!("covers/{}/{}.png", book_id, self.name),
                    resolved_url: "https://cdn.test/cover.png".to_string(),
                    width: 400,
                    height: 600,
                    grayscale: false,
                    source: self.name.to_string(),
                },
            ),
            SourceAttemptOutcome::NotFound => SourceAttemptResult::not_found("no cover"),
            SourceAttemptOutcome::Failure => SourceAttemptResult::failure("HTTP 503"),
            SourceAttemptOutcome::Skipped => SourceAttemptResult::skipped("skipped"),
        }
    }
}

struct PanickingProvider;

#[async_trait]
impl CoverProvider for PanickingProvider {
    fn name(&self) -> &'static str {
        "PANICKY"
    }

    async fn fetch_cover(&self, _lookup_key: &str, _book_id: Uuid) -> SourceAttemptResult {
        panic!("provider bug");
    }
}

struct BrokenSelector;

#[async_trait]
impl CandidateSelector for BrokenSelector {
    async fn query_candidates(
        &self,
        _mode: BackfillMode,
        _limit: i64,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }
}

fn books(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| candidate(&format!("Book {}", i), Some(&format!("97800000{:05}", i))))
        .collect()
}

fn service(
    candidates: Vec<Candidate>,
    providers: Vec<Arc<dyn CoverProvider>>,
    config: BackfillConfig,
) -> BackfillService {
    service_recording(
        candidates,
        providers,
        config,
        Arc::new(RecordingRepository::default()),
    )
}

fn service_recording(
    candidates: Vec<Candidate>,
    providers: Vec<Arc<dyn CoverProvider>>,
    config: BackfillConfig,
    repository: Arc<RecordingRepository>,
) -> BackfillService {
    BackfillService::new(
        Arc::new(FixedSelector::new(candidates)),
        providers,
        repository,
        Arc::new(ProgressTracker::new()),
        config,
    )
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_not_found() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::NotFound);
    let c = ScriptedProvider::always("C", SourceAttemptOutcome::NotFound);
    let svc = service(
        books(1),
        vec![a.clone(), b.clone(), c.clone()],
        BackfillConfig::default(),
    );

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.no_cover_found, 1);
    assert_eq!(summary.cover_found, 0);

    let progress = svc.progress();
    assert!(!progress.running);
    assert_eq!(progress.last_completed_book_found, Some(false));
    let outcomes: Vec<_> = progress
        .last_completed_book_attempts
        .iter()
        .map(|a| (a.source.as_str(), a.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("A", SourceAttemptOutcome::NotFound),
            ("B", SourceAttemptOutcome::NotFound),
            ("C", SourceAttemptOutcome::NotFound),
        ]
    );
    assert!(progress.current_book_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_isbn_is_skipped_locally() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::Success);
    let mut no_isbn = candidate("No Identifier", None);
    no_isbn.isbn10 = Some("   ".to_string());
    let svc = service(vec![no_isbn.clone()], vec![a.clone()], BackfillConfig::default());

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(a.call_count(), 0);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.no_cover_found, 1);

    let progress = svc.progress();
    assert_eq!(progress.last_completed_book_id, Some(no_isbn.book_id));
    assert_eq!(progress.last_completed_book_isbn, None);
    assert_eq!(progress.last_completed_book_attempts.len(), 1);
    let attempt = &progress.last_completed_book_attempts[0];
    assert_eq!(attempt.source, LOCAL_VALIDATION);
    assert_eq!(attempt.outcome, SourceAttemptOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_first_success_stops_provider_chain() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::Success);
    let c = ScriptedProvider::always("C", SourceAttemptOutcome::Success);
    let svc = service(books(2), vec![a.clone(), b.clone(), c.clone()], BackfillConfig::default());

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 2);
    assert_eq!(summary.no_cover_found, 0);
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.call_count(), 2);
    assert_eq!(c.call_count(), 0);

    let progress = svc.progress();
    let successes = progress
        .last_completed_book_attempts
        .iter()
        .filter(|a| a.outcome == SourceAttemptOutcome::Success)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(progress.last_completed_book_found, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_lookup_uses_preferred_identifier() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let mut book = candidate("Both Identifiers", Some(" 9781111111111 "));
    book.isbn10 = Some("1111111111".to_string());
    let svc = service(vec![book], vec![a.clone()], BackfillConfig::default());

    svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(a.calls.lock()[0].1, "9781111111111");
    assert_eq!(
        svc.progress().last_completed_book_isbn.as_deref(),
        Some("9781111111111")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failing_provider_is_paused_after_threshold() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::Failure);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::NotFound);
    let svc = service(books(5), vec![a.clone(), b.clone()], BackfillConfig::default());

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.processed, 5);
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.call_count(), 5);

    let progress = svc.progress();
    let attempts = &progress.last_completed_book_attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].source, "A");
    assert_eq!(attempts[0].outcome, SourceAttemptOutcome::Skipped);
    assert!(
        attempts[0].detail.starts_with("Paused after repeated failures ("),
        "{}",
        attempts[0].detail
    );
    assert_eq!(attempts[1].outcome, SourceAttemptOutcome::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_paused_provider_resumes_after_window() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::Failure);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::NotFound);
    let config = BackfillConfig {
        pause_duration: Duration::from_secs(5),
        ..BackfillConfig::default()
    };
    let svc = service(books(12), vec![a.clone(), b.clone()], config);

    svc.start(BackfillMode::Missing, 20).unwrap().await.unwrap();

    let calls = a.call_count();
    assert!(calls < 12, "A should have been skipped while paused");
    assert!(calls > 3, "A should be called again once the pause elapsed");
    assert_eq!(b.call_count(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_resets_failure_streak() {
    let a = ScriptedProvider::scripted(
        "A",
        vec![
            SourceAttemptOutcome::Failure,
            SourceAttemptOutcome::Failure,
            SourceAttemptOutcome::NotFound,
            SourceAttemptOutcome::Failure,
            SourceAttemptOutcome::Failure,
        ],
        SourceAttemptOutcome::NotFound,
    );
    let svc = service(books(6), vec![a.clone()], BackfillConfig::default());

    svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(a.call_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_paced() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::NotFound);
    let config = BackfillConfig {
        pacing: Duration::from_millis(1000),
        ..BackfillConfig::default()
    };
    let svc = service(books(2), vec![a.clone(), b.clone()], config);

    let started = Instant::now();
    svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    let mut times = a.call_times();
    times.extend(b.call_times());
    times.sort();
    assert_eq!(times.len(), 4);
    assert!(times[0] - started < Duration::from_millis(1000));
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_cooldown_between_batches() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let config = BackfillConfig {
        pacing: Duration::ZERO,
        batch_size: 2,
        batch_cooldown: Duration::from_secs(10),
        ..BackfillConfig::default()
    };
    let svc = service(books(3), vec![a.clone()], config);

    svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    let times = a.call_times();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] < Duration::from_secs(1));
    assert!(times[2] - times[1] >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_run() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let svc = service(books(50), vec![a.clone()], BackfillConfig::default());

    let handle = svc.start(BackfillMode::Missing, 100).unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert!(svc.progress().running);
    assert!(svc.cancel());

    let summary = handle.await.unwrap();
    assert!(summary.cancelled);
    assert!(summary.processed < 50);
    assert!(summary.processed <= summary.total_candidates);

    let progress = svc.progress();
    assert!(!progress.running);
    assert_eq!(progress.processed, summary.processed);
    assert!(!svc.is_running());
    assert!(!svc.cancel());
}

#[tokio::test(start_paused = true)]
async fn test_progress_visible_during_run() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::NotFound);
    let candidates = books(3);
    let first = candidates[0].clone();
    let svc = service(candidates, vec![a, b], BackfillConfig::default());

    let handle = svc.start(BackfillMode::Grayscale, 10).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let progress = svc.progress();
    assert!(progress.running);
    assert_eq!(progress.total_candidates, 3);
    assert_eq!(progress.processed, 0);
    assert_eq!(progress.current_book_id, Some(first.book_id));
    assert_eq!(progress.current_book_title.as_deref(), Some("Book 0"));
    assert_eq!(progress.current_book_attempts.len(), 1);

    svc.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_provider_panic_is_failure() {
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::Success);
    let svc = service(
        books(1),
        vec![Arc::new(PanickingProvider), b.clone()],
        BackfillConfig::default(),
    );

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 1);
    let progress = svc.progress();
    let attempts = &progress.last_completed_book_attempts;
    assert_eq!(attempts[0].source, "PANICKY");
    assert_eq!(attempts[0].outcome, SourceAttemptOutcome::Failure);
    assert_eq!(attempts[0].detail, "Provider panicked");
    assert_eq!(attempts[1].outcome, SourceAttemptOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_selector_failure_ends_run() {
    let svc = BackfillService::new(
        Arc::new(BrokenSelector),
        vec![],
        Arc::new(RecordingRepository::default()),
        Arc::new(ProgressTracker::new()),
        BackfillConfig::default(),
    );

    let summary = svc.start(BackfillMode::Rejected, 10).unwrap().await.unwrap();

    assert_eq!(summary.total_candidates, 0);
    assert!(!svc.progress().running);
    assert!(!svc.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_mode_and_limit_reach_selector() {
    let selector = Arc::new(FixedSelector::new(books(5)));
    let svc = BackfillService::new(
        selector.clone(),
        vec![],
        Arc::new(RecordingRepository::default()),
        Arc::new(ProgressTracker::new()),
        BackfillConfig::default(),
    );

    let summary = svc.start(BackfillMode::Grayscale, 2).unwrap().await.unwrap();

    assert_eq!(summary.total_candidates, 2);
    assert_eq!(*selector.requests.lock(), vec![(BackfillMode::Grayscale, 2)]);
}

fn rate_limited_uploader(objects: Arc<MemoryObjectStore>) -> CoverUploader {
    CoverUploader::new(
        Arc::new(local_cover_store(objects)),
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
    )
}

#[tokio::test]
async fn test_rate_limited_source_recovers_within_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(cover_png()),
        )
        .mount(&server)
        .await;

    let objects = Arc::new(MemoryObjectStore::default());
    let provider = OpenLibraryProvider::new(server.uri(), rate_limited_uploader(objects.clone()));
    let svc = service(books(1), vec![Arc::new(provider)], fast_backfill_config());

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 1);
    let progress = svc.progress();
    let attempts = &progress.last_completed_book_attempts;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, SourceAttemptOutcome::Success);
    assert!(attempts[0].detail.contains("2 rate-limit retries"), "{}", attempts[0].detail);
    assert!(attempts
        .iter()
        .all(|a| a.outcome != SourceAttemptOutcome::Skipped));
    assert_eq!(objects.objects.lock().len(), 1);
}

#[tokio::test]
async fn test_unavailable_source_falls_through_to_next() {
    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;
    let up = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(cover_png()),
        )
        .mount(&up)
        .await;

    let objects = Arc::new(MemoryObjectStore::default());
    let first = OpenLibraryProvider::new(down.uri(), rate_limited_uploader(objects.clone()));
    let second = OpenLibraryProvider::new(up.uri(), rate_limited_uploader(objects.clone()));
    let svc = service(
        books(1),
        vec![Arc::new(first), Arc::new(second)],
        fast_backfill_config(),
    );

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 1);
    let progress = svc.progress();
    let outcomes: Vec<_> = progress
        .last_completed_book_attempts
        .iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![SourceAttemptOutcome::Failure, SourceAttemptOutcome::Success]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_catalog_write_is_failure() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::Success);
    let repository = Arc::new(RecordingRepository {
        fail_success_writes: true,
        ..RecordingRepository::default()
    });
    let svc = service_recording(
        books(1),
        vec![a.clone()],
        BackfillConfig::default(),
        repository.clone(),
    );

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 0);
    assert_eq!(summary.no_cover_found, 1);
    let progress = svc.progress();
    let attempts = &progress.last_completed_book_attempts;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, SourceAttemptOutcome::Failure);
    assert!(
        attempts[0].detail.starts_with("Failed to record cover: Book "),
        "{}",
        attempts[0].detail
    );
    assert!(repository.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scripted_success_is_recorded_once() {
    let a = ScriptedProvider::always("A", SourceAttemptOutcome::NotFound);
    let b = ScriptedProvider::always("B", SourceAttemptOutcome::Success);
    let repository = Arc::new(RecordingRepository::default());
    let candidates = books(2);
    let ids: Vec<Uuid> = candidates.iter().map(|c| c.book_id).collect();
    let svc = service_recording(
        candidates,
        vec![a.clone(), b.clone()],
        BackfillConfig::default(),
        repository.clone(),
    );

    svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    let writes = repository.writes();
    assert_eq!(writes.len(), 2);
    for (write, id) in writes.iter().zip(&ids) {
        match write {
            Recorded::Success { book_id, source, url, .. } => {
                assert_eq!(book_id, id);
                assert_eq!(source, "B");
                assert!(url.starts_with("https://img.test/"));
            }
            other => panic!("unexpected write {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_stored_cover_is_written_to_catalog() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(cover_png()),
        )
        .mount(&server)
        .await;

    let objects = Arc::new(MemoryObjectStore::default());
    let repository = Arc::new(RecordingRepository::default());
    let provider = OpenLibraryProvider::new(server.uri(), rate_limited_uploader(objects.clone()));
    let candidates = books(1);
    let book = candidates[0].clone();
    let svc = service_recording(
        candidates,
        vec![Arc::new(provider)],
        fast_backfill_config(),
        repository.clone(),
    );

    let summary = svc.start(BackfillMode::Missing, 10).unwrap().await.unwrap();

    assert_eq!(summary.cover_found, 1);
    assert_eq!(objects.objects.lock().len(), 1);

    let writes = repository.writes();
    assert_eq!(writes.len(), 1);
    match &writes[0] {
        Recorded::Success {
            book_id,
            source,
            url,
            cover,
        } => {
            assert_eq!(*book_id, book.book_id);
            assert_eq!(source, "OPEN_LIBRARY");
            assert!(url.starts_with(&server.uri()), "{}", url);
            assert!(url.contains(book.lookup_key().unwrap()));
            assert_eq!(cover.storage_key, objects.objects.lock()[0].0);
            assert!(cover.storage_key.starts_with(&format!("covers/{}/", book.book_id)));
            assert_eq!((cover.width, cover.height), (400, 600));
        }
        other => panic!("unexpected write {:?}", other),
    }
}
