//! Cover acquisition
//!
//! Two paths share the same storage and persistence collaborators:
//!
//! - [`backfill::BackfillService`] walks catalog candidates and queries the
//!   external providers in priority order, one candidate at a time.
//! - [`coordinator::CoverUploadCoordinator`] reacts to ingestion events that
//!   already carry an image URL and uploads it in the background.
//!
//! Status of the running backfill is published through
//! [`progress::ProgressTracker`].

pub mod backfill;
pub mod breaker;
pub mod candidates;
pub mod config;
pub mod coordinator;
pub mod imaging;
pub mod progress;
pub mod repository;
pub mod retry;
pub mod sources;
pub mod store;
pub mod types;

use std::sync::Arc;

use self::config::ProviderConfig;
use self::sources::{
    CoverProvider, CoverUploader, GoogleBooksProvider, LongitoodProvider, OpenLibraryProvider,
};
use self::store::CoverStore;

pub use backfill::{BackfillError, BackfillService, RunSummary};
pub use coordinator::{BookUpsertedEvent, CoverUploadCoordinator, CoverUploadError};
pub use progress::{BackfillProgress, ProgressTracker};
pub use types::{BackfillMode, Candidate, SourceAttemptOutcome, SourceAttemptStatus, StoredCover};

/// Providers in priority order: Open Library, Google Books, Longitood
pub fn default_providers(
    config: &ProviderConfig,
    http: reqwest::Client,
    store: Arc<dyn CoverStore>,
) -> Vec<Arc<dyn CoverProvider>> {
    let uploader = CoverUploader::new(store, config.rate_limit_policy());

    vec![
        Arc::new(OpenLibraryProvider::new(&config.open_library_url, uploader.clone())),
        Arc::new(GoogleBooksProvider::new(
            http.clone(),
            &config.google_books_url,
            config.google_books_api_key.clone(),
            uploader.clone(),
        )),
        Arc::new(LongitoodProvider::new(http, &config.longitood_url, uploader)),
    ]
}
