//! Event-triggered cover uploads
//!
//! When an ingested book arrives with a cover URL, the coordinator downloads
//! and stores it in the background with bounded retries, then writes either the
//! stored cover metadata or a short failure reason to the catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::UploadConfig;
use super::repository::{CoverRepository, RepositoryError};
use super::retry::{retry_with_backoff, RetryPolicy};
use super::store::{CoverStore, CoverStoreError, CoverStoreRequest, FailureKind};
use super::types::{select_canonical_image, StoredCover};

/// A book record was written or updated by ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookUpsertedEvent {
    pub book_id: Option<Uuid>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_links: Option<HashMap<String, String>>,
    pub source: String,
}

impl BookUpsertedEvent {
    /// Explicit URL first, otherwise the best of the size variants
    pub fn canonical_image_url(&self) -> Option<String> {
        self.image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.image_links
                    .as_ref()
                    .and_then(select_canonical_image)
                    .map(str::to_string)
            })
    }
}

/// Why an event did not lead to an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    MissingBookId,
    MissingImageUrl,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "uploads disabled",
            SkipReason::MissingBookId => "missing book id",
            SkipReason::MissingImageUrl => "no usable image url",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoverUploadError {
    /// Upload failed after classification. `suppressed` carries a failure
    /// to record the reason itself.
    #[error("Cover upload failed ({}): {source}", .kind.as_str())]
    Upload {
        kind: FailureKind,
        #[source]
        source: CoverStoreError,
        suppressed: Option<RepositoryError>,
    },

    #[error("Upload succeeded without a storage key")]
    MissingStorageKey,

    #[error("Cover stored but persisting metadata failed: {0}")]
    Persist(#[source] RepositoryError),
}

impl CoverUploadError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CoverUploadError::Upload { kind, .. } => *kind,
            _ => FailureKind::Unexpected,
        }
    }

    pub fn suppressed(&self) -> Option<&RepositoryError> {
        match self {
            CoverUploadError::Upload { suppressed, .. } => suppressed.as_ref(),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct CoverUploadCoordinator {
    store: Arc<dyn CoverStore>,
    repository: Arc<dyn CoverRepository>,
    config: UploadConfig,
}

impl CoverUploadCoordinator {
    pub fn new(
        store: Arc<dyn CoverStore>,
        repository: Arc<dyn CoverRepository>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            repository,
            config,
        }
    }

    /// Check whether `event` warrants an upload, returning the book id and URL
    pub fn accept(&self, event: &BookUpsertedEvent) -> Result<(Uuid, String), SkipReason> {
        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }
        let book_id = event.book_id.ok_or(SkipReason::MissingBookId)?;
        let url = event.canonical_image_url().ok_or(SkipReason::MissingImageUrl)?;
        Ok((book_id, url))
    }

    /// Schedule a background upload for `event`.
    ///
    /// Returns `None` (after logging) when the event is a no-op.
    pub fn on_book_upserted(
        &self,
        event: BookUpsertedEvent,
    ) -> Option<JoinHandle<Result<StoredCover, CoverUploadError>>> {
        let (book_id, url) = match self.accept(&event) {
            Ok(accepted) => accepted,
            Err(reason) => {
                debug!(book_id = ?event.book_id, source = %event.source, reason = reason.as_str(), "Skipping cover upload");
                return None;
            }
        };

        let coordinator = self.clone();
        Some(tokio::spawn(async move {
            coordinator.upload(book_id, &event.source, &url).await
        }))
    }

    /// Download, store, and persist one cover
    #[instrument(skip(self))]
    pub async fn upload(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<StoredCover, CoverUploadError> {
        let started = Instant::now();
        metrics::counter!("cover_upload_attempts_total").increment(1);

        let result = self.store_with_retry(book_id, source, url).await;
        metrics::histogram!("cover_upload_duration_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(stored) => self.persist_success(book_id, source, url, stored).await,
            Err(err) => Err(self.handle_failure(book_id, source, url, err).await),
        };

        match &outcome {
            Ok(stored) => {
                metrics::counter!("cover_upload_success_total").increment(1);
                info!(key = %stored.storage_key, "Cover uploaded");
            }
            Err(e) => {
                metrics::counter!("cover_upload_failure_total", "reason" => e.failure_kind().as_str())
                    .increment(1);
            }
        }

        outcome
    }

    fn policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    async fn store_with_retry(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<StoredCover, CoverStoreError> {
        let timeout = self.config.attempt_timeout;
        let request = CoverStoreRequest::new(book_id, url, source);

        retry_with_backoff(
            &self.policy(),
            |attempt| {
                let request = request.clone();
                async move {
                    debug!(attempt, "Cover upload attempt");
                    match tokio::time::timeout(timeout, self.store.store_from_url(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(CoverStoreError::Timeout(timeout)),
                    }
                }
            },
            CoverStoreError::is_retryable,
            |retry, delay, e| {
                metrics::counter!("cover_upload_retries_total").increment(1);
                warn!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying cover upload"
                );
            },
        )
        .await
    }

    async fn persist_success(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        stored: StoredCover,
    ) -> Result<StoredCover, CoverUploadError> {
        if stored.storage_key.trim().is_empty() {
            error!("Cover store returned no storage key");
            return Err(CoverUploadError::MissingStorageKey);
        }

        self.repository
            .record_success(book_id, source, url, &stored)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist stored cover");
                CoverUploadError::Persist(e)
            })?;

        Ok(stored)
    }

    async fn handle_failure(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        err: CoverStoreError,
    ) -> CoverUploadError {
        let kind = err.failure_kind();

        if !kind.is_recordable() {
            warn!(kind = kind.as_str(), error = %err, "Cover upload failed; not recorded");
            return CoverUploadError::Upload {
                kind,
                source: err,
                suppressed: None,
            };
        }

        warn!(kind = kind.as_str(), error = %err, "Cover upload failed");

        let suppressed = match self.repository.record_failure(book_id, source, url, kind.as_str()).await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Failed to record cover failure reason");
                Some(e)
            }
        };

        CoverUploadError::Upload {
            kind,
            source: err,
            suppressed,
        }
    }
}
