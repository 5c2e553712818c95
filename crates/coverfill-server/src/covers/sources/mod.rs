//! External cover providers
//!
//! Each provider turns a lookup key into at most one image URL and hands it to
//! the shared [`CoverUploader`]. Providers never return errors; every failure is
//! folded into a [`SourceAttemptResult`].

use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::retry::{retry_with_backoff, RetryPolicy};
use super::store::{CoverStore, CoverStoreRequest};
use super::types::SourceAttemptResult;

pub mod google_books;
pub mod longitood;
pub mod open_library;

pub use google_books::GoogleBooksProvider;
pub use longitood::LongitoodProvider;
pub use open_library::OpenLibraryProvider;

pub const OPEN_LIBRARY: &str = "OPEN_LIBRARY";
pub const GOOGLE_BOOKS: &str = "GOOGLE_BOOKS";
pub const LONGITOOD: &str = "LONGITOOD";

pub(crate) const USER_AGENT: &str = concat!("coverfill/", env!("CARGO_PKG_VERSION"));

/// One external cover service
#[async_trait]
pub trait CoverProvider: Send + Sync {
    /// Stable source label, also used as the circuit-breaker key
    fn name(&self) -> &'static str;

    async fn fetch_cover(&self, lookup_key: &str, book_id: Uuid) -> SourceAttemptResult;
}

/// Build the HTTP client shared by provider lookups
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Deepest non-blank message in an error's source chain
pub fn innermost_message(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !text.trim().is_empty() {
            message = text;
        }
        current = source.source();
    }
    message.trim().to_string()
}

/// Upload with rate-limit retries, shared by all providers
#[derive(Clone)]
pub struct CoverUploader {
    store: Arc<dyn CoverStore>,
    policy: RetryPolicy,
}

impl CoverUploader {
    pub fn new(store: Arc<dyn CoverStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Store `image_url` for `book_id`, retrying only on rate limits.
    ///
    /// Not-found and "no usable cover" map to NOT_FOUND; everything else that
    /// survives the retries is a FAILURE.
    pub async fn upload_with_retry(
        &self,
        book_id: Uuid,
        source: &str,
        image_url: &str,
    ) -> SourceAttemptResult {
        let request = CoverStoreRequest::new(book_id, image_url, source);
        let mut backoffs: Vec<Duration> = Vec::new();

        let result = retry_with_backoff(
            &self.policy,
            |_| self.store.store_from_url(request.clone()),
            |e| e.is_rate_limited(),
            |retry, delay, e| {
                warn!(
                    book_id = %book_id,
                    source = source,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Rate limited, backing off"
                );
                backoffs.push(delay);
            },
        )
        .await;

        let retry_note = if backoffs.is_empty() {
            String::new()
        } else {
            format!(
                " after {} rate-limit {} ({})",
                backoffs.len(),
                if backoffs.len() == 1 { "retry" } else { "retries" },
                backoffs
                    .iter()
                    .map(|d| format!("{}ms", d.as_millis()))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        match result {
            Ok(stored) => {
                debug!(book_id = %book_id, source, key = %stored.storage_key, "Cover stored");
                let detail = format!(
                    "Stored {} ({}x{}){}",
                    stored.storage_key, stored.width, stored.height, retry_note
                );
                SourceAttemptResult::success(detail, image_url, stored)
            }
            Err(e) if e.is_not_found() => {
                SourceAttemptResult::not_found(format!("{}{}", e, retry_note))
            }
            Err(e) => {
                let message = innermost_message(&e);
                let message = if message.is_empty() {
                    "upload failed".to_string()
                } else {
                    message
                };
                SourceAttemptResult::failure(format!("{}{}", message, retry_note))
            }
        }
    }
}

/// Map a provider lookup transport error to a FAILURE detail
pub(crate) fn transport_failure(err: &reqwest::Error) -> SourceAttemptResult {
    if err.is_timeout() {
        SourceAttemptResult::failure("Request timed out")
    } else {
        SourceAttemptResult::failure(innermost_message(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covers::store::CoverStoreError;
    use crate::covers::types::{SourceAttemptOutcome, StoredCover};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset by peer")]
    struct Inner;

    struct ScriptedStore {
        responses: Mutex<VecDeque<Result<StoredCover, CoverStoreError>>>,
    }

    #[async_trait]
    impl CoverStore for ScriptedStore {
        async fn store_from_url(
            &self,
            _request: CoverStoreRequest,
        ) -> Result<StoredCover, CoverStoreError> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(CoverStoreError::Unexpected("script exhausted".into())))
        }
    }

    fn uploader(responses: Vec<Result<StoredCover, CoverStoreError>>) -> CoverUploader {
        CoverUploader::new(
            Arc::new(ScriptedStore {
                responses: Mutex::new(responses.into()),
            }),
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    fn stored() -> StoredCover {
        StoredCover {
            storage_key: "covers/x/open_library-abc.jpg".into(),
            resolved_url: "s3://covers/covers/x/open_library-abc.jpg".into(),
            width: 400,
            height: 600,
            grayscale: false,
            source: OPEN_LIBRARY.into(),
        }
    }

    fn rate_limited() -> Result<StoredCover, CoverStoreError> {
        Err(CoverStoreError::RateLimited {
            status: 429,
            message: "slow down".into(),
        })
    }

    #[test]
    fn test_innermost_message() {
        assert_eq!(innermost_message(&Outer(Inner)), "connection reset by peer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let result = uploader(vec![rate_limited(), rate_limited(), Ok(stored())])
            .upload_with_retry(Uuid::new_v4(), OPEN_LIBRARY, "https://img/1.jpg")
            .await;

        assert_eq!(result.outcome, SourceAttemptOutcome::Success);
        assert!(result.detail.contains("after 2 rate-limit retries (100ms, 200ms)"));
        assert_eq!(result.stored, Some(stored()));
        assert_eq!(result.image_url.as_deref(), Some("https://img/1.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rate_limit_fails_after_ceiling() {
        let result = uploader(vec![rate_limited(); 4])
            .upload_with_retry(Uuid::new_v4(), OPEN_LIBRARY, "https://img/1.jpg")
            .await;

        assert_eq!(result.outcome, SourceAttemptOutcome::Failure);
        assert!(result.detail.contains("after 3 rate-limit retries"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_and_placeholder_map_to_not_found() {
        let result = uploader(vec![Err(CoverStoreError::NotFound)])
            .upload_with_retry(Uuid::new_v4(), OPEN_LIBRARY, "https://img/1.jpg")
            .await;
        assert_eq!(result.outcome, SourceAttemptOutcome::NotFound);

        let result = uploader(vec![Err(CoverStoreError::NoUsableCover("1x1".into()))])
            .upload_with_retry(Uuid::new_v4(), OPEN_LIBRARY, "https://img/1.jpg")
            .await;
        assert_eq!(result.outcome, SourceAttemptOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let result = uploader(vec![
            Err(CoverStoreError::Processing("corrupt jpeg".into())),
            Ok(stored()),
        ])
        .upload_with_retry(Uuid::new_v4(), OPEN_LIBRARY, "https://img/1.jpg")
        .await;

        assert_eq!(result.outcome, SourceAttemptOutcome::Failure);
        assert!(result.detail.contains("corrupt jpeg"));
    }
}
