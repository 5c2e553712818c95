//! Open Library covers API
//!
//! Cover URLs are built directly from the ISBN; `default=false` makes the API
//! answer 404 instead of serving a blank placeholder.

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use super::{CoverProvider, CoverUploader, OPEN_LIBRARY};
use crate::covers::types::SourceAttemptResult;

pub struct OpenLibraryProvider {
    base_url: String,
    uploader: CoverUploader,
}

impl OpenLibraryProvider {
    pub fn new(base_url: impl Into<String>, uploader: CoverUploader) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            uploader,
        }
    }

    pub fn cover_url(&self, lookup_key: &str) -> String {
        format!(
            "{}/b/isbn/{}-L.jpg?default=false",
            self.base_url,
            lookup_key.trim()
        )
    }
}

#[async_trait]
impl CoverProvider for OpenLibraryProvider {
    fn name(&self) -> &'static str {
        OPEN_LIBRARY
    }

    #[instrument(skip(self), fields(source = OPEN_LIBRARY))]
    async fn fetch_cover(&self, lookup_key: &str, book_id: Uuid) -> SourceAttemptResult {
        let url = self.cover_url(lookup_key);
        self.uploader
            .upload_with_retry(book_id, OPEN_LIBRARY, &url)
            .await
    }
}
