//! Longitood book cover lookup (`/bookcover/{isbn}` returning `{"url": ...}`)

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use super::{transport_failure, CoverProvider, CoverUploader, LONGITOOD};
use crate::covers::types::SourceAttemptResult;

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    url: Option<String>,
}

pub struct LongitoodProvider {
    http: reqwest::Client,
    base_url: String,
    uploader: CoverUploader,
}

impl LongitoodProvider {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, uploader: CoverUploader) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            uploader,
        }
    }

    async fn lookup(&self, lookup_key: &str) -> Result<Option<String>, SourceAttemptResult> {
        let url = format!("{}/bookcover/{}", self.base_url, lookup_key.trim());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_failure(&e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceAttemptResult::failure(format!("Lookup returned HTTP {}", status.as_u16())));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| SourceAttemptResult::failure(format!("Malformed lookup response: {}", e)))?;

        Ok(body.url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()))
    }
}

#[async_trait]
impl CoverProvider for LongitoodProvider {
    fn name(&self) -> &'static str {
        LONGITOOD
    }

    #[instrument(skip(self), fields(source = LONGITOOD))]
    async fn fetch_cover(&self, lookup_key: &str, book_id: Uuid) -> SourceAttemptResult {
        match self.lookup(lookup_key).await {
            Ok(Some(image_url)) => {
                self.uploader
                    .upload_with_retry(book_id, LONGITOOD, &image_url)
                    .await
            }
            Ok(None) => SourceAttemptResult::not_found("No cover URL returned"),
            Err(result) => result,
        }
    }
}
