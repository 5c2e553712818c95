//! Google Books volumes search
//!
//! Searches by ISBN and picks the largest image link across returned volumes.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use super::{transport_failure, CoverProvider, CoverUploader, GOOGLE_BOOKS};
use crate::covers::types::{SourceAttemptResult, IMAGE_SIZE_PREFERENCE};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    #[serde(default)]
    volume_info: Option<VolumeInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    #[serde(default)]
    image_links: HashMap<String, String>,
}

pub struct GoogleBooksProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    uploader: CoverUploader,
}

impl GoogleBooksProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        uploader: CoverUploader,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            uploader,
        }
    }

    async fn search(&self, lookup_key: &str) -> Result<VolumesResponse, SourceAttemptResult> {
        let mut query = vec![("q", format!("isbn:{}", lookup_key.trim()))];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }

        let response = self
            .http
            .get(format!("{}/books/v1/volumes", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_failure(&e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceAttemptResult::failure("Volumes search rate limited (HTTP 429)"));
        }
        if !status.is_success() {
            return Err(SourceAttemptResult::failure(format!(
                "Volumes search returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SourceAttemptResult::failure(format!("Malformed volumes response: {}", e)))
    }
}

/// Largest image link across all volumes
fn best_image(volumes: &VolumesResponse) -> Option<String> {
    IMAGE_SIZE_PREFERENCE.iter().find_map(|size| {
        volumes
            .items
            .iter()
            .filter_map(|volume| volume.volume_info.as_ref())
            .filter_map(|info| info.image_links.get(*size))
            .map(|url| url.trim())
            .find(|url| !url.is_empty())
            .map(normalize_image_url)
    })
}

/// Force https and drop the page-curl decoration Google adds to thumbnails
pub fn normalize_image_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "edge")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}

#[async_trait]
impl CoverProvider for GoogleBooksProvider {
    fn name(&self) -> &'static str {
        GOOGLE_BOOKS
    }

    #[instrument(skip(self), fields(source = GOOGLE_BOOKS))]
    async fn fetch_cover(&self, lookup_key: &str, book_id: Uuid) -> SourceAttemptResult {
        let volumes = match self.search(lookup_key).await {
            Ok(volumes) => volumes,
            Err(result) => return result,
        };

        if volumes.items.is_empty() {
            return SourceAttemptResult::not_found("No volumes matched");
        }

        match best_image(&volumes) {
            Some(image_url) => {
                self.uploader
                    .upload_with_retry(book_id, GOOGLE_BOOKS, &image_url)
                    .await
            }
            None => SourceAttemptResult::not_found("Volumes have no image links"),
        }
    }
}
