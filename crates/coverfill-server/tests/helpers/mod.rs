//! Test helpers for Coverfill server integration tests
//!
//! In-memory stand-ins for the catalog, object storage, and cover repository,
//! plus a PNG builder for serving images from wiremock.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use coverfill_server::covers::{
    candidates::CandidateSelector,
    config::BackfillConfig,
    repository::{CoverRepository, RepositoryError},
    store::{S3CoverStore, StoreLimits, UrlGuard},
    BackfillMode, Candidate, StoredCover,
};
use coverfill_server::storage::{ObjectStore, UploadResult};

/// Encode a solid-color PNG
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("Failed to encode PNG");
    out.into_inner()
}

/// A colorful cover large enough to pass inspection
pub fn cover_png() -> Vec<u8> {
    png_bytes(400, 600, [200, 40, 40])
}

pub fn candidate(title: &str, isbn13: Option<&str>) -> Candidate {
    Candidate {
        book_id: Uuid::new_v4(),
        title: Some(title.to_string()),
        isbn13: isbn13.map(String::from),
        isbn10: None,
    }
}

/// Backfill settings with no waiting, for real-clock tests
pub fn fast_backfill_config() -> BackfillConfig {
    BackfillConfig {
        pacing: Duration::ZERO,
        batch_cooldown: Duration::ZERO,
        ..BackfillConfig::default()
    }
}

/// Candidate selector over a fixed list
pub struct FixedSelector {
    candidates: Vec<Candidate>,
    pub requests: Mutex<Vec<(BackfillMode, i64)>>,
}

impl FixedSelector {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CandidateSelector for FixedSelector {
    async fn query_candidates(
        &self,
        mode: BackfillMode,
        limit: i64,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        self.requests.lock().push((mode, limit));
        if limit <= 0 {
            return Ok(Vec::new());
        }
        Ok(self.candidates.iter().take(limit as usize).cloned().collect())
    }
}

/// Object storage that keeps everything in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<Vec<(String, usize, Option<String>)>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<String>,
    ) -> anyhow::Result<UploadResult> {
        let size = data.len();
        self.objects
            .lock()
            .push((key.to_string(), size, content_type));
        Ok(UploadResult {
            key: key.to_string(),
            checksum: String::new(),
            size: size as i64,
        })
    }

    fn resolve_url(&self, key: &str) -> String {
        format!("https://cdn.test/{}", key)
    }
}

/// Host wiremock servers bind to
pub const MOCK_HOST: &str = "127.0.0.1";

/// S3 cover store backed by memory that may fetch from a local mock server
pub fn local_cover_store(objects: Arc<MemoryObjectStore>) -> S3CoverStore {
    S3CoverStore::new(
        Some(objects as Arc<dyn ObjectStore>),
        StoreLimits {
            download_timeout: Duration::from_secs(5),
            ..StoreLimits::default()
        },
        UrlGuard::trusting([MOCK_HOST]),
    )
    .expect("Failed to build cover store")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Success {
        book_id: Uuid,
        source: String,
        url: String,
        cover: StoredCover,
    },
    Failure {
        book_id: Uuid,
        source: String,
        url: String,
        reason: String,
    },
}

/// Cover repository that records writes, optionally failing them
#[derive(Default)]
pub struct RecordingRepository {
    pub writes: Mutex<Vec<Recorded>>,
    pub fail_success_writes: bool,
    pub fail_failure_writes: bool,
}

impl RecordingRepository {
    pub fn writes(&self) -> Vec<Recorded> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl CoverRepository for RecordingRepository {
    async fn record_success(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        cover: &StoredCover,
    ) -> Result<(), RepositoryError> {
        if self.fail_success_writes {
            return Err(RepositoryError::UnknownBook(book_id));
        }
        self.writes.lock().push(Recorded::Success {
            book_id,
            source: source.to_string(),
            url: url.to_string(),
            cover: cover.clone(),
        });
        Ok(())
    }

    async fn record_failure(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        if self.fail_failure_writes {
            return Err(RepositoryError::UnknownBook(book_id));
        }
        self.writes.lock().push(Recorded::Failure {
            book_id,
            source: source.to_string(),
            url: url.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
