//! Cover acquisition settings (`COVERS_*` environment variables)

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::retry::RetryPolicy;
use super::store::StoreLimits;
use crate::config::env_or;

pub const DEFAULT_PACING_MS: u64 = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_BATCH_COOLDOWN_SECS: u64 = 5;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_PAUSE_SECS: u64 = 300;
pub const DEFAULT_LIMIT: i64 = 100;
pub const DEFAULT_MAX_LIMIT: i64 = 5000;

pub const DEFAULT_UPLOAD_MAX_RETRIES: u32 = 3;
pub const DEFAULT_UPLOAD_BASE_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_UPLOAD_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_UPLOAD_ATTEMPT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MIN_DIMENSION: u32 = 20;

pub const DEFAULT_OPEN_LIBRARY_URL: &str = "https://covers.openlibrary.org";
pub const DEFAULT_GOOGLE_BOOKS_URL: &str = "https://www.googleapis.com";
pub const DEFAULT_LONGITOOD_URL: &str = "https://bookcover.longitood.com";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoversConfig {
    pub backfill: BackfillConfig,
    pub upload: UploadConfig,
    pub providers: ProviderConfig,
}

/// Pacing and circuit settings for the batch backfill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub pacing: Duration,
    pub batch_size: usize,
    pub batch_cooldown: Duration,
    pub failure_threshold: u32,
    pub pause_duration: Duration,
    pub default_limit: i64,
    pub max_limit: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(DEFAULT_PACING_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_cooldown: Duration::from_secs(DEFAULT_BATCH_COOLDOWN_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            pause_duration: Duration::from_secs(DEFAULT_PAUSE_SECS),
            default_limit: DEFAULT_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

impl BackfillConfig {
    /// Requested limit, defaulted and clamped to `1..=max_limit`
    pub fn effective_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

/// Event-triggered upload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
    pub max_image_bytes: u64,
    pub min_dimension: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_UPLOAD_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_UPLOAD_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_UPLOAD_MAX_BACKOFF_MS),
            attempt_timeout: Duration::from_secs(DEFAULT_UPLOAD_ATTEMPT_TIMEOUT_SECS),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            min_dimension: DEFAULT_MIN_DIMENSION,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_backoff, self.max_backoff)
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_image_bytes: self.max_image_bytes,
            min_dimension: self.min_dimension,
            download_timeout: self.attempt_timeout,
        }
    }
}

/// Provider endpoints and the rate-limit retry policy they share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub open_library_url: String,
    pub google_books_url: String,
    pub google_books_api_key: Option<String>,
    pub longitood_url: String,
    pub request_timeout: Duration,
    pub rate_limit_retries: u32,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            open_library_url: DEFAULT_OPEN_LIBRARY_URL.to_string(),
            google_books_url: DEFAULT_GOOGLE_BOOKS_URL.to_string(),
            google_books_api_key: None,
            longitood_url: DEFAULT_LONGITOOD_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_retries: 3,
            rate_limit_base_delay: Duration::from_secs(1),
            rate_limit_max_delay: Duration::from_secs(10),
        }
    }
}

impl ProviderConfig {
    pub fn rate_limit_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.rate_limit_retries,
            self.rate_limit_base_delay,
            self.rate_limit_max_delay,
        )
    }
}

fn env_url(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(name, default.as_millis() as u64))
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(name, default.as_secs()))
}

impl CoversConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            backfill: BackfillConfig {
                pacing: env_millis("COVERS_PACING_MS", defaults.backfill.pacing),
                batch_size: env_or("COVERS_BATCH_SIZE", defaults.backfill.batch_size),
                batch_cooldown: env_secs(
                    "COVERS_BATCH_COOLDOWN_SECS",
                    defaults.backfill.batch_cooldown,
                ),
                failure_threshold: env_or(
                    "COVERS_FAILURE_THRESHOLD",
                    defaults.backfill.failure_threshold,
                ),
                pause_duration: env_secs("COVERS_PAUSE_SECS", defaults.backfill.pause_duration),
                default_limit: env_or("COVERS_DEFAULT_LIMIT", defaults.backfill.default_limit),
                max_limit: env_or("COVERS_MAX_LIMIT", defaults.backfill.max_limit),
            },
            upload: UploadConfig {
                enabled: env_or("COVERS_UPLOAD_ENABLED", defaults.upload.enabled),
                max_retries: env_or("COVERS_UPLOAD_MAX_RETRIES", defaults.upload.max_retries),
                base_backoff: env_millis(
                    "COVERS_UPLOAD_BASE_BACKOFF_MS",
                    defaults.upload.base_backoff,
                ),
                max_backoff: env_millis("COVERS_UPLOAD_MAX_BACKOFF_MS", defaults.upload.max_backoff),
                attempt_timeout: env_secs(
                    "COVERS_UPLOAD_TIMEOUT_SECS",
                    defaults.upload.attempt_timeout,
                ),
                max_image_bytes: env_or("COVERS_MAX_IMAGE_BYTES", defaults.upload.max_image_bytes),
                min_dimension: env_or("COVERS_MIN_DIMENSION", defaults.upload.min_dimension),
            },
            providers: ProviderConfig {
                open_library_url: env_url("COVERS_OPEN_LIBRARY_URL", DEFAULT_OPEN_LIBRARY_URL),
                google_books_url: env_url("COVERS_GOOGLE_BOOKS_URL", DEFAULT_GOOGLE_BOOKS_URL),
                google_books_api_key: std::env::var("COVERS_GOOGLE_BOOKS_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                longitood_url: env_url("COVERS_LONGITOOD_URL", DEFAULT_LONGITOOD_URL),
                request_timeout: env_secs(
                    "COVERS_REQUEST_TIMEOUT_SECS",
                    defaults.providers.request_timeout,
                ),
                rate_limit_retries: env_or(
                    "COVERS_RATE_LIMIT_RETRIES",
                    defaults.providers.rate_limit_retries,
                ),
                rate_limit_base_delay: env_millis(
                    "COVERS_RATE_LIMIT_BASE_DELAY_MS",
                    defaults.providers.rate_limit_base_delay,
                ),
                rate_limit_max_delay: env_millis(
                    "COVERS_RATE_LIMIT_MAX_DELAY_MS",
                    defaults.providers.rate_limit_max_delay,
                ),
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backfill.batch_size == 0 {
            anyhow::bail!("COVERS_BATCH_SIZE must be greater than 0");
        }
        if self.backfill.failure_threshold == 0 {
            anyhow::bail!("COVERS_FAILURE_THRESHOLD must be greater than 0");
        }
        if self.backfill.max_limit < 1 {
            anyhow::bail!("COVERS_MAX_LIMIT must be at least 1");
        }
        if self.upload.base_backoff > self.upload.max_backoff {
            anyhow::bail!(
                "Upload base backoff ({:?}) cannot exceed max backoff ({:?})",
                self.upload.base_backoff,
                self.upload.max_backoff
            );
        }
        if self.upload.attempt_timeout.is_zero() || self.providers.request_timeout.is_zero() {
            anyhow::bail!("Cover timeouts must be greater than 0");
        }
        Ok(())
    }
}
