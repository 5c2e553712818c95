//! Cover storage collaborator
//!
//! A [`CoverStore`] turns a remote image URL into a stored cover: screen the
//! URL, download, inspect, and write the bytes to object storage. Every failure
//! comes back as one [`CoverStoreError`] variant so callers classify by pattern
//! match instead of inspecting messages.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::{Host, Url};
use uuid::Uuid;

use super::imaging::{self, InspectError};
use super::sources::USER_AGENT;
use super::types::StoredCover;
use crate::storage::{cover_key, ObjectStore};

/// Request to fetch and store one cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverStoreRequest {
    pub book_id: Uuid,
    pub image_url: String,
    /// Source label recorded with the cover (e.g. `GOOGLE_BOOKS`)
    pub source: String,
    /// Expected size in bytes, when the caller already knows it
    pub size_hint: Option<u64>,
    pub content_type_hint: Option<String>,
}

impl CoverStoreRequest {
    pub fn new(book_id: Uuid, image_url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            book_id,
            image_url: image_url.into(),
            source: source.into(),
            size_hint: None,
            content_type_hint: None,
        }
    }
}

/// Failure categories that the upload coordinator distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    DownloadFailed,
    ProcessingFailed,
    TooLarge,
    UnsafeUrl,
    RuntimeSkip,
    Unexpected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DownloadFailed => "download_failed",
            FailureKind::ProcessingFailed => "processing_failed",
            FailureKind::TooLarge => "too_large",
            FailureKind::UnsafeUrl => "unsafe_url",
            FailureKind::RuntimeSkip => "runtime_skip",
            FailureKind::Unexpected => "unexpected",
        }
    }

    /// Whether this kind is written back to the catalog as a download error
    pub fn is_recordable(&self) -> bool {
        matches!(
            self,
            FailureKind::DownloadFailed
                | FailureKind::ProcessingFailed
                | FailureKind::TooLarge
                | FailureKind::UnsafeUrl
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoverStoreError {
    #[error("Download failed: {message}")]
    Download {
        message: String,
        status: Option<u16>,
        retryable: bool,
    },

    #[error("Rate limited (HTTP {status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Image not found")]
    NotFound,

    #[error("No usable cover: {0}")]
    NoUsableCover(String),

    #[error("Image processing failed: {0}")]
    Processing(String),

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unsafe image URL: {0}")]
    UnsafeUrl(String),

    #[error("Cover storage unavailable: {0}")]
    Runtime(String),

    #[error("Object storage write failed: {0}")]
    Storage(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl CoverStoreError {
    /// Transient I/O, timeouts, and rate limits are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CoverStoreError::Download { retryable, .. } => *retryable,
            CoverStoreError::RateLimited { .. }
            | CoverStoreError::Timeout(_)
            | CoverStoreError::Storage(_) => true,
            _ => false,
        }
    }

    /// Rate limit detected by status code, or by message for errors that only
    /// carry upstream text
    pub fn is_rate_limited(&self) -> bool {
        match self {
            CoverStoreError::RateLimited { .. } => true,
            CoverStoreError::Download { status: Some(429), .. } => true,
            CoverStoreError::Download { message, .. } => looks_rate_limited(message),
            _ => false,
        }
    }

    /// Provider confirmed there is nothing to store
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoverStoreError::NotFound | CoverStoreError::NoUsableCover(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CoverStoreError::Download { .. }
            | CoverStoreError::RateLimited { .. }
            | CoverStoreError::Timeout(_)
            | CoverStoreError::NotFound => FailureKind::DownloadFailed,
            CoverStoreError::NoUsableCover(_) | CoverStoreError::Processing(_) => {
                FailureKind::ProcessingFailed
            }
            CoverStoreError::TooLarge { .. } => FailureKind::TooLarge,
            CoverStoreError::UnsafeUrl(_) => FailureKind::UnsafeUrl,
            CoverStoreError::Runtime(_) => FailureKind::RuntimeSkip,
            CoverStoreError::Storage(_) | CoverStoreError::Unexpected(_) => {
                FailureKind::Unexpected
            }
        }
    }
}

fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
}

/// Store a remote image as a cover
#[async_trait]
pub trait CoverStore: Send + Sync {
    async fn store_from_url(&self, request: CoverStoreRequest) -> Result<StoredCover, CoverStoreError>;
}

#[async_trait]
impl<T: CoverStore + ?Sized> CoverStore for Arc<T> {
    async fn store_from_url(&self, request: CoverStoreRequest) -> Result<StoredCover, CoverStoreError> {
        (**self).store_from_url(request).await
    }
}

/// Most redirects followed for one image download
pub const MAX_REDIRECTS: usize = 5;

/// Screens image URLs before download and on every redirect hop.
///
/// Only `http`/`https` URLs pass. Hosts that name loopback, private,
/// link-local, shared or unspecified addresses are rejected unless they are in
/// the trusted host list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlGuard {
    trusted_hosts: Vec<String>,
}

impl UrlGuard {
    /// Exempt exact host names (e.g. a local mirror) from the address checks
    pub fn trusting<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_hosts: hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn screen(&self, raw: &str) -> Result<Url, CoverStoreError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| CoverStoreError::UnsafeUrl(format!("{}: {}", raw, e)))?;
        self.check(&url)?;
        Ok(url)
    }

    fn check(&self, url: &Url) -> Result<(), CoverStoreError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoverStoreError::UnsafeUrl(format!(
                "scheme '{}' not allowed",
                url.scheme()
            )));
        }

        let trusted = url
            .host_str()
            .map(|host| host.to_ascii_lowercase())
            .is_some_and(|host| self.trusted_hosts.iter().any(|t| *t == host));
        if trusted {
            return Ok(());
        }

        match url.host() {
            None => Err(CoverStoreError::UnsafeUrl("missing host".to_string())),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    Err(CoverStoreError::UnsafeUrl(format!("host '{}' not allowed", domain)))
                } else {
                    Ok(())
                }
            }
            Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
        }
    }

    /// Redirect policy that re-screens every hop
    pub fn redirect_policy(&self) -> reqwest::redirect::Policy {
        let guard = self.clone();
        reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error(CoverStoreError::Download {
                    message: format!("more than {} redirects", MAX_REDIRECTS),
                    status: None,
                    retryable: false,
                })
            } else if let Err(e) = guard.check(attempt.url()) {
                attempt.error(e)
            } else {
                attempt.follow()
            }
        })
    }
}

/// Screen a URL with no trusted hosts
pub fn screen_url(raw: &str) -> Result<Url, CoverStoreError> {
    UrlGuard::default().screen(raw)
}

fn check_ip(ip: IpAddr) -> Result<(), CoverStoreError> {
    let internal = match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        },
    };

    if internal {
        Err(CoverStoreError::UnsafeUrl(format!("address {} not allowed", ip)))
    } else {
        Ok(())
    }
}

fn is_internal_v4(v4: Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

/// Limits applied while fetching and inspecting a cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_image_bytes: u64,
    pub min_dimension: u32,
    pub download_timeout: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024,
            min_dimension: 20,
            download_timeout: Duration::from_secs(30),
        }
    }
}

/// Production store: reqwest download, `image` inspection, S3 upload
#[derive(Clone)]
pub struct S3CoverStore {
    http: reqwest::Client,
    objects: Option<Arc<dyn ObjectStore>>,
    limits: StoreLimits,
    guard: UrlGuard,
}

impl S3CoverStore {
    /// `objects` is `None` when no bucket is configured; every store then
    /// fails with [`CoverStoreError::Runtime`].
    ///
    /// The download client is built here so `guard` also screens redirects.
    pub fn new(
        objects: Option<Arc<dyn ObjectStore>>,
        limits: StoreLimits,
        guard: UrlGuard,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(guard.redirect_policy())
            .build()?;

        Ok(Self {
            http,
            objects,
            limits,
            guard,
        })
    }

    async fn download(&self, url: Url, size_hint: Option<u64>) -> Result<Vec<u8>, CoverStoreError> {
        let limit = self.limits.max_image_bytes;
        if let Some(size) = size_hint.filter(|size| *size > limit) {
            return Err(CoverStoreError::TooLarge { size, limit });
        }

        let response = self.http.get(url.clone()).send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(CoverStoreError::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CoverStoreError::RateLimited {
                status: status.as_u16(),
                message: format!("{} responded {}", url.host_str().unwrap_or_default(), status),
            });
        }
        if !status.is_success() {
            return Err(CoverStoreError::Download {
                message: format!("{} responded {}", url.host_str().unwrap_or_default(), status),
                status: Some(status.as_u16()),
                retryable: status.is_server_error(),
            });
        }

        if let Some(size) = response.content_length().filter(|size| *size > limit) {
            return Err(CoverStoreError::TooLarge { size, limit });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            body.extend_from_slice(&chunk);
            if body.len() as u64 > limit {
                return Err(CoverStoreError::TooLarge {
                    size: body.len() as u64,
                    limit,
                });
            }
        }

        Ok(body)
    }
}

#[async_trait]
impl CoverStore for S3CoverStore {
    #[instrument(skip(self, request), fields(book_id = %request.book_id, source = %request.source))]
    async fn store_from_url(&self, request: CoverStoreRequest) -> Result<StoredCover, CoverStoreError> {
        let objects = self
            .objects
            .as_ref()
            .ok_or_else(|| CoverStoreError::Runtime("no storage bucket configured".to_string()))?;

        let url = self.guard.screen(&request.image_url)?;

        let bytes = tokio::time::timeout(
            self.limits.download_timeout,
            self.download(url, request.size_hint),
        )
        .await
        .map_err(|_| CoverStoreError::Timeout(self.limits.download_timeout))??;

        let inspected = imaging::inspect(&bytes, self.limits.min_dimension).map_err(|e| match e {
            InspectError::Placeholder { .. } => CoverStoreError::NoUsableCover(e.to_string()),
            other => CoverStoreError::Processing(other.to_string()),
        })?;

        let key = cover_key(request.book_id, &request.source, &bytes, inspected.extension);
        debug!(key = %key, width = inspected.width, height = inspected.height, "Uploading cover");

        let content_type = request
            .content_type_hint
            .unwrap_or_else(|| inspected.content_type.to_string());
        let uploaded = objects
            .put_object(&key, bytes, Some(content_type))
            .await
            .map_err(|e| CoverStoreError::Storage(format!("{:#}", e)))?;

        Ok(StoredCover {
            resolved_url: objects.resolve_url(&uploaded.key),
            storage_key: uploaded.key,
            width: inspected.width,
            height: inspected.height,
            grayscale: inspected.grayscale,
            source: request.source,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CoverStoreError {
    if err.is_redirect() {
        if let Some(rejected) = rejected_redirect(&err) {
            return rejected;
        }
    }
    if err.is_timeout() {
        return CoverStoreError::Download {
            message: err.to_string(),
            status: None,
            retryable: true,
        };
    }
    let status = err.status().map(|s| s.as_u16());
    CoverStoreError::Download {
        message: err.to_string(),
        status,
        retryable: err.is_connect() || err.is_request() || err.is_body(),
    }
}

/// The guard's own error, carried in the redirect error's source chain
fn rejected_redirect(err: &reqwest::Error) -> Option<CoverStoreError> {
    let mut current = StdError::source(err);
    while let Some(source) = current {
        if let Some(e) = source.downcast_ref::<CoverStoreError>() {
            return Some(e.clone());
        }
        current = source.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_url_accepts_public_hosts() {
        assert!(screen_url("https://covers.openlibrary.org/b/isbn/9780000000001-L.jpg").is_ok());
        assert!(screen_url("http://93.184.216.34/cover.jpg").is_ok());
        assert!(screen_url("http://100.128.0.1/cover.jpg").is_ok());
        assert!(screen_url("http://[::ffff:93.184.216.34]/cover.jpg").is_ok());
    }

    #[test]
    fn test_trusted_hosts_skip_address_checks_only() {
        let guard = UrlGuard::trusting(["127.0.0.1"]);
        assert!(guard.screen("http://127.0.0.1:9000/cover.jpg").is_ok());
        assert!(matches!(
            guard.screen("http://10.0.0.8/cover.jpg"),
            Err(CoverStoreError::UnsafeUrl(_))
        ));
        assert!(matches!(
            guard.screen("file://127.0.0.1/etc/passwd"),
            Err(CoverStoreError::UnsafeUrl(_))
        ));
    }

    #[test]
    fn test_screen_url_rejects_internal_targets() {
        for url in [
            "file:///etc/passwd",
            "ftp://example.com/cover.jpg",
            "http://localhost/cover.jpg",
            "http://127.0.0.1:9000/cover.jpg",
            "http://10.0.0.8/cover.jpg",
            "http://192.168.1.1/cover.jpg",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/cover.jpg",
            "http://[::ffff:127.0.0.1]/cover.jpg",
            "http://[::ffff:169.254.169.254]/latest/meta-data",
            "http://[::ffff:10.1.2.3]/cover.jpg",
            "http://0.1.2.3/cover.jpg",
            "http://100.64.0.1/cover.jpg",
            "http://100.127.255.254/cover.jpg",
            "not a url",
        ] {
            assert!(
                matches!(screen_url(url), Err(CoverStoreError::UnsafeUrl(_))),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoverStoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CoverStoreError::RateLimited {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(CoverStoreError::Download {
            message: "bad gateway".into(),
            status: Some(502),
            retryable: true
        }
        .is_retryable());
        assert!(!CoverStoreError::Download {
            message: "forbidden".into(),
            status: Some(403),
            retryable: false
        }
        .is_retryable());
        assert!(!CoverStoreError::Processing("bad".into()).is_retryable());
        assert!(!CoverStoreError::TooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(!CoverStoreError::UnsafeUrl("x".into()).is_retryable());
        assert!(!CoverStoreError::Runtime("x".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_message_heuristic() {
        let err = CoverStoreError::Download {
            message: "upstream said: Too Many Requests".into(),
            status: None,
            retryable: false,
        };
        assert!(err.is_rate_limited());
        assert!(!CoverStoreError::NotFound.is_rate_limited());
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            CoverStoreError::UnsafeUrl("x".into()).failure_kind(),
            FailureKind::UnsafeUrl
        );
        assert_eq!(
            CoverStoreError::TooLarge { size: 2, limit: 1 }.failure_kind(),
            FailureKind::TooLarge
        );
        assert_eq!(
            CoverStoreError::Processing("x".into()).failure_kind(),
            FailureKind::ProcessingFailed
        );
        assert_eq!(
            CoverStoreError::Runtime("x".into()).failure_kind(),
            FailureKind::RuntimeSkip
        );
        assert_eq!(
            CoverStoreError::Storage("put failed".into()).failure_kind(),
            FailureKind::Unexpected
        );
        assert!(!FailureKind::RuntimeSkip.is_recordable());
        assert!(!FailureKind::Unexpected.is_recordable());
        assert!(FailureKind::DownloadFailed.is_recordable());
    }

    #[tokio::test]
    async fn test_store_without_bucket_is_runtime_skip() {
        let store = S3CoverStore::new(None, StoreLimits::default(), UrlGuard::default()).unwrap();
        let err = store
            .store_from_url(CoverStoreRequest::new(Uuid::new_v4(), "https://example.com/a.jpg", "TEST"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoverStoreError::Runtime(_)));
    }
}
