//! Cover-link persistence
//!
//! One `book_image_links` row per (book, source). Success overwrites the row's
//! storage metadata and clears any earlier download error; failure records a
//! short reason and leaves an existing storage key alone.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::types::StoredCover;

/// Column width of `book_image_links.download_error`
pub const MAX_FAILURE_REASON_CHARS: usize = 255;

/// Covers at or above this pixel count are flagged high resolution
pub const HIGH_RESOLUTION_PIXELS: u64 = 320_000;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Book {0} does not exist")]
    UnknownBook(Uuid),
}

#[async_trait]
pub trait CoverRepository: Send + Sync {
    async fn record_success(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        cover: &StoredCover,
    ) -> Result<(), RepositoryError>;

    async fn record_failure(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        reason: &str,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<T: CoverRepository + ?Sized> CoverRepository for Arc<T> {
    async fn record_success(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        cover: &StoredCover,
    ) -> Result<(), RepositoryError> {
        (**self).record_success(book_id, source, url, cover).await
    }

    async fn record_failure(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        (**self).record_failure(book_id, source, url, reason).await
    }
}

pub fn is_high_resolution(width: u32, height: u32) -> bool {
    u64::from(width) * u64::from(height) >= HIGH_RESOLUTION_PIXELS
}

/// Trim and cut a failure reason to the column width on a char boundary
pub fn truncate_reason(reason: &str) -> String {
    reason.trim().chars().take(MAX_FAILURE_REASON_CHARS).collect()
}

#[derive(Debug, Clone)]
pub struct PgCoverRepository {
    pool: PgPool,
}

impl PgCoverRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(book_id: Uuid, err: sqlx::Error) -> RepositoryError {
    let unknown_book =
        matches!(&err, sqlx::Error::Database(db) if db.is_foreign_key_violation());
    if unknown_book {
        RepositoryError::UnknownBook(book_id)
    } else {
        RepositoryError::Database(err)
    }
}

#[async_trait]
impl CoverRepository for PgCoverRepository {
    async fn record_success(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        cover: &StoredCover,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO book_image_links
                (book_id, source, url, s3_image_path, width, height,
                 is_grayscale, is_high_resolution, download_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL)
            ON CONFLICT (book_id, source) DO UPDATE SET
                url = EXCLUDED.url,
                s3_image_path = EXCLUDED.s3_image_path,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                is_grayscale = EXCLUDED.is_grayscale,
                is_high_resolution = EXCLUDED.is_high_resolution,
                download_error = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(book_id)
        .bind(source)
        .bind(url)
        .bind(&cover.storage_key)
        .bind(i32::try_from(cover.width).unwrap_or(i32::MAX))
        .bind(i32::try_from(cover.height).unwrap_or(i32::MAX))
        .bind(cover.grayscale)
        .bind(is_high_resolution(cover.width, cover.height))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(book_id, e))?;

        Ok(())
    }

    async fn record_failure(
        &self,
        book_id: Uuid,
        source: &str,
        url: &str,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO book_image_links (book_id, source, url, download_error)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (book_id, source) DO UPDATE SET
                url = EXCLUDED.url,
                download_error = EXCLUDED.download_error,
                updated_at = NOW()
            "#,
        )
        .bind(book_id)
        .bind(source)
        .bind(url)
        .bind(truncate_reason(reason))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(book_id, e))?;

        Ok(())
    }
}
