//! Candidate selection for backfill runs

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::repository::RepositoryError;
use super::types::{BackfillMode, Candidate};

/// Returns candidates newest first, at most `limit`
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    async fn query_candidates(
        &self,
        mode: BackfillMode,
        limit: i64,
    ) -> Result<Vec<Candidate>, RepositoryError>;
}

#[async_trait]
impl<T: CandidateSelector + ?Sized> CandidateSelector for Arc<T> {
    async fn query_candidates(
        &self,
        mode: BackfillMode,
        limit: i64,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        (**self).query_candidates(mode, limit).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    title: Option<String>,
    isbn13: Option<String>,
    isbn10: Option<String>,
}

impl From<CandidateRow> for Candidate {
    fn from(row: CandidateRow) -> Self {
        Candidate {
            book_id: row.id,
            title: row.title,
            isbn13: row.isbn13,
            isbn10: row.isbn10,
        }
    }
}

const HAS_IDENTIFIER: &str = "(NULLIF(BTRIM(b.isbn13), '') IS NOT NULL OR NULLIF(BTRIM(b.isbn10), '') IS NOT NULL)";

/// WHERE clause selecting the books a mode targets
pub fn mode_predicate(mode: BackfillMode) -> String {
    match mode {
        BackfillMode::Missing => format!(
            r#"{HAS_IDENTIFIER}
              AND NOT EXISTS (
                  SELECT 1 FROM book_image_links l
                  WHERE l.book_id = b.id
                    AND l.download_error IS NULL
                    AND (l.url IS NOT NULL OR l.s3_image_path IS NOT NULL)
              )"#
        ),
        BackfillMode::Grayscale => format!(
            r#"{HAS_IDENTIFIER}
              AND EXISTS (
                  SELECT 1 FROM book_image_links l
                  WHERE l.book_id = b.id AND l.is_grayscale = TRUE
              )
              AND NOT EXISTS (
                  SELECT 1 FROM book_image_links l
                  WHERE l.book_id = b.id
                    AND l.download_error IS NULL
                    AND COALESCE(l.is_grayscale, FALSE) = FALSE
              )"#
        ),
        BackfillMode::Rejected => format!(
            r#"{HAS_IDENTIFIER}
              AND EXISTS (
                  SELECT 1 FROM book_image_links l
                  WHERE l.book_id = b.id AND l.download_error IS NOT NULL
              )
              AND NOT EXISTS (
                  SELECT 1 FROM book_image_links l
                  WHERE l.book_id = b.id
                    AND l.s3_image_path IS NOT NULL
                    AND l.download_error IS NULL
              )"#
        ),
    }
}

#[derive(Debug, Clone)]
pub struct PgCandidateSelector {
    pool: PgPool,
}

impl PgCandidateSelector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSelector for PgCandidateSelector {
    #[instrument(skip(self))]
    async fn query_candidates(
        &self,
        mode: BackfillMode,
        limit: i64,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT b.id, b.title, b.isbn13, b.isbn10
            FROM books b
            WHERE {}
            ORDER BY b.created_at DESC, b.id
            LIMIT $1
            "#,
            mode_predicate(mode)
        );

        let rows: Vec<CandidateRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), "Selected backfill candidates");

        Ok(rows.into_iter().map(Candidate::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mode_requires_an_identifier() {
        for mode in [BackfillMode::Missing, BackfillMode::Grayscale, BackfillMode::Rejected] {
            assert!(mode_predicate(mode).starts_with(HAS_IDENTIFIER));
        }
    }

    #[test]
    fn test_rejected_mode_ignores_books_with_stored_cover() {
        let predicate = mode_predicate(BackfillMode::Rejected);
        assert!(predicate.contains("download_error IS NOT NULL"));
        assert!(predicate.contains("s3_image_path IS NOT NULL"));
    }

    #[test]
    fn test_grayscale_mode_excludes_colour_links() {
        let predicate = mode_predicate(BackfillMode::Grayscale);
        assert!(predicate.contains("is_grayscale = TRUE"));
        assert!(predicate.contains("COALESCE(l.is_grayscale, FALSE) = FALSE"));
    }
}
