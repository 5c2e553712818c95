//! Core types for cover acquisition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Source name used for attempts decided locally, without calling a provider
pub const LOCAL_VALIDATION: &str = "LOCAL_VALIDATION";

/// Title shown when a candidate has none
pub const UNTITLED: &str = "Untitled";

/// Image-size keys from best to worst, as used by Google Books `imageLinks`
pub const IMAGE_SIZE_PREFERENCE: [&str; 6] = [
    "extraLarge",
    "large",
    "medium",
    "small",
    "thumbnail",
    "smallThumbnail",
];

/// A catalog record selected for cover acquisition in the current run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub book_id: Uuid,
    pub title: Option<String>,
    /// Preferred lookup key (ISBN-13)
    pub isbn13: Option<String>,
    /// Alternate lookup key (ISBN-10)
    pub isbn10: Option<String>,
}

impl Candidate {
    /// First non-blank identifier, trimmed
    pub fn lookup_key(&self) -> Option<&str> {
        [self.isbn13.as_deref(), self.isbn10.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|key| !key.is_empty())
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(UNTITLED)
    }
}

/// Which predicate selects candidates for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillMode {
    /// Has an identifier but no usable cover link
    Missing,
    /// Only grayscale covers so far
    Grayscale,
    /// A previous download was rejected and nothing valid is stored
    Rejected,
}

impl BackfillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillMode::Missing => "MISSING",
            BackfillMode::Grayscale => "GRAYSCALE",
            BackfillMode::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for BackfillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MISSING" => Ok(BackfillMode::Missing),
            "GRAYSCALE" => Ok(BackfillMode::Grayscale),
            "REJECTED" => Ok(BackfillMode::Rejected),
            other => Err(format!(
                "unknown backfill mode '{}', expected MISSING, GRAYSCALE or REJECTED",
                other
            )),
        }
    }
}

/// Result classification of one provider attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceAttemptOutcome {
    Success,
    NotFound,
    Failure,
    Skipped,
}

impl SourceAttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceAttemptOutcome::Success => "SUCCESS",
            SourceAttemptOutcome::NotFound => "NOT_FOUND",
            SourceAttemptOutcome::Failure => "FAILURE",
            SourceAttemptOutcome::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for SourceAttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic record of one attempt, as surfaced by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAttemptStatus {
    pub source: String,
    pub outcome: SourceAttemptOutcome,
    pub detail: String,
    pub attempted_at: DateTime<Utc>,
}

impl SourceAttemptStatus {
    pub fn now(
        source: impl Into<String>,
        outcome: SourceAttemptOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            outcome,
            detail: detail.into(),
            attempted_at: Utc::now(),
        }
    }
}

/// What a provider client hands back for one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttemptResult {
    pub outcome: SourceAttemptOutcome,
    pub detail: String,
    /// Upstream image URL the cover was fetched from, present only on success
    pub image_url: Option<String>,
    /// Present only on success
    pub stored: Option<StoredCover>,
}

impl SourceAttemptResult {
    pub fn success(detail: impl Into<String>, image_url: impl Into<String>, stored: StoredCover) -> Self {
        Self {
            outcome: SourceAttemptOutcome::Success,
            detail: detail.into(),
            image_url: Some(image_url.into()),
            stored: Some(stored),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            outcome: SourceAttemptOutcome::NotFound,
            detail: detail.into(),
            image_url: None,
            stored: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            outcome: SourceAttemptOutcome::Failure,
            detail: detail.into(),
            image_url: None,
            stored: None,
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            outcome: SourceAttemptOutcome::Skipped,
            detail: detail.into(),
            image_url: None,
            stored: None,
        }
    }
}

/// Metadata of a cover written to object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCover {
    pub storage_key: String,
    pub resolved_url: String,
    pub width: u32,
    pub height: u32,
    pub grayscale: bool,
    pub source: String,
}

/// Pick the best URL from a map of size variants
///
/// Known size keys win in [`IMAGE_SIZE_PREFERENCE`] order; otherwise any
/// non-blank value, taking the lexicographically first key so the choice is
/// stable.
pub fn select_canonical_image(links: &HashMap<String, String>) -> Option<&str> {
    let usable = |key: &str| {
        links
            .get(key)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
    };

    if let Some(url) = IMAGE_SIZE_PREFERENCE.iter().find_map(|key| usable(key)) {
        return Some(url);
    }

    let mut keys: Vec<&String> = links.keys().collect();
    keys.sort();
    keys.into_iter().find_map(|key| usable(key))
}
