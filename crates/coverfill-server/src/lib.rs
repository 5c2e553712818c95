//! Coverfill Server Library
//!
//! Finds cover images for catalog books that lack a usable one.
//!
//! # Overview
//!
//! - **Backfill**: a single background run that selects candidates from the
//!   catalog and queries Open Library, Google Books, and Longitood in that order,
//!   with pacing, rate-limit backoff, and per-provider circuit pauses
//! - **Event uploads**: ingestion events that already carry an image URL are
//!   uploaded in the background with bounded retries
//! - **Admin API**: start, cancel, and poll the backfill; post ingestion events
//! - **Storage**: covers are written to S3-compatible object storage and the
//!   resulting metadata is persisted to PostgreSQL
//!
//! # Example
//!
//! ```no_run
//! use coverfill_server::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     println!("binding {}:{}", config.server.host, config.server.port);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod covers;
pub mod db;
pub mod error;
pub mod features;
pub mod middleware;
pub mod storage;

// Re-export commonly used types
pub use error::{AppError, AppResult};
