//! Coverfill Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every Coverfill workspace member:
//!
//! - **Error Handling**: the common error and result types
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use coverfill_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> coverfill_common::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CoverfillError, Result};
