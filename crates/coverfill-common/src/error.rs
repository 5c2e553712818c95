//! Error types shared across Coverfill crates

use thiserror::Error;

/// Result type alias for Coverfill operations
pub type Result<T> = std::result::Result<T, CoverfillError>;

/// Main error type for Coverfill
#[derive(Error, Debug)]
pub enum CoverfillError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl CoverfillError {
    /// Error for an environment variable or setting that failed to parse
    pub fn invalid_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_message() {
        let err = CoverfillError::invalid_value("COVERS_BATCH_SIZE", "abc");
        assert_eq!(err.to_string(), "Invalid value for COVERS_BATCH_SIZE: abc");
    }
}
