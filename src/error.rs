//! Error types for the Bucketgate rate limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bucketgate operations.
#[derive(Error, Debug)]
pub enum BucketgateError {
    /// Limiter or store settings that can never be valid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backing store could not be reached or answered too slowly
    #[error("State store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Every compare-and-set attempt lost a race with another writer
    #[error("Gave up after {attempts} conflicting updates for key {key}")]
    Contention { key: String, attempts: u32 },

    /// Environment configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, BucketgateError>;
