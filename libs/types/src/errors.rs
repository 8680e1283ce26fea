//! Error types for the explorer data layer
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Top-level cache error
///
/// `Clone` so a single fetch outcome can be handed to every caller that
/// joined the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Advisory: a fetch for this store is already underway.
    #[error("a fetch is already in progress")]
    AlreadyFetching,

    #[error("stream error in {store}: {message}")]
    Stream { store: String, message: String },

    #[error("producer failed for {store}: {message}")]
    Producer { store: String, message: String },

    /// The stream was cancelled; only producers ever see this.
    #[error("stream cancelled")]
    Cancelled,

    #[error("sort failed: {message}")]
    Sort { message: String },

    #[error("bucket size must be greater than zero")]
    InvalidBucketSize,

    #[error("invalid block range: first {first} > last {last}")]
    InvalidBlockRange { first: u64, last: u64 },

    #[error("bucket limit exceeded: requested {requested}, limit {limit}")]
    BucketLimitExceeded { requested: usize, limit: usize },

    #[error("no async runtime available for background fetch")]
    NoRuntime,

    #[error("registry entry {key} holds a different type")]
    RegistryTypeMismatch { key: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl CacheError {
    /// Whether the error is the advisory "already fetching" sentinel.
    pub fn is_already_fetching(&self) -> bool {
        matches!(self, CacheError::AlreadyFetching)
    }

    pub fn stream(store: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Stream {
            store: store.into(),
            message: message.into(),
        }
    }

    pub fn producer(store: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Producer {
            store: store.into(),
            message: message.into(),
        }
    }

    pub fn sort(message: impl Into<String>) -> Self {
        CacheError::Sort {
            message: message.into(),
        }
    }
}

/// Result alias used across the explorer crates.
pub type CacheResult<T> = Result<T, CacheError>;
