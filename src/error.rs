//! Error types for cache synchronization
//!
//! This module defines the error taxonomy of the campaign-sync library.
//! Errors are `Clone` because a single fetch failure is shared by every
//! caller that joined the deduplicated request.

use thiserror::Error;

/// Main error type for cache synchronization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Resource fetch failed (producer or network failure)
    #[error("Fetch error for {key}: {message}")]
    FetchError { key: String, message: String },

    /// Remote write failed after the optimistic update was applied
    #[error("Mutation error for {key}: {message}")]
    MutationError { key: String, message: String },

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    TimeoutError { timeout_ms: u64, context: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl SyncError {
    /// Build a fetch error from any collaborator error
    pub fn fetch(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::FetchError {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Build a mutation error from any collaborator error
    pub fn mutation(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::MutationError {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error came from a timed out operation
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::TimeoutError { .. })
    }
}

/// Result type alias for cache synchronization
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::SerializationError(e.to_string())
    }
}
