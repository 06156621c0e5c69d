//! Common error types for BrainChat
//!
//! Startup failures (loader, config) abort the process; per-request failures
//! are reported to the caller for that turn only.

use thiserror::Error;

/// Main error type for BrainChat
#[derive(Error, Debug)]
pub enum BrainChatError {
    /// Model path extension is not in the format registry
    #[error("Unsupported model format: {0:?}")]
    UnsupportedFormat(String),

    /// File missing or unreadable
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File was read but its contents are invalid for the declared format
    #[error("Failed to load model: {0}")]
    LoadFailure(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more workers failed while generating a response
    #[error("Generation failed in {failed} of {workers} workers: {first}")]
    Generation {
        /// Number of workers that failed
        failed: usize,
        /// Number of workers that took part in the request
        workers: usize,
        /// First failure, in completion order
        first: String,
    },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrainChatError {
    /// Whether this error must abort the process rather than a single turn
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrainChatError::UnsupportedFormat(_)
                | BrainChatError::Io(_)
                | BrainChatError::LoadFailure(_)
                | BrainChatError::Config(_)
                | BrainChatError::Internal(_)
        )
    }

    /// Create an unsupported format error
    pub fn unsupported_format(extension: impl Into<String>) -> Self {
        BrainChatError::UnsupportedFormat(extension.into())
    }

    /// Create a load failure
    pub fn load_failure(msg: impl Into<String>) -> Self {
        BrainChatError::LoadFailure(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BrainChatError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        BrainChatError::Timeout(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BrainChatError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BrainChatError::Internal(msg.into())
    }
}

/// Result type alias for BrainChat operations
pub type Result<T> = std::result::Result<T, BrainChatError>;
