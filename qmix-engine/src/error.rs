//! Error types for qmix-engine
//!
//! Defines engine error types using thiserror. Nothing in this module is
//! raised on the render path: the renderer turns entry failures into state
//! transitions and notices instead.

use thiserror::Error;

/// Main error type for the streaming engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Pool is at its block limit and has no idle block
    #[error("Buffer pool exhausted: {0}")]
    PoolExhausted(String),

    /// Block returned to a pool that did not lend it
    #[error("Invalid release: {0}")]
    InvalidRelease(String),

    /// Pool constructed with unusable parameters
    #[error("Invalid pool configuration: {0}")]
    InvalidPoolConfig(String),

    /// Transient transport failure (connect, reset, 5xx)
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Server rejected the locator (4xx)
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Source was closed while a caller was blocked on it
    #[error("Source interrupted: {0}")]
    SourceInterrupted(String),

    /// Adaptive switch could not open the new locator
    #[error("Switch failed: {0}")]
    SwitchFailed(String),

    /// Queue index outside the queue or inside the active pair
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// No decoder for the stream
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Entry or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] qmix_common::Error),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures worth retrying after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SourceUnavailable(_) | EngineError::PoolExhausted(_)
        )
    }
}

/// Convenience Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
