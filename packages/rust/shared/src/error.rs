//! Error types for the bookmark processor.
//!
//! Library crates use [`BookmarkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all bookmark processing operations.
#[derive(Debug, thiserror::Error)]
pub enum BookmarkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// A response arrived with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// A single operation attempt exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Headless-render bridge failure.
    #[error("render error: {message}")]
    Render { message: String, transient: bool },

    /// LLM backend failure (transport, API, or response parsing).
    #[error("llm error: {message}")]
    Llm { message: String, transient: bool },

    /// Input or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (malformed input, duplicate identity, bad URL).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Cache store / database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An operation kept failing transiently until its retry budget ran out.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: Box<BookmarkError>,
    },

    /// Another caller computing the same operation key failed; the failure is shared.
    #[error("{operation} failed in a concurrent caller: {message}")]
    Coalesced { operation: String, message: String },

    /// The batch was cancelled before the operation could finish.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BookmarkError>;

impl BookmarkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Structural failures (malformed input, permanent 4xx, unparseable responses)
    /// return `false` and must not consume retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            Self::Render { transient, .. } | Self::Llm { transient, .. } => *transient,
            Self::Exhausted { .. }
            | Self::Coalesced { .. }
            | Self::Cancelled
            | Self::Config { .. }
            | Self::Parse { .. }
            | Self::Validation { .. }
            | Self::Storage(_)
            | Self::Io { .. } => false,
        }
    }

    /// Whether the error breaks the cache store, and with it every idempotency guarantee.
    ///
    /// Fatal errors abort the whole batch instead of being isolated to one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
