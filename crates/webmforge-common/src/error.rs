//! Unified error type for the conversion pipeline.
//!
//! Every failure a caller can observe is classified by [`ErrorKind`]. Attempt
//! level failures never reach this type: the strategy chain recovers them
//! locally and only the terminal outcome of a job is surfaced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Classification of a terminal failure, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Wrong media type, oversize or malformed input. No job was created.
    #[serde(rename = "ValidationError")]
    Validation,
    /// The caller already has a non-terminal job.
    Busy,
    /// The transcoding backend could not be started or loaded.
    EnvironmentUnavailable,
    /// Every configured strategy failed or produced empty output.
    StrategyExhausted,
    /// Artifact persistence failed because the device is full.
    StorageFull,
    /// Artifact persistence failed for another I/O reason.
    #[serde(rename = "IOError")]
    Io,
    /// The caller cancelled the job.
    Cancelled,
    /// The referenced job or artifact does not exist (or has expired).
    NotFound,
    /// Too many requests in the current window.
    RateLimited,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Stable wire name of the classification.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Busy => "Busy",
            ErrorKind::EnvironmentUnavailable => "EnvironmentUnavailable",
            ErrorKind::StrategyExhausted => "StrategyExhausted",
            ErrorKind::StorageFull => "StorageFull",
            ErrorKind::Io => "IOError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Generic, user-presentable description of the classification.
    ///
    /// Never contains paths or engine output.
    pub fn generic_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "the uploaded file is not an acceptable WebM video",
            ErrorKind::Busy => "a conversion is already in progress, try again later",
            ErrorKind::EnvironmentUnavailable => {
                "the conversion engine is unavailable, reload and try again"
            }
            ErrorKind::StrategyExhausted => "the video could not be converted",
            ErrorKind::StorageFull => "the server is out of storage space",
            ErrorKind::Io => "the server could not store the file",
            ErrorKind::Cancelled => "the conversion was cancelled",
            ErrorKind::NotFound => "not found",
            ErrorKind::RateLimited => "too many requests, try again later",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type covering all caller-visible failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input rejected before any job was created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Single-flight violation for this caller.
    #[error("Caller {caller} already has a conversion in progress")]
    Busy {
        /// The caller key holding the guard.
        caller: String,
    },

    /// The execution backend could not be started or loaded.
    #[error("Environment unavailable [{backend}]: {message}")]
    EnvironmentUnavailable {
        /// Backend name ("process" or "sandbox").
        backend: String,
        /// Human-readable failure description.
        message: String,
    },

    /// All strategies failed.
    #[error("All {attempts} strategies failed: {detail}")]
    StrategyExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// Diagnostic text of the last attempt.
        detail: String,
    },

    /// The device holding an artifact root is full.
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The job was cancelled by its caller.
    #[error("Cancelled")]
    Cancelled,

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "artifact").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The request quota for the current window is used up.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::StorageFull {
            return Error::StorageFull(source.to_string());
        }
        Error::Io { source }
    }
}

impl Error {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::EnvironmentUnavailable { .. } => ErrorKind::EnvironmentUnavailable,
            Error::StrategyExhausted { .. } => ErrorKind::StrategyExhausted,
            Error::StorageFull(_) => ErrorKind::StorageFull,
            Error::Io { .. } => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::RateLimited => ErrorKind::RateLimited,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Busy { .. } => 409,
            Error::EnvironmentUnavailable { .. } => 503,
            Error::StrategyExhausted { .. } => 422,
            Error::StorageFull(_) => 507,
            Error::Io { .. } => 500,
            Error::Cancelled => 409,
            Error::NotFound { .. } => 404,
            Error::RateLimited => 429,
            Error::Internal(_) => 500,
        }
    }

    /// Whether the caller may reasonably retry after taking action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Busy { .. } | Error::EnvironmentUnavailable { .. } | Error::RateLimited
        )
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::EnvironmentUnavailable`].
    pub fn environment(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::EnvironmentUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
