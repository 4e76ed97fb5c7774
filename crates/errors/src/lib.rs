#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Error types for the zipline loader
//!
//! This crate provides fine-grained error types organized by domain.
//! All error types implement Clone so that coalesced cache waiters can
//! share a single producer failure.

use thiserror::Error;

pub mod cache;
pub mod loader;
pub mod manifest;
pub mod network;
pub mod signing;

// Re-export all error types at the root
pub use cache::CacheError;
pub use loader::LoaderError;
pub use manifest::ManifestError;
pub use network::NetworkError;
pub use signing::SigningError;

/// Generic error type for cross-crate boundaries
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
        path: Option<std::path::PathBuf>,
    },
}

impl Error {
    /// Create an internal error with a message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an Io error with an associated path
    pub fn io_with_path(err: &std::io::Error, path: impl Into<std::path::PathBuf>) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
            path: Some(path.into()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Cache(CacheError::Database {
            message: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

/// Result type alias for zipline operations
pub type Result<T> = std::result::Result<T, Error>;
