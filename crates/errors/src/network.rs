//! Network-related error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("fetch failed for {url}: {message}")]
    FetchFailed { url: String, message: String },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("connection timeout to {url}")]
    Timeout { url: String },

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("rate limited: retry after {seconds} seconds")]
    RateLimited { seconds: u64 },
}
