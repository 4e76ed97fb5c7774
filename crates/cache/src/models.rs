//! Database models for the cache index

use sqlx::FromRow;
use zipline_errors::{CacheError, Error};
use zipline_hash::Sha256Digest;

/// Lifecycle state of a cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Bytes are being written; the entry is not yet readable
    DirtyDownload,
    /// Bytes are on disk and verified
    Ready,
}

impl FileState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirtyDownload => "DIRTY_DOWNLOAD",
            Self::Ready => "READY",
        }
    }

    /// Parse a state string from the index
    ///
    /// # Errors
    /// Returns `CacheError::Corrupt` for an unknown state.
    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "DIRTY_DOWNLOAD" => Ok(Self::DirtyDownload),
            "READY" => Ok(Self::Ready),
            other => Err(CacheError::Corrupt {
                message: format!("unknown file state: {other}"),
            }
            .into()),
        }
    }
}

/// A cached file record
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub hash: String,
    pub size: i64,
    pub state: String,
    pub manifest_app: Option<String>,
    pub last_used_ms: i64,
}

impl FileRecord {
    /// Parse the content hash
    ///
    /// # Errors
    /// Returns `CacheError::Corrupt` if the stored hash is not a valid
    /// hex digest.
    pub fn hash(&self) -> Result<Sha256Digest, Error> {
        Sha256Digest::from_hex(&self.hash)
    }

    /// Parse the state
    ///
    /// # Errors
    /// Returns `CacheError::Corrupt` for an unknown state string.
    pub fn state(&self) -> Result<FileState, Error> {
        FileState::from_str(&self.state)
    }
}

/// A pin record binding a manifest to a file
#[derive(Debug, Clone, FromRow)]
pub struct PinRecord {
    pub app_name: String,
    pub manifest_hash: String,
    pub file_hash: String,
}
