//! Cache and index-related error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache corrupt: {message}")]
    Corrupt { message: String },

    #[error("cache full: object of {size} bytes exceeds capacity of {max_size} bytes")]
    Full { size: u64, max_size: u64 },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("migration failed: {message}")]
    MigrationFailed { message: String },

    #[error("cannot pin {hash}: file is not ready")]
    PinMissingFile { hash: String },
}
