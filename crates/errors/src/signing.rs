//! Signature verification error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("signature verification failed for key {key_name}")]
    SignatureMismatch { key_name: String },

    #[error("manifest has no signature from a trusted key")]
    NoTrustedKey,

    #[error("manifest is unsigned")]
    Unsigned,

    #[error("invalid public key {name}: {message}")]
    InvalidKey { name: String, message: String },

    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),
}
