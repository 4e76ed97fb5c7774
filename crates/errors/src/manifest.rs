//! Manifest parsing and validation error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    #[error("manifest parse failed: {message}")]
    ParseFailed { message: String },

    #[error("dependency cycle detected at module {id}")]
    CycleDetected { id: String },

    #[error("module {required_by} depends on {id}, which is not in the manifest")]
    MissingDependency { id: String, required_by: String },
}
