//! Load pipeline error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    #[error("receiver failed for module {id}: {message}")]
    ReceiverFailed { id: String, message: String },

    #[error("initializer failed: {message}")]
    InitializerFailed { message: String },

    #[error("no manifest available for application {app_name}")]
    ManifestNotFound { app_name: String },
}
