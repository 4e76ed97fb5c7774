//! Module consumers
//!
//! A receiver accepts each module's bytes in dependency order. The
//! typical receiver hands bytes to a script engine; `DownloadReceiver`
//! instead writes them to a bundle directory that an embedded fetcher
//! can later serve.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use zipline_errors::Error;
use zipline_hash::Sha256Digest;

/// Consumer of module bytes in dependency order.
///
/// Hand-off is serialized: `receive` is never invoked concurrently, and
/// never before `receive` has completed for every transitive
/// dependency of the module.
#[async_trait]
pub trait Receiver: Send {
    /// Accept one module's bytes.
    ///
    /// # Errors
    /// A failure aborts the load.
    async fn receive(
        &mut self,
        bytes: Vec<u8>,
        id: &str,
        sha256: &Sha256Digest,
    ) -> Result<(), Error>;
}

/// Writes each module to `dir`, named by the lowercase hex of its
/// SHA-256, producing a bundle an embedded fetcher can serve.
pub struct DownloadReceiver {
    dir: PathBuf,
}

impl DownloadReceiver {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Receiver for DownloadReceiver {
    async fn receive(
        &mut self,
        bytes: Vec<u8>,
        _id: &str,
        sha256: &Sha256Digest,
    ) -> Result<(), Error> {
        let path = self.dir.join(sha256.to_hex());
        fs::write(&path, &bytes)
            .await
            .map_err(|e| Error::io_with_path(&e, path))
    }
}
