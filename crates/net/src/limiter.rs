//! Bounded download parallelism
//!
//! A counting semaphore caps concurrent byte transfers. The capacity is
//! reconfigurable at runtime: reconfiguration swaps in a fresh
//! semaphore, so permits already held on the old one are respected and
//! the new capacity applies to future acquisitions.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use zipline_errors::Error;

/// Default bound on parallel downloads
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

/// A reconfigurable download semaphore
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: RwLock<Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: RwLock::new(Arc::new(Semaphore::new(capacity))),
        }
    }

    /// Acquire a permit, waiting for capacity.
    ///
    /// Permits are held only across the actual byte transfer, never
    /// across dependency waits or receiver hand-off.
    ///
    /// # Errors
    /// Returns `Error::Cancelled` if the semaphore was closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        let semaphore = { self.semaphore.read().await.clone() };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Replace the semaphore with one of the given capacity. Permits on
    /// the old semaphore drain independently.
    pub async fn set_capacity(&self, capacity: usize) {
        let mut semaphore = self.semaphore.write().await;
        *semaphore = Arc::new(Semaphore::new(capacity));
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENT_DOWNLOADS)
    }
}
