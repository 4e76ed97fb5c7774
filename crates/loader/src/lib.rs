#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Application loading for zipline
//!
//! The loader fetches and verifies a signed manifest, receives every
//! module in dependency order, and pins the result in the cache so the
//! next load can run offline. `load_or_fall_back` retries a failed
//! network load against local sources only; `load_continuously` polls a
//! URL stream and reloads when the manifest's verified content changes.

mod continuous;
mod engine;
mod receiver;

pub use continuous::load_continuously;
pub use receiver::{DownloadReceiver, Receiver};
pub use zipline_net::{ConcurrencyLimiter, DEFAULT_CONCURRENT_DOWNLOADS};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use zipline_cache::{Cache, CacheConfig};
use zipline_errors::{Error, LoaderError};
use zipline_events::{Event, EventEmitter};
use zipline_manifest::{manifest_file_name, Manifest};
use zipline_net::{EmbeddedFetcher, Fetcher, FetcherChain, FsCachingFetcher, HttpClient, HttpFetcher};
use zipline_signing::ManifestVerifier;

/// A successfully loaded application
#[derive(Debug)]
pub struct LoadedApp<R> {
    pub manifest: Manifest,
    pub receiver: R,
}

/// Builder for a [`Loader`]
pub struct LoaderBuilder {
    client: Option<HttpClient>,
    verifier: ManifestVerifier,
    events: EventEmitter,
    cache_config: Option<CacheConfig>,
    embedded_dir: Option<PathBuf>,
    concurrent_downloads: usize,
}

impl LoaderBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: None,
            verifier: ManifestVerifier::accept_unsigned(),
            events: EventEmitter::new(),
            cache_config: None,
            embedded_dir: None,
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
        }
    }

    /// Use a preconfigured HTTP client
    #[must_use]
    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Verify manifests against this trusted key set
    #[must_use]
    pub fn with_verifier(mut self, verifier: ManifestVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Report telemetry through this emitter
    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Cache downloads (and serve pinned loads offline) in this
    /// directory
    #[must_use]
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    /// Serve modules from this read-only bundle directory first
    #[must_use]
    pub fn with_embedded_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.embedded_dir = Some(dir.into());
        self
    }

    /// Bound parallel downloads (default 3)
    #[must_use]
    pub fn with_concurrent_downloads(mut self, concurrent_downloads: usize) -> Self {
        self.concurrent_downloads = concurrent_downloads;
        self
    }

    /// Build the loader, opening the cache if one is configured.
    ///
    /// # Errors
    /// Returns an error if the HTTP client or the cache cannot be
    /// initialized.
    pub async fn build(self) -> Result<Loader, Error> {
        let client = match self.client {
            Some(client) => client,
            None => HttpClient::with_defaults()?,
        };

        let http = HttpFetcher::new(client.clone(), self.events.clone());
        let mut fetchers: Vec<Arc<dyn Fetcher>> = Vec::new();
        if let Some(dir) = self.embedded_dir {
            fetchers.push(Arc::new(EmbeddedFetcher::new(dir)));
        }
        match self.cache_config {
            Some(config) => {
                let cache = Cache::open(config, self.events.clone()).await?;
                fetchers.push(Arc::new(FsCachingFetcher::new(Arc::new(cache), http)));
            }
            None => fetchers.push(Arc::new(http)),
        }

        Ok(Loader {
            chain: Arc::new(FetcherChain::new(fetchers)),
            limiter: Arc::new(ConcurrencyLimiter::new(self.concurrent_downloads)),
            client,
            verifier: self.verifier,
            events: self.events,
        })
    }
}

impl Default for LoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads zipline applications through a tiered fetch chain
pub struct Loader {
    chain: Arc<FetcherChain>,
    limiter: Arc<ConcurrencyLimiter>,
    client: HttpClient,
    verifier: ManifestVerifier,
    events: EventEmitter,
}

impl Loader {
    /// Reconfigure the download parallelism bound. Transfers already in
    /// flight keep their permits.
    pub async fn set_concurrent_downloads(&self, concurrent_downloads: usize) {
        self.limiter.set_capacity(concurrent_downloads).await;
    }

    /// Fetch an application's manifest, validate its dependency graph,
    /// and verify its signature. A `None` URL restricts the lookup to
    /// embedded and cached sources.
    ///
    /// # Errors
    /// Returns fetch, parse, validation or signature errors.
    pub async fn fetch_and_verify_manifest(
        &self,
        app_name: &str,
        manifest_url: Option<&str>,
    ) -> Result<(Vec<u8>, Manifest), Error> {
        let (raw, manifest) = self
            .chain
            .fetch_manifest(&self.limiter, app_name, manifest_url)
            .await?;

        manifest.validate()?;
        if let Some(key_name) = self.verifier.verify(&raw, &manifest)? {
            self.events.emit(Event::ManifestVerified {
                app_name: app_name.to_string(),
                key_name,
            });
        }

        Ok((raw, manifest))
    }

    /// Load an application: fetch + verify the manifest, receive every
    /// module in dependency order, run the caller's initializer as a
    /// smoke test, then pin. On failure the manifest is unpinned and
    /// `ApplicationLoadFailed` is emitted.
    ///
    /// # Errors
    /// Surfaces the first failure of any stage.
    pub async fn load_or_fail<R, N, I>(
        &self,
        app_name: &str,
        manifest_url: Option<&str>,
        new_receiver: N,
        initializer: I,
    ) -> Result<LoadedApp<R>, Error>
    where
        R: Receiver,
        N: FnOnce() -> R,
        I: FnOnce(&mut R) -> Result<(), Error>,
    {
        self.events.emit(Event::ApplicationLoadStarted {
            app_name: app_name.to_string(),
            manifest_url: manifest_url.map(ToString::to_string),
        });

        match self
            .try_load(app_name, manifest_url, new_receiver, initializer)
            .await
        {
            Ok(loaded) => {
                self.events.emit(Event::ApplicationLoadEnded {
                    app_name: app_name.to_string(),
                    manifest_url: manifest_url.map(ToString::to_string),
                });
                Ok(loaded)
            }
            Err(e) => {
                self.events.emit(Event::ApplicationLoadFailed {
                    app_name: app_name.to_string(),
                    manifest_url: manifest_url.map(ToString::to_string),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Load from the network, and on any failure retry once against
    /// local sources only (embedded bundle, then pinned cache).
    ///
    /// # Errors
    /// Surfaces the local attempt's failure if both attempts fail.
    pub async fn load_or_fall_back<R, N, I>(
        &self,
        app_name: &str,
        manifest_url: &str,
        new_receiver: N,
        initializer: I,
    ) -> Result<LoadedApp<R>, Error>
    where
        R: Receiver,
        N: Fn() -> R,
        I: Fn(&mut R) -> Result<(), Error>,
    {
        match self
            .load_or_fail(app_name, Some(manifest_url), &new_receiver, &initializer)
            .await
        {
            Ok(loaded) => Ok(loaded),
            Err(_) => {
                self.load_or_fail(app_name, None, &new_receiver, &initializer)
                    .await
            }
        }
    }

    /// Download an application's manifest and modules into `dir`,
    /// laid out so an [`EmbeddedFetcher`] can serve them.
    ///
    /// # Errors
    /// Surfaces fetch, verification and file I/O failures.
    pub async fn download(
        &self,
        app_name: &str,
        dir: &Path,
        manifest_url: Option<&str>,
    ) -> Result<(), Error> {
        let (raw, manifest) = self.fetch_and_verify_manifest(app_name, manifest_url).await?;

        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io_with_path(&e, dir))?;

        let mut receiver = DownloadReceiver::new(dir);
        engine::receive_modules(
            &self.chain,
            &self.limiter,
            &self.client,
            &self.events,
            app_name,
            &manifest,
            manifest_url,
            &mut receiver,
        )
        .await?;

        let manifest_path = dir.join(manifest_file_name(app_name));
        fs::write(&manifest_path, &raw)
            .await
            .map_err(|e| Error::io_with_path(&e, manifest_path))
    }

    async fn try_load<R, N, I>(
        &self,
        app_name: &str,
        manifest_url: Option<&str>,
        new_receiver: N,
        initializer: I,
    ) -> Result<LoadedApp<R>, Error>
    where
        R: Receiver,
        N: FnOnce() -> R,
        I: FnOnce(&mut R) -> Result<(), Error>,
    {
        let (raw, manifest) = self.fetch_and_verify_manifest(app_name, manifest_url).await?;

        let mut receiver = new_receiver();
        let received = engine::receive_modules(
            &self.chain,
            &self.limiter,
            &self.client,
            &self.events,
            app_name,
            &manifest,
            manifest_url,
            &mut receiver,
        )
        .await;

        let initialized = received.and_then(|()| {
            initializer(&mut receiver).map_err(|e| {
                LoaderError::InitializerFailed {
                    message: e.to_string(),
                }
                .into()
            })
        });

        let pinned = match initialized {
            Ok(()) => self.chain.pin(app_name, &manifest, &raw).await,
            Err(e) => Err(e),
        };

        match pinned {
            Ok(()) => Ok(LoadedApp { manifest, receiver }),
            Err(e) => {
                // Release whatever this attempt pinned; the previous
                // application version stays pinned.
                let _ = self.chain.unpin(app_name, &manifest).await;
                Err(e)
            }
        }
    }
}
