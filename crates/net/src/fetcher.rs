//! Fetch sources and their composition
//!
//! Every source answers the same question: "give me the bytes for this
//! (id, hash, url)". `Ok(None)` means the source cannot satisfy the
//! request; transport problems are errors. The chain consults sources
//! in order and the first hit wins.

use crate::{ConcurrencyLimiter, HttpClient};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use zipline_cache::Cache;
use zipline_errors::{Error, LoaderError, NetworkError};
use zipline_events::{Event, EventEmitter};
use zipline_hash::Sha256Digest;
use zipline_manifest::{manifest_file_name, Manifest};

/// A source of module and manifest bytes
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a module's bytes, or `None` if this source cannot satisfy
    /// the request.
    ///
    /// # Errors
    /// Returns `NetworkError::FetchFailed` (or a peer) on transport
    /// errors.
    async fn fetch(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        id: &str,
        sha256: &Sha256Digest,
        url: &str,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Fetch an application's manifest, or `None` if this source cannot
    /// satisfy the request. A `None` URL restricts the lookup to local
    /// sources.
    ///
    /// # Errors
    /// Returns an error on transport or parse failure.
    async fn fetch_manifest(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        url: Option<&str>,
    ) -> Result<Option<(Vec<u8>, Manifest)>, Error>;

    /// Pin a manifest and its modules so they survive eviction. Only
    /// cache-backed fetchers do anything here.
    ///
    /// # Errors
    /// Returns an error if the pin cannot be recorded.
    async fn pin(
        &self,
        app_name: &str,
        manifest: &Manifest,
        raw_manifest: &[u8],
    ) -> Result<(), Error> {
        let _ = (app_name, manifest, raw_manifest);
        Ok(())
    }

    /// Release a manifest's pin. Only cache-backed fetchers do anything
    /// here.
    ///
    /// # Errors
    /// Returns an error if the pin cannot be released.
    async fn unpin(&self, app_name: &str, manifest: &Manifest) -> Result<(), Error> {
        let _ = (app_name, manifest);
        Ok(())
    }
}

/// Serves modules and manifests from a read-only directory shipped with
/// the application. Never writes.
pub struct EmbeddedFetcher {
    dir: PathBuf,
}

impl EmbeddedFetcher {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Fetcher for EmbeddedFetcher {
    async fn fetch(
        &self,
        _limiter: &ConcurrencyLimiter,
        _app_name: &str,
        _id: &str,
        sha256: &Sha256Digest,
        _url: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        let path = self.dir.join(sha256.to_hex());
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_with_path(&e, path)),
        }
    }

    async fn fetch_manifest(
        &self,
        _limiter: &ConcurrencyLimiter,
        app_name: &str,
        _url: Option<&str>,
    ) -> Result<Option<(Vec<u8>, Manifest)>, Error> {
        let path = self.dir.join(manifest_file_name(app_name));
        match fs::read(&path).await {
            Ok(bytes) => {
                let manifest = Manifest::parse(&bytes)?;
                Ok(Some((bytes, manifest)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_with_path(&e, path)),
        }
    }
}

/// Fetches over HTTP with the injected client. The concurrency limiter
/// is held across the byte transfer only.
pub struct HttpFetcher {
    client: HttpClient,
    events: EventEmitter,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(client: HttpClient, events: EventEmitter) -> Self {
        Self { client, events }
    }

    /// The underlying HTTP client, for URL resolution
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    async fn download(
        &self,
        limiter: &ConcurrencyLimiter,
        url: &str,
    ) -> Result<Vec<u8>, Error> {
        let permit = limiter.acquire().await?;
        self.events.emit(Event::DownloadStarted {
            url: url.to_string(),
        });

        let result = self.client.download(url).await;
        drop(permit);

        match &result {
            Ok(bytes) => self.events.emit(Event::DownloadCompleted {
                url: url.to_string(),
                size: bytes.len() as u64,
            }),
            Err(e) => self.events.emit(Event::DownloadFailed {
                url: url.to_string(),
                error: e.to_string(),
            }),
        }
        result
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        limiter: &ConcurrencyLimiter,
        _app_name: &str,
        _id: &str,
        _sha256: &Sha256Digest,
        url: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(Some(self.download(limiter, url).await?))
    }

    async fn fetch_manifest(
        &self,
        limiter: &ConcurrencyLimiter,
        _app_name: &str,
        url: Option<&str>,
    ) -> Result<Option<(Vec<u8>, Manifest)>, Error> {
        let Some(url) = url else {
            return Ok(None);
        };

        let bytes = self.download(limiter, url).await?;
        let manifest = Manifest::parse(&bytes)?;
        Ok(Some((bytes, manifest)))
    }
}

/// Composes the cache over an HTTP fetcher: modules are served from the
/// cache and downloaded into it on miss; manifests are downloaded fresh
/// and recorded, or served from the pinned set when no URL is given.
pub struct FsCachingFetcher {
    cache: Arc<Cache>,
    http: HttpFetcher,
}

impl FsCachingFetcher {
    #[must_use]
    pub fn new(cache: Arc<Cache>, http: HttpFetcher) -> Self {
        Self { cache, http }
    }

    /// The cache backing this fetcher
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}

#[async_trait]
impl Fetcher for FsCachingFetcher {
    async fn fetch(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        id: &str,
        sha256: &Sha256Digest,
        url: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        let bytes = self
            .cache
            .get_or_put(sha256, || async {
                self.http
                    .fetch(limiter, app_name, id, sha256, url)
                    .await?
                    .ok_or_else(|| {
                        NetworkError::FetchFailed {
                            url: url.to_string(),
                            message: "no upstream source".to_string(),
                        }
                        .into()
                    })
            })
            .await?;
        Ok(Some(bytes))
    }

    async fn fetch_manifest(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        url: Option<&str>,
    ) -> Result<Option<(Vec<u8>, Manifest)>, Error> {
        match url {
            Some(_) => {
                let Some((bytes, manifest)) =
                    self.http.fetch_manifest(limiter, app_name, url).await?
                else {
                    return Ok(None);
                };
                self.cache.put_manifest(app_name, &bytes).await?;
                Ok(Some((bytes, manifest)))
            }
            None => match self.cache.pinned_manifest(app_name).await? {
                Some(bytes) => {
                    let manifest = Manifest::parse(&bytes)?;
                    Ok(Some((bytes, manifest)))
                }
                None => Ok(None),
            },
        }
    }

    async fn pin(
        &self,
        app_name: &str,
        manifest: &Manifest,
        raw_manifest: &[u8],
    ) -> Result<(), Error> {
        let manifest_file_hash = self.cache.put_manifest(app_name, raw_manifest).await?;

        // Pin the modules this cache actually holds. Modules served from
        // an embedded bundle are not cache entries and need no pin.
        let mut file_hashes = Vec::new();
        for hash in manifest.module_hashes() {
            if self.cache.contains(&hash).await? {
                file_hashes.push(hash);
            }
        }
        file_hashes.push(manifest_file_hash);

        self.cache
            .pin(app_name, &manifest.content_hash()?, &file_hashes)
            .await
    }

    async fn unpin(&self, app_name: &str, manifest: &Manifest) -> Result<(), Error> {
        self.cache.unpin(app_name, &manifest.content_hash()?).await
    }
}

/// An ordered list of fetch sources.
///
/// Modules are consulted in order (local-first: hashes guarantee
/// equivalence). Manifests are consulted in reverse (network-first, so
/// freshness wins) unless no URL is given, in which case only local
/// sources are consulted, in order.
pub struct FetcherChain {
    fetchers: Vec<Arc<dyn Fetcher>>,
}

impl FetcherChain {
    #[must_use]
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self { fetchers }
    }

    /// Fetch a module's bytes from the first source that has them.
    ///
    /// # Errors
    /// Propagates the first source error; fails with
    /// `NetworkError::FetchFailed` if every source misses.
    pub async fn fetch(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        id: &str,
        sha256: &Sha256Digest,
        url: &str,
    ) -> Result<Vec<u8>, Error> {
        for fetcher in &self.fetchers {
            if let Some(bytes) = fetcher.fetch(limiter, app_name, id, sha256, url).await? {
                return Ok(bytes);
            }
        }

        Err(NetworkError::FetchFailed {
            url: url.to_string(),
            message: format!("no source has module {id}"),
        }
        .into())
    }

    /// Fetch an application's manifest.
    ///
    /// With a URL the sources are consulted network-first and a source
    /// failure falls through to the next one, so a cached or embedded
    /// manifest is accepted exactly when the network path fails. With no
    /// URL only local sources answer, in chain order (embedded first).
    ///
    /// # Errors
    /// Surfaces the last source error if every source misses, or
    /// `LoaderError::ManifestNotFound` if they all miss silently.
    pub async fn fetch_manifest(
        &self,
        limiter: &ConcurrencyLimiter,
        app_name: &str,
        url: Option<&str>,
    ) -> Result<(Vec<u8>, Manifest), Error> {
        let mut last_error = None;

        let ordered: Vec<&Arc<dyn Fetcher>> = if url.is_some() {
            self.fetchers.iter().rev().collect()
        } else {
            self.fetchers.iter().collect()
        };

        for fetcher in ordered {
            match fetcher.fetch_manifest(limiter, app_name, url).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => {}
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LoaderError::ManifestNotFound {
                app_name: app_name.to_string(),
            }
            .into()
        }))
    }

    /// Pin a manifest and its modules in every source that supports it.
    ///
    /// # Errors
    /// Returns an error if a pin cannot be recorded.
    pub async fn pin(
        &self,
        app_name: &str,
        manifest: &Manifest,
        raw_manifest: &[u8],
    ) -> Result<(), Error> {
        for fetcher in &self.fetchers {
            fetcher.pin(app_name, manifest, raw_manifest).await?;
        }
        Ok(())
    }

    /// Release a manifest's pin in every source that supports it.
    ///
    /// # Errors
    /// Returns an error if a pin cannot be released.
    pub async fn unpin(&self, app_name: &str, manifest: &Manifest) -> Result<(), Error> {
        for fetcher in &self.fetchers {
            fetcher.unpin(app_name, manifest).await?;
        }
        Ok(())
    }
}
