#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Content-addressed cache for the zipline loader
//!
//! Files are stored in a single directory, named by the lowercase hex
//! of their SHA-256, next to a SQLite index (`zipline.db`) that tracks
//! sizes, states, last-use timestamps and manifest pins. Pins are
//! persisted in the index rather than in memory, so the cache is
//! re-entrant across process restarts: a pinned application can be
//! served entirely offline after a reboot.

pub mod models;
pub mod queries;

use models::FileState;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use zipline_errors::{CacheError, Error, NetworkError};
use zipline_events::{Event, EventEmitter};
use zipline_hash::Sha256Digest;

/// File name of the cache index database
pub const DB_FILE_NAME: &str = "zipline.db";

/// Suffix for downloads in progress
const DIRTY_SUFFIX: &str = ".dirty";

/// Default size bound for unpinned cache content
const DEFAULT_MAX_SIZE_IN_BYTES: u64 = 100 * 1024 * 1024; // 100 MiB

type ProduceResult = Result<Vec<u8>, Error>;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_size_in_bytes: u64,
}

impl CacheConfig {
    /// Create a configuration for a cache directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size_in_bytes: DEFAULT_MAX_SIZE_IN_BYTES,
        }
    }

    /// Set the size bound for unpinned cache content
    #[must_use]
    pub fn with_max_size(mut self, max_size_in_bytes: u64) -> Self {
        self.max_size_in_bytes = max_size_in_bytes;
        self
    }
}

/// Content-addressed cache with a persisted pin index
pub struct Cache {
    dir: PathBuf,
    max_size_in_bytes: u64,
    pool: Pool<Sqlite>,
    events: EventEmitter,
    /// Coalesces concurrent `get_or_put` calls for the same hash. The
    /// lock is held only across map insertion and removal, never across
    /// I/O.
    in_flight: Mutex<HashMap<Sha256Digest, broadcast::Sender<ProduceResult>>>,
}

impl Cache {
    /// Open (or create) a cache directory and its index, then prune.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created, the
    /// database cannot be opened, or migrations fail.
    pub async fn open(config: CacheConfig, events: EventEmitter) -> Result<Self, Error> {
        fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| Error::io_with_path(&e, &config.dir))?;

        let pool = create_pool(&config.dir.join(DB_FILE_NAME)).await?;
        run_migrations(&pool).await?;

        let cache = Self {
            dir: config.dir,
            max_size_in_bytes: config.max_size_in_bytes,
            pool,
            events,
            in_flight: Mutex::new(HashMap::new()),
        };
        cache.prune().await?;
        Ok(cache)
    }

    /// Path of the file backing a cache entry
    #[must_use]
    pub fn file_path(&self, hash: &Sha256Digest) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    fn dirty_path(&self, hash: &Sha256Digest) -> PathBuf {
        self.dir.join(format!("{}{DIRTY_SUFFIX}", hash.to_hex()))
    }

    /// Return the cached bytes for `hash`, or invoke `producer` to
    /// obtain, verify and store them.
    ///
    /// Concurrent calls for the same hash coalesce: the producer runs at
    /// most once, and every waiter observes the same result. A producer
    /// failure wakes all waiters with that failure and leaves the entry
    /// absent.
    ///
    /// # Errors
    /// Returns `NetworkError::ChecksumMismatch` if the producer's output
    /// does not hash to `hash` (nothing is cached), `CacheError::Full`
    /// if the object alone exceeds the size bound, or any producer or
    /// I/O failure.
    pub async fn get_or_put<F, Fut>(&self, hash: &Sha256Digest, producer: F) -> Result<Vec<u8>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, Error>> + Send,
    {
        loop {
            if let Some(bytes) = self.read(hash).await? {
                self.events.emit(Event::CacheHit {
                    hash: hash.to_hex(),
                });
                return Ok(bytes);
            }

            enum Role {
                Produce(broadcast::Sender<ProduceResult>),
                Wait(broadcast::Receiver<ProduceResult>),
            }

            let role = {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(tx) = in_flight.get(hash) {
                    Role::Wait(tx.subscribe())
                } else {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(*hash, tx.clone());
                    Role::Produce(tx)
                }
            };

            match role {
                Role::Wait(mut rx) => {
                    match rx.recv().await {
                        Ok(result) => return result,
                        // The producer went away without publishing;
                        // retry from the top.
                        Err(_) => continue,
                    }
                }
                Role::Produce(tx) => {
                    self.events.emit(Event::CacheMiss {
                        hash: hash.to_hex(),
                    });

                    let result = self.produce_and_store(hash, producer).await;

                    {
                        let mut in_flight = self.in_flight.lock().await;
                        in_flight.remove(hash);
                    }
                    let _ = tx.send(result.clone());

                    return result;
                }
            }
        }
    }

    /// Store manifest bytes as a regular cache entry and stamp the
    /// record as the manifest for `app_name`.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn put_manifest(&self, app_name: &str, bytes: &[u8]) -> Result<Sha256Digest, Error> {
        let hash = Sha256Digest::digest(bytes);
        let owned = bytes.to_vec();
        self.get_or_put(&hash, || async move { Ok(owned) }).await?;

        let mut tx = self.pool.begin().await?;
        queries::mark_manifest(&mut tx, &hash.to_hex(), app_name).await?;
        tx.commit().await?;

        Ok(hash)
    }

    /// Whether a ready entry exists for `hash`
    ///
    /// # Errors
    /// Returns an error on index failure.
    pub async fn contains(&self, hash: &Sha256Digest) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;
        let record = queries::get_file(&mut tx, &hash.to_hex()).await?;
        tx.commit().await?;

        match record {
            Some(record) => Ok(record.state()? == FileState::Ready),
            None => Ok(false),
        }
    }

    /// The newest pinned manifest for an application, if any.
    ///
    /// # Errors
    /// Returns an error on index or file I/O failure.
    pub async fn pinned_manifest(&self, app_name: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut tx = self.pool.begin().await?;
        let hash_hex = queries::pinned_manifest_hash(&mut tx, app_name).await?;
        tx.commit().await?;

        match hash_hex {
            Some(hex) => self.read(&Sha256Digest::from_hex(&hex)?).await,
            None => Ok(None),
        }
    }

    /// Pin a manifest and its files for an application.
    ///
    /// Every listed file must already be `READY`. On success, every
    /// other pin for the same application is released.
    ///
    /// # Errors
    /// Returns `CacheError::PinMissingFile` if a listed file is absent
    /// or not ready.
    pub async fn pin(
        &self,
        app_name: &str,
        manifest_hash: &Sha256Digest,
        file_hashes: &[Sha256Digest],
    ) -> Result<(), Error> {
        let manifest_hex = manifest_hash.to_hex();

        let mut tx = self.pool.begin().await?;
        for hash in file_hashes {
            let hex = hash.to_hex();
            let ready = match queries::get_file(&mut tx, &hex).await? {
                Some(record) => record.state()? == FileState::Ready,
                None => false,
            };
            if !ready {
                return Err(CacheError::PinMissingFile { hash: hex }.into());
            }
            queries::insert_pin(&mut tx, app_name, &manifest_hex, &hex).await?;
        }
        queries::delete_other_pins(&mut tx, app_name, &manifest_hex).await?;
        tx.commit().await?;

        self.evict().await
    }

    /// Release one pin of an application, then run eviction.
    ///
    /// # Errors
    /// Returns an error on index failure.
    pub async fn unpin(&self, app_name: &str, manifest_hash: &Sha256Digest) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        queries::delete_pin(&mut tx, app_name, &manifest_hash.to_hex()).await?;
        tx.commit().await?;

        self.evict().await
    }

    /// Reconcile the index with the filesystem: drop dirty downloads,
    /// drop index rows whose files are gone, delete stray files, then
    /// run eviction.
    ///
    /// # Errors
    /// Returns an error on index or file I/O failure.
    pub async fn prune(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let records = queries::all_files(&mut tx).await?;

        let mut kept = HashSet::new();
        for record in &records {
            let hash = record.hash()?;
            match record.state()? {
                FileState::DirtyDownload => {
                    queries::delete_file(&mut tx, &record.hash).await?;
                    remove_if_present(&self.dirty_path(&hash)).await?;
                    remove_if_present(&self.file_path(&hash)).await?;
                }
                FileState::Ready => {
                    if fs::try_exists(&self.file_path(&hash)).await.unwrap_or(false) {
                        kept.insert(record.hash.clone());
                    } else {
                        queries::delete_file(&mut tx, &record.hash).await?;
                    }
                }
            }
        }
        tx.commit().await?;

        // Files the index does not know about are unreachable; delete.
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io_with_path(&e, &self.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(DB_FILE_NAME) {
                continue;
            }
            let is_stray = name.ends_with(DIRTY_SUFFIX)
                || (Sha256Digest::from_hex(&name).is_ok() && !kept.contains(&name));
            if is_stray {
                remove_if_present(&entry.path()).await?;
            }
        }

        self.evict().await
    }

    /// Total size of all ready files, pinned included. Operator-facing
    /// accounting; the eviction bound covers unpinned files only.
    ///
    /// # Errors
    /// Returns an error on index failure.
    pub async fn size_in_use(&self) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        let size = queries::ready_size(&mut tx).await?;
        tx.commit().await?;
        Ok(size)
    }

    /// Read a ready entry, refreshing its last-used timestamp.
    ///
    /// An index row whose file is missing is dropped and reported as a
    /// miss; a file that no longer matches its digest is removed and
    /// surfaced as `CacheError::Corrupt`.
    async fn read(&self, hash: &Sha256Digest) -> Result<Option<Vec<u8>>, Error> {
        let hex = hash.to_hex();

        let mut tx = self.pool.begin().await?;
        let Some(record) = queries::get_file(&mut tx, &hex).await? else {
            return Ok(None);
        };
        if record.state()? != FileState::Ready {
            return Ok(None);
        }

        let path = self.file_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => {
                if zipline_hash::verify(&bytes, hash) {
                    queries::touch_file(&mut tx, &hex, now_ms()).await?;
                    tx.commit().await?;
                    Ok(Some(bytes))
                } else {
                    queries::delete_file(&mut tx, &hex).await?;
                    tx.commit().await?;
                    remove_if_present(&path).await?;
                    Err(CacheError::Corrupt {
                        message: format!("cached file {hex} does not match its digest"),
                    }
                    .into())
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                queries::delete_file(&mut tx, &hex).await?;
                tx.commit().await?;
                Ok(None)
            }
            Err(e) => Err(Error::io_with_path(&e, path)),
        }
    }

    /// Run the producer, verify its output, and store it: dirty row,
    /// temp file, fsync, rename, then flip the row to ready.
    async fn produce_and_store<F, Fut>(
        &self,
        hash: &Sha256Digest,
        producer: F,
    ) -> Result<Vec<u8>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, Error>> + Send,
    {
        let bytes = producer().await?;

        let actual = Sha256Digest::digest(&bytes);
        if actual != *hash {
            return Err(NetworkError::ChecksumMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            }
            .into());
        }

        let size = bytes.len() as u64;
        if size > self.max_size_in_bytes {
            return Err(CacheError::Full {
                size,
                max_size: self.max_size_in_bytes,
            }
            .into());
        }

        let hex = hash.to_hex();
        let db_size = to_db_size(size);

        let mut tx = self.pool.begin().await?;
        queries::upsert_dirty_file(&mut tx, &hex, db_size, now_ms()).await?;
        tx.commit().await?;

        let dirty = self.dirty_path(hash);
        let mut file = fs::File::create(&dirty)
            .await
            .map_err(|e| Error::io_with_path(&e, &dirty))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::io_with_path(&e, &dirty))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io_with_path(&e, &dirty))?;
        drop(file);

        let path = self.file_path(hash);
        fs::rename(&dirty, &path)
            .await
            .map_err(|e| Error::io_with_path(&e, &path))?;

        let mut tx = self.pool.begin().await?;
        queries::mark_file_ready(&mut tx, &hex, db_size, now_ms()).await?;
        tx.commit().await?;

        self.evict().await?;
        Ok(bytes)
    }

    /// Delete least-recently-used unpinned files until their total size
    /// fits the bound. Pinned files are never victims.
    async fn evict(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let evictable = queries::evictable_files(&mut tx).await?;

        let mut total: u64 = evictable
            .iter()
            .map(|r| r.size.max(0).unsigned_abs())
            .sum();

        let mut victims = Vec::new();
        for record in &evictable {
            if total <= self.max_size_in_bytes {
                break;
            }
            total -= record.size.max(0).unsigned_abs();
            queries::delete_file(&mut tx, &record.hash).await?;
            victims.push(record.clone());
        }
        tx.commit().await?;

        for victim in victims {
            remove_if_present(&self.dir.join(&victim.hash)).await?;
            self.events.emit(Event::CacheEvicted {
                hash: victim.hash,
                size: victim.size.max(0).unsigned_abs(),
            });
        }

        Ok(())
    }
}

/// Create the SQLite connection pool for a cache index
///
/// # Errors
/// Returns an error if the database connection fails.
pub async fn create_pool(db_path: &Path) -> Result<Pool<Sqlite>, Error> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| {
            CacheError::Database {
                message: e.to_string(),
            }
            .into()
        })
}

/// Run database migrations
///
/// # Errors
/// Returns an error if any migration fails to execute.
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        CacheError::MigrationFailed {
            message: e.to_string(),
        }
        .into()
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_db_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

async fn remove_if_present(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_with_path(&e, path)),
    }
}
