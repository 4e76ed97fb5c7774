//! Runtime SQL queries for the cache index

use crate::models::{FileRecord, FileState};
use sqlx::{query, Row, Sqlite, Transaction};
use zipline_errors::Error;

/// Look up a file record by hash
pub async fn get_file(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
) -> Result<Option<FileRecord>, Error> {
    let row = query(
        "SELECT hash, size, state, manifest_app, last_used_ms
         FROM files WHERE hash = ?1",
    )
    .bind(hash)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| FileRecord {
        hash: r.get("hash"),
        size: r.get("size"),
        state: r.get("state"),
        manifest_app: r.get("manifest_app"),
        last_used_ms: r.get("last_used_ms"),
    }))
}

/// Insert or reset a file record in the dirty state
pub async fn upsert_dirty_file(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
    size: i64,
    now_ms: i64,
) -> Result<(), Error> {
    query(
        "INSERT OR REPLACE INTO files (hash, size, state, manifest_app, last_used_ms)
         VALUES (?1, ?2, ?3, NULL, ?4)",
    )
    .bind(hash)
    .bind(size)
    .bind(FileState::DirtyDownload.as_str())
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Flip a file record to ready
pub async fn mark_file_ready(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
    size: i64,
    now_ms: i64,
) -> Result<(), Error> {
    query("UPDATE files SET state = ?2, size = ?3, last_used_ms = ?4 WHERE hash = ?1")
        .bind(hash)
        .bind(FileState::Ready.as_str())
        .bind(size)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Refresh the last-used timestamp of a file
pub async fn touch_file(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
    now_ms: i64,
) -> Result<(), Error> {
    query("UPDATE files SET last_used_ms = ?2 WHERE hash = ?1")
        .bind(hash)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Stamp a file record as the manifest for an application
pub async fn mark_manifest(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
    app_name: &str,
) -> Result<(), Error> {
    query("UPDATE files SET manifest_app = ?2 WHERE hash = ?1")
        .bind(hash)
        .bind(app_name)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Delete a file record
pub async fn delete_file(tx: &mut Transaction<'_, Sqlite>, hash: &str) -> Result<(), Error> {
    query("DELETE FROM files WHERE hash = ?1")
        .bind(hash)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// All file records, for prune reconciliation
pub async fn all_files(tx: &mut Transaction<'_, Sqlite>) -> Result<Vec<FileRecord>, Error> {
    let rows = query("SELECT hash, size, state, manifest_app, last_used_ms FROM files")
        .fetch_all(&mut **tx)
        .await?;

    Ok(rows
        .into_iter()
        .map(|r| FileRecord {
            hash: r.get("hash"),
            size: r.get("size"),
            state: r.get("state"),
            manifest_app: r.get("manifest_app"),
            last_used_ms: r.get("last_used_ms"),
        })
        .collect())
}

/// Unpinned ready files, least recently used first
pub async fn evictable_files(
    tx: &mut Transaction<'_, Sqlite>,
) -> Result<Vec<FileRecord>, Error> {
    let rows = query(
        "SELECT hash, size, state, manifest_app, last_used_ms
         FROM files
         WHERE state = ?1
           AND hash NOT IN (SELECT file_hash FROM pins)
         ORDER BY last_used_ms ASC",
    )
    .bind(FileState::Ready.as_str())
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| FileRecord {
            hash: r.get("hash"),
            size: r.get("size"),
            state: r.get("state"),
            manifest_app: r.get("manifest_app"),
            last_used_ms: r.get("last_used_ms"),
        })
        .collect())
}

/// Total size of all ready files, pinned included
pub async fn ready_size(tx: &mut Transaction<'_, Sqlite>) -> Result<u64, Error> {
    let row = query("SELECT COALESCE(SUM(size), 0) AS total FROM files WHERE state = ?1")
        .bind(FileState::Ready.as_str())
        .fetch_one(&mut **tx)
        .await?;

    let total: i64 = row.get("total");
    Ok(total.max(0).unsigned_abs())
}

/// Create a pin row
pub async fn insert_pin(
    tx: &mut Transaction<'_, Sqlite>,
    app_name: &str,
    manifest_hash: &str,
    file_hash: &str,
) -> Result<(), Error> {
    query(
        "INSERT OR IGNORE INTO pins (app_name, manifest_hash, file_hash)
         VALUES (?1, ?2, ?3)",
    )
    .bind(app_name)
    .bind(manifest_hash)
    .bind(file_hash)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Remove every pin of an application except the given manifest
pub async fn delete_other_pins(
    tx: &mut Transaction<'_, Sqlite>,
    app_name: &str,
    manifest_hash: &str,
) -> Result<(), Error> {
    query("DELETE FROM pins WHERE app_name = ?1 AND manifest_hash != ?2")
        .bind(app_name)
        .bind(manifest_hash)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Remove one pin of an application
pub async fn delete_pin(
    tx: &mut Transaction<'_, Sqlite>,
    app_name: &str,
    manifest_hash: &str,
) -> Result<(), Error> {
    query("DELETE FROM pins WHERE app_name = ?1 AND manifest_hash = ?2")
        .bind(app_name)
        .bind(manifest_hash)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Newest pinned manifest file hash for an application
pub async fn pinned_manifest_hash(
    tx: &mut Transaction<'_, Sqlite>,
    app_name: &str,
) -> Result<Option<String>, Error> {
    let row = query(
        "SELECT f.hash AS hash
         FROM files f
         JOIN pins p ON p.file_hash = f.hash
         WHERE f.manifest_app = ?1 AND p.app_name = ?1 AND f.state = ?2
         ORDER BY f.last_used_ms DESC
         LIMIT 1",
    )
    .bind(app_name)
    .bind(FileState::Ready.as_str())
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| r.get("hash")))
}
