//! The embedded relational metadata store (`meta.db`): a single `packages`
//! table keyed by digest. Single-writer, multi-reader: reads use plain
//! `SELECT`s against the pool, writes go through `with_transaction`.

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::digest::Digest;
use crate::error::CacheError;

use super::types::{CachedBlob, IntegrityReport, ParsedPackage};

pub async fn connect(db_path: &std::path::Path) -> Result<SqlitePool, CacheError> {
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&url).await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS packages (
            digest          TEXT PRIMARY KEY,
            size            INTEGER NOT NULL,
            filename        TEXT NOT NULL,
            name            TEXT,
            version         TEXT,
            arch            TEXT,
            inserted_at     INTEGER NOT NULL,
            last_accessed   INTEGER NOT NULL,
            access_count    INTEGER NOT NULL DEFAULT 0,
            bytes_served    INTEGER NOT NULL DEFAULT 0,
            pinned          INTEGER NOT NULL DEFAULT 0,
            announced       INTEGER NOT NULL DEFAULT 0,
            last_announce   INTEGER
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_packages_last_accessed ON packages(last_accessed, access_count)")
        .execute(&pool)
        .await?;
    Ok(pool)
}

fn row_to_blob(row: &sqlx::sqlite::SqliteRow) -> Result<CachedBlob, CacheError> {
    let digest: String = row.try_get("digest")?;
    let digest = digest
        .parse::<Digest>()
        .map_err(|e| CacheError::DiskCorruption(format!("malformed digest row: {e}")))?;
    Ok(CachedBlob {
        digest,
        size: row.try_get::<i64, _>("size")? as u64,
        filename: row.try_get("filename")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        arch: row.try_get("arch")?,
        inserted_at: ts_to_datetime(row.try_get("inserted_at")?),
        last_accessed: ts_to_datetime(row.try_get("last_accessed")?),
        access_count: row.try_get::<i64, _>("access_count")? as u64,
        bytes_served: row.try_get::<i64, _>("bytes_served")? as u64,
        pinned: row.try_get::<i64, _>("pinned")? != 0,
        announced: row.try_get::<i64, _>("announced")? != 0,
        last_announce: row
            .try_get::<Option<i64>, _>("last_announce")?
            .map(ts_to_datetime),
    })
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

pub async fn find(pool: &SqlitePool, digest: &Digest) -> Result<Option<CachedBlob>, CacheError> {
    let row = sqlx::query("SELECT * FROM packages WHERE digest = ?")
        .bind(digest.to_hex())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_blob).transpose()
}

pub async fn exists(pool: &SqlitePool, digest: &Digest) -> Result<bool, CacheError> {
    let row = sqlx::query("SELECT 1 FROM packages WHERE digest = ?")
        .bind(digest.to_hex())
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<CachedBlob>, CacheError> {
    let rows = sqlx::query("SELECT * FROM packages").fetch_all(pool).await?;
    rows.iter().map(row_to_blob).collect()
}

pub async fn popular(pool: &SqlitePool, n: u32) -> Result<Vec<CachedBlob>, CacheError> {
    let rows = sqlx::query("SELECT * FROM packages ORDER BY access_count DESC LIMIT ?")
        .bind(n)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_blob).collect()
}

pub async fn recent(pool: &SqlitePool, n: u32) -> Result<Vec<CachedBlob>, CacheError> {
    let rows = sqlx::query("SELECT * FROM packages ORDER BY inserted_at DESC LIMIT ?")
        .bind(n)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_blob).collect()
}

pub async fn list_pinned(pool: &SqlitePool) -> Result<Vec<CachedBlob>, CacheError> {
    let rows = sqlx::query("SELECT * FROM packages WHERE pinned = 1")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_blob).collect()
}

pub async fn unannounced(pool: &SqlitePool, stale_before: DateTime<Utc>) -> Result<Vec<Digest>, CacheError> {
    let rows = sqlx::query(
        "SELECT digest FROM packages WHERE announced = 0 OR last_announce < ?",
    )
    .bind(stale_before.timestamp())
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| {
            r.try_get::<String, _>("digest")
                .map_err(CacheError::from)
                .and_then(|s| {
                    s.parse()
                        .map_err(|e| CacheError::DiskCorruption(format!("{e}")))
                })
        })
        .collect()
}

/// Eviction candidates ordered least-recently-accessed first among unpinned
/// rows, ties broken by smallest access_count.
pub async fn eviction_candidates(pool: &SqlitePool) -> Result<Vec<CachedBlob>, CacheError> {
    let rows = sqlx::query(
        "SELECT * FROM packages WHERE pinned = 0 ORDER BY last_accessed ASC, access_count ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_blob).collect()
}

pub async fn sum_unpinned_size(pool: &SqlitePool) -> Result<u64, CacheError> {
    let row = sqlx::query("SELECT COALESCE(SUM(size), 0) AS total FROM packages WHERE pinned = 0")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<i64, _>("total")? as u64)
}

pub async fn stats(pool: &SqlitePool) -> Result<(u64, u64, u64, u64), CacheError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n, COALESCE(SUM(size),0) AS total, \
         COALESCE(SUM(CASE WHEN pinned=1 THEN 1 ELSE 0 END),0) AS pinned, \
         COALESCE(SUM(bytes_served),0) AS served FROM packages",
    )
    .fetch_one(pool)
    .await?;
    Ok((
        row.try_get::<i64, _>("n")? as u64,
        row.try_get::<i64, _>("total")? as u64,
        row.try_get::<i64, _>("pinned")? as u64,
        row.try_get::<i64, _>("served")? as u64,
    ))
}

/// Inserts a new row for a freshly-written blob in the same transaction the
/// caller uses to make the rename durable.
pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    digest: &Digest,
    size: u64,
    filename: &str,
    parsed: &ParsedPackage,
    now: DateTime<Utc>,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO packages \
         (digest, size, filename, name, version, arch, inserted_at, last_accessed, access_count, bytes_served, pinned, announced) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0) \
         ON CONFLICT(digest) DO NOTHING",
    )
    .bind(digest.to_hex())
    .bind(size as i64)
    .bind(filename)
    .bind(&parsed.name)
    .bind(&parsed.version)
    .bind(&parsed.arch)
    .bind(now.timestamp())
    .bind(now.timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn touch_access(pool: &SqlitePool, digest: &Digest, now: DateTime<Utc>) -> Result<(), CacheError> {
    sqlx::query(
        "UPDATE packages SET access_count = access_count + 1, bytes_served = bytes_served + size, last_accessed = ? WHERE digest = ?",
    )
    .bind(now.timestamp())
    .bind(digest.to_hex())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(tx: &mut Transaction<'_, Sqlite>, digest: &Digest) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM packages WHERE digest = ?")
        .bind(digest.to_hex())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_pinned(pool: &SqlitePool, digest: &Digest, pinned: bool) -> Result<(), CacheError> {
    let changed = sqlx::query("UPDATE packages SET pinned = ? WHERE digest = ?")
        .bind(pinned as i64)
        .bind(digest.to_hex())
        .execute(pool)
        .await?;
    if changed.rows_affected() == 0 {
        return Err(CacheError::NotFound(*digest));
    }
    Ok(())
}

pub async fn mark_announced(pool: &SqlitePool, digest: &Digest, now: DateTime<Utc>) -> Result<(), CacheError> {
    sqlx::query("UPDATE packages SET announced = 1, last_announce = ? WHERE digest = ?")
        .bind(now.timestamp())
        .bind(digest.to_hex())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn check_integrity(pool: &SqlitePool) -> Result<IntegrityReport, CacheError> {
    let blobs = list(pool).await?;
    let mut report = IntegrityReport {
        rows_checked: blobs.len() as u64,
        ..Default::default()
    };
    let mut seen = std::collections::HashSet::new();
    for blob in &blobs {
        if !seen.insert(blob.digest) {
            report.duplicate_digests.push(blob.digest);
        }
        if blob.size == 0 {
            report.zero_sized_rows.push(blob.digest);
        }
    }
    Ok(report)
}
