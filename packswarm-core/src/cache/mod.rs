//! Sharded on-disk blob store keyed by digest, with embedded relational
//! metadata. Disk layout: `<base>/packages/sha256/<xx>/<64-hex>`, mode
//! 0644; metadata lives in `<base>/meta.db`.
//!
//! Concurrent `put`s of the same digest are coalesced through a per-digest
//! lock table so the second caller observes "already cached" rather than
//! racing the first to completion.

mod store;
mod types;

pub use types::{CacheStats, CachedBlob, IntegrityReport, ParsedPackage, VerifyReport};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::digest::{Digest, DigestHasher};
use crate::error::{CacheError, CacheResult};

#[cfg(unix)]
const PAYLOAD_MODE: u32 = 0o644;

pub struct ContentCache {
    base: PathBuf,
    pool: SqlitePool,
    max_size: u64,
    min_free_space: u64,
    write_locks: DashMap<Digest, Arc<AsyncMutex<()>>>,
}

impl ContentCache {
    pub async fn open(base: impl Into<PathBuf>, max_size: u64, min_free_space: u64) -> CacheResult<Self> {
        let base = base.into();
        fs::create_dir_all(base.join("packages").join("sha256")).await?;
        let pool = store::connect(&base.join("meta.db")).await?;
        Ok(Self {
            base,
            pool,
            max_size,
            min_free_space,
            write_locks: DashMap::new(),
        })
    }

    fn payload_path(&self, digest: &Digest) -> PathBuf {
        self.base
            .join("packages")
            .join("sha256")
            .join(digest.shard_prefix())
            .join(digest.to_hex())
    }

    fn lock_for(&self, digest: &Digest) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .entry(*digest)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn has(&self, digest: &Digest) -> CacheResult<bool> {
        store::exists(&self.pool, digest).await
    }

    /// Opens the payload read-only and bumps access accounting under the
    /// same logical update as the row touch.
    pub async fn get(&self, digest: &Digest) -> CacheResult<Option<(fs::File, u64)>> {
        let Some(blob) = store::find(&self.pool, digest).await? else {
            return Ok(None);
        };
        let path = self.payload_path(digest);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%digest, "row present but payload file missing");
                return Err(CacheError::DiskCorruption(format!(
                    "payload missing for {digest}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        store::touch_access(&self.pool, digest, Utc::now()).await?;
        Ok(Some((file, blob.size)))
    }

    /// Streams `reader` into a temp file while hashing, verifies the digest,
    /// ensures free space, then atomically renames into place and commits
    /// the metadata row in one transaction.
    pub async fn put<R>(
        &self,
        mut reader: R,
        expected_digest: Digest,
        filename: &str,
        parsed: ParsedPackage,
    ) -> CacheResult<CachedBlob>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let lock = self.lock_for(&expected_digest);
        let _guard = lock.lock().await;

        if let Some(existing) = store::find(&self.pool, &expected_digest).await? {
            debug!(%expected_digest, "put: already cached, idempotent no-op");
            return Ok(existing);
        }

        let staging_dir = self.base.join("packages").join(".staging");
        fs::create_dir_all(&staging_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("put-")
            .tempfile_in(&staging_dir)
            .map_err(CacheError::Io)?;
        let temp_path = temp.path().to_path_buf();
        let mut temp_file = fs::File::from_std(temp.reopen().map_err(CacheError::Io)?);

        let mut hasher = DigestHasher::new();
        let mut buf = vec![0u8; 256 * 1024];
        let mut size: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp_file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        temp_file.flush().await?;
        drop(temp_file);

        let actual = hasher.finalize();
        if actual != expected_digest {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CacheError::DigestMismatch {
                expected: expected_digest,
                actual,
            });
        }

        self.ensure_free_space(size).await?;

        let final_path = self.payload_path(&expected_digest);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tx = self.pool.begin().await?;
        store::insert(&mut tx, &expected_digest, size, filename, &parsed, Utc::now()).await?;
        fs::rename(&temp_path, &final_path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(PAYLOAD_MODE);
            let _ = std::fs::set_permissions(&final_path, perms);
        }
        tx.commit().await?;

        info!(digest = %expected_digest, %size, "cached new blob");
        store::find(&self.pool, &expected_digest)
            .await?
            .ok_or(CacheError::NotFound(expected_digest))
    }

    /// Actual free bytes on the filesystem backing the cache base
    /// directory, per `statvfs` (via `fs2`). `min_free_space` is a
    /// disk-level guard, not just a budget over the cache's own rows:
    /// other processes sharing the disk can eat into real free space
    /// independently of anything this cache has accounted for.
    fn available_space(&self) -> CacheResult<u64> {
        fs2::available_space(&self.base).map_err(CacheError::Io)
    }

    /// Evicts least-recently-accessed unpinned rows until
    /// `sum(unpinned) + incoming <= max_size - min_free_space` *and* the
    /// filesystem reports at least `incoming + min_free_space` bytes
    /// actually free. Fails with `CacheFull` if even evicting everything
    /// unpinned doesn't make room under either check.
    async fn ensure_free_space(&self, incoming: u64) -> CacheResult<()> {
        if self.max_size == 0 {
            return Ok(());
        }
        let budget = self.max_size.saturating_sub(self.min_free_space);
        let required_free = incoming.saturating_add(self.min_free_space);
        loop {
            let current = store::sum_unpinned_size(&self.pool).await?;
            let disk_free = self.available_space()?;
            let db_fits = current + incoming <= budget;
            let disk_fits = disk_free >= required_free;
            if db_fits && disk_fits {
                break;
            }
            let candidates = store::eviction_candidates(&self.pool).await?;
            let Some(victim) = candidates.first() else {
                let needed = if !db_fits {
                    (current + incoming).saturating_sub(budget)
                } else {
                    required_free.saturating_sub(disk_free)
                };
                return Err(CacheError::CacheFull { needed });
            };
            self.delete(&victim.digest).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, digest: &Digest) -> CacheResult<()> {
        let path = self.payload_path(digest);
        let mut tx = self.pool.begin().await?;
        store::delete(&mut tx, digest).await?;
        tx.commit().await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn pin(&self, digest: &Digest) -> CacheResult<()> {
        store::set_pinned(&self.pool, digest, true).await
    }

    pub async fn unpin(&self, digest: &Digest) -> CacheResult<()> {
        store::set_pinned(&self.pool, digest, false).await
    }

    pub async fn list_pinned(&self) -> CacheResult<Vec<CachedBlob>> {
        store::list_pinned(&self.pool).await
    }

    pub async fn list(&self) -> CacheResult<Vec<CachedBlob>> {
        store::list(&self.pool).await
    }

    pub async fn popular(&self, n: u32) -> CacheResult<Vec<CachedBlob>> {
        store::popular(&self.pool, n).await
    }

    pub async fn recent(&self, n: u32) -> CacheResult<Vec<CachedBlob>> {
        store::recent(&self.pool, n).await
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let (blob_count, total_size, pinned_count, bytes_served) = store::stats(&self.pool).await?;
        Ok(CacheStats {
            blob_count,
            total_size,
            pinned_count,
            bytes_served,
            max_size: self.max_size,
        })
    }

    pub async fn get_unannounced(&self, announce_interval: chrono::Duration) -> CacheResult<Vec<Digest>> {
        store::unannounced(&self.pool, Utc::now() - announce_interval).await
    }

    pub async fn mark_announced(&self, digest: &Digest) -> CacheResult<()> {
        store::mark_announced(&self.pool, digest, Utc::now()).await
    }

    pub async fn check_integrity(&self) -> CacheResult<IntegrityReport> {
        store::check_integrity(&self.pool).await
    }

    /// Re-hashes every row's payload file without mutating anything.
    pub async fn verify(&self) -> CacheResult<VerifyReport> {
        let blobs = store::list(&self.pool).await?;
        let mut report = VerifyReport {
            checked: blobs.len() as u64,
            ..Default::default()
        };
        for blob in blobs {
            let path = self.payload_path(&blob.digest);
            let bytes = match fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.missing_files.push(blob.digest);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if Digest::of(&bytes) != blob.digest {
                report.hash_mismatches.push(blob.digest);
            }
        }
        Ok(report)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn payload(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        rand::rng().fill_bytes(&mut buf);
        buf
    }

    async fn open_cache(max_size: u64) -> (ContentCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), max_size, 0).await.unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn round_trip_put_then_get() {
        let (cache, _dir) = open_cache(0).await;
        let data = payload(4096);
        let digest = Digest::of(&data);
        cache
            .put(data.as_slice(), digest, "pkg.deb", ParsedPackage::default())
            .await
            .unwrap();

        let (mut file, size) = cache.get(&digest).await.unwrap().unwrap();
        assert_eq!(size, data.len() as u64);
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn digest_mismatch_is_rejected() {
        let (cache, _dir) = open_cache(0).await;
        let data = payload(1024);
        let wrong = Digest::of(b"not the payload");
        let err = cache
            .put(data.as_slice(), wrong, "pkg.deb", ParsedPackage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DigestMismatch { .. }));
        assert!(!cache.has(&wrong).await.unwrap());
    }

    #[tokio::test]
    async fn idempotent_put_of_identical_digest() {
        let (cache, _dir) = open_cache(0).await;
        let data = payload(2048);
        let digest = Digest::of(&data);
        cache
            .put(data.as_slice(), digest, "a.deb", ParsedPackage::default())
            .await
            .unwrap();
        cache
            .put(data.as_slice(), digest, "a.deb", ParsedPackage::default())
            .await
            .unwrap();
        assert_eq!(cache.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn eviction_keeps_pinned_rows_and_stays_under_budget() {
        let (cache, _dir) = open_cache(10_000).await;
        let mut digests = Vec::new();
        for i in 0..20 {
            let data = payload(1000);
            let digest = Digest::of(&data);
            cache
                .put(
                    data.as_slice(),
                    digest,
                    &format!("pkg-{i}.deb"),
                    ParsedPackage::default(),
                )
                .await
                .unwrap();
            digests.push(digest);
            if i == 0 {
                cache.pin(&digest).await.unwrap();
            }
            let stats = cache.stats().await.unwrap();
            assert!(stats.total_size <= cache.max_size);
        }
        assert!(cache.has(&digests[0]).await.unwrap(), "pinned row survives");
        let pinned = cache.list_pinned().await.unwrap();
        assert_eq!(pinned.len(), 1);
    }

    #[tokio::test]
    async fn cache_full_when_everything_is_pinned() {
        let (cache, _dir) = open_cache(2000).await;
        let first = payload(1500);
        let d1 = Digest::of(&first);
        cache
            .put(first.as_slice(), d1, "a.deb", ParsedPackage::default())
            .await
            .unwrap();
        cache.pin(&d1).await.unwrap();

        let second = payload(1500);
        let d2 = Digest::of(&second);
        let err = cache
            .put(second.as_slice(), d2, "b.deb", ParsedPackage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { .. }));
    }

    #[tokio::test]
    async fn verify_detects_missing_payload_file() {
        let (cache, _dir) = open_cache(0).await;
        let data = payload(512);
        let digest = Digest::of(&data);
        cache
            .put(data.as_slice(), digest, "a.deb", ParsedPackage::default())
            .await
            .unwrap();

        std::fs::remove_file(cache.payload_path(&digest)).unwrap();
        let report = cache.verify().await.unwrap();
        assert_eq!(report.missing_files, vec![digest]);
    }

    #[tokio::test]
    async fn get_increments_access_accounting() {
        let (cache, _dir) = open_cache(0).await;
        let data = payload(256);
        let digest = Digest::of(&data);
        cache
            .put(data.as_slice(), digest, "a.deb", ParsedPackage::default())
            .await
            .unwrap();
        cache.get(&digest).await.unwrap();
        cache.get(&digest).await.unwrap();
        let blob = store::find(&cache.pool, &digest).await.unwrap().unwrap();
        assert_eq!(blob.access_count, 2);
        assert_eq!(blob.bytes_served, data.len() as u64 * 2);
    }
}
