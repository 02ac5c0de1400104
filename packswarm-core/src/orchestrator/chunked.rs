//! Parallel chunked download: partitions a known-size payload into
//! fixed-size chunks and fetches them concurrently from the overlay's
//! provider set, each chunk bounded by the adaptive timeout manager and
//! ranked through the peer scorer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::digest::Digest;
use crate::overlay::{Overlay, PeerId};
use crate::rate_limiter::{Direction, RateLimiter};
use crate::scorer::PeerScorer;
use crate::timeouts::{Operation, TimeoutManager};

use super::peer_transfer;

#[derive(Debug, Clone)]
pub struct ChunkedDownloadConfig {
    pub chunk_size: u64,
    pub max_workers: usize,
    pub retry_max_attempts: u32,
    pub retry_max_age: Duration,
    pub max_providers: usize,
}

impl Default for ChunkedDownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            max_workers: 4,
            retry_max_attempts: 16,
            retry_max_age: Duration::from_secs(120),
            max_providers: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkedDownloadError {
    #[error("no providers advertise digest {0}")]
    NoProviders(Digest),

    #[error("retry budget exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),

    #[error("retry wall-clock budget exceeded")]
    RetryAgeExceeded,

    #[error("temp file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

struct Job {
    index: u64,
    offset: u64,
    length: u64,
}

/// Downloads `digest` (`size` bytes total) from `providers`, writing
/// reassembled bytes into a fresh temp file under `staging_dir`. Returns the
/// path to that file on success; the caller is responsible for feeding it
/// through `ContentCache::put` for verification and insertion.
#[allow(clippy::too_many_arguments)]
pub async fn download(
    overlay: Arc<dyn Overlay>,
    scorer: Arc<PeerScorer>,
    timeouts: Arc<TimeoutManager>,
    rate_limiter: Arc<RateLimiter>,
    digest: Digest,
    size: u64,
    providers: Vec<PeerId>,
    staging_dir: &std::path::Path,
    config: &ChunkedDownloadConfig,
    urgent: bool,
) -> Result<PathBuf, ChunkedDownloadError> {
    if providers.is_empty() {
        return Err(ChunkedDownloadError::NoProviders(digest));
    }

    tokio::fs::create_dir_all(staging_dir).await?;
    let temp = tempfile::Builder::new()
        .prefix("chunked-")
        .tempfile_in(staging_dir)?;
    let temp_path = temp.path().to_path_buf();
    temp.as_file().set_len(size)?;
    drop(temp);

    let mut jobs = VecDeque::new();
    let mut offset = 0u64;
    let mut index = 0u64;
    while offset < size {
        let length = config.chunk_size.min(size - offset);
        jobs.push_back(Job { index, offset, length });
        offset += length;
        index += 1;
    }
    let total_chunks = jobs.len() as u64;
    let queue = Arc::new(Mutex::new(jobs));
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let deadline = Instant::now() + config.retry_max_age;
    let done = Arc::new(std::sync::atomic::AtomicU64::new(0));

    let workers = config.max_workers.max(1);
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let queue = queue.clone();
        let overlay = overlay.clone();
        let scorer = scorer.clone();
        let timeouts = timeouts.clone();
        let rate_limiter = rate_limiter.clone();
        let providers = providers.clone();
        let attempts = attempts.clone();
        let done = done.clone();
        let temp_path = temp_path.clone();
        let retry_max_attempts = config.retry_max_attempts;
        let max_providers = config.max_providers;

        handles.push(tokio::spawn(async move {
            loop {
                if Instant::now() >= deadline {
                    return Err(ChunkedDownloadError::RetryAgeExceeded);
                }
                let job = { queue.lock().await.pop_front() };
                let Some(job) = job else {
                    return Ok(());
                };

                let candidates: Vec<PeerId> = providers.iter().take(max_providers).cloned().collect();
                let Some(peer) = scorer.top_k(&candidates, 1).into_iter().next() else {
                    queue.lock().await.push_back(job);
                    return Err(ChunkedDownloadError::NoProviders(digest));
                };

                rate_limiter
                    .acquire(Direction::Download, &peer, job.length, urgent)
                    .await;

                let chunk_timeout = timeouts.get_for_size(Operation::ChunkDownload, job.length);
                let started = Instant::now();
                match peer_transfer::fetch_range(
                    overlay.as_ref(),
                    &peer,
                    digest,
                    job.offset,
                    job.length,
                    chunk_timeout,
                )
                .await
                {
                    Ok(bytes) => {
                        let elapsed = started.elapsed();
                        let throughput = bytes.len() as f64 / elapsed.as_secs_f64().max(0.001);
                        scorer.record_success(&peer, elapsed, throughput);
                        timeouts.record_success(Operation::ChunkDownload, elapsed);

                        let mut file = tokio::fs::OpenOptions::new()
                            .write(true)
                            .open(&temp_path)
                            .await?;
                        file.seek(std::io::SeekFrom::Start(job.offset)).await?;
                        file.write_all(&bytes).await?;
                        file.flush().await?;
                        done.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        debug!(%digest, worker = worker_id, chunk = job.index, "chunk fetched");
                    }
                    Err(e) => {
                        warn!(%digest, %peer, chunk = job.index, error = %e, "chunk fetch failed, requeuing");
                        scorer.record_failure(&peer);
                        timeouts.record_failure(Operation::ChunkDownload);
                        let prior = attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                        if prior >= retry_max_attempts {
                            return Err(ChunkedDownloadError::RetryBudgetExhausted(prior));
                        }
                        queue.lock().await.push_back(job);
                    }
                }
            }
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(ChunkedDownloadError::Io(std::io::Error::other(join_err.to_string())))
            }
        }
    }

    if done.load(std::sync::atomic::Ordering::Relaxed) < total_chunks {
        return Err(ChunkedDownloadError::RetryBudgetExhausted(
            attempts.load(std::sync::atomic::Ordering::Relaxed),
        ));
    }

    Ok(temp_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunk_size_is_four_mib() {
        let cfg = ChunkedDownloadConfig::default();
        assert_eq!(cfg.chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn chunk_planning_covers_whole_payload() {
        let size = 16 * 1024 * 1024u64;
        let chunk_size = 4 * 1024 * 1024u64;
        let mut offset = 0u64;
        let mut chunks = 0;
        while offset < size {
            let length = chunk_size.min(size - offset);
            offset += length;
            chunks += 1;
        }
        assert_eq!(chunks, 4);
        assert_eq!(offset, size);
    }
}
