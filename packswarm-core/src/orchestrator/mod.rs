//! The fetch orchestrator: the state machine driving a single client request
//! end-to-end. `ParseRequest -> IndexLookup -> CacheProbe ->
//! FleetDecide -> {FetchLAN, WaitPeer, FetchWAN} -> Verify -> CacheInsert ->
//! Announce -> Done`, with a mirror fallback on any exhaustion path.

pub mod chunked;
pub mod peer_transfer;
mod tee;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::cache::{ContentCache, ParsedPackage};
use crate::digest::Digest;
use crate::error::{CacheError, OrchestratorError, OrchestratorResult};
use crate::fleet::{Decision, Fetcher, FleetCoordinator, FleetOutcome};
use crate::index::{IndexEntry, PackageIndex};
use crate::mirror::{ByteStream, MirrorClient};
use crate::overlay::{Overlay, PeerId};
use crate::rate_limiter::{Direction, RateLimiter};
use crate::scorer::PeerScorer;
use crate::timeouts::{Operation, TimeoutManager};

use chunked::ChunkedDownloadConfig;

const URGENT_MARKERS: [&str; 4] = ["-security", "/security/", "-updates", "/updates/"];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mirror_base_url: String,
    pub mirror_timeout: Duration,
    pub fleet_wait_timeout: Duration,
    pub staging_dir: PathBuf,
    pub chunked: ChunkedDownloadConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mirror_base_url: String::new(),
            mirror_timeout: Duration::from_secs(15),
            fleet_wait_timeout: Duration::from_secs(300),
            staging_dir: PathBuf::from("/tmp/packswarm-staging"),
            chunked: ChunkedDownloadConfig::default(),
        }
    }
}

/// Which source category ultimately served a request. A tagged variant
/// for dynamic source polymorphism; the state machine below switches on
/// this implicitly through control flow rather than an explicit
/// `try_fetch` trait object, since each source has a distinct
/// retry/verify shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Peer(PeerId),
    Wan,
    Mirror,
}

pub struct FetchOutcome {
    pub digest: Option<Digest>,
    pub size: Option<u64>,
    pub body: ByteStream,
    pub source: FetchSource,
}

fn file_to_stream(file: tokio::fs::File) -> ByteStream {
    Box::pin(ReaderStream::new(file))
}

/// True if `path` matches one of the urgent-traffic substrings,
/// case-insensitively.
pub fn is_urgent(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    URGENT_MARKERS.iter().any(|m| lower.contains(m))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A single request's source-category retry budget: `retry_max_attempts`
/// spendable within `retry_max_age` wall-clock of the request starting.
/// `chunked::download` tracks its own per-chunk budget separately; this one
/// governs the coarser FetchLAN -> FetchWAN(peer) -> Mirror handoff in
/// `fetch_known_digest`.
struct RetryBudget {
    attempts_left: u32,
    deadline: Instant,
}

impl RetryBudget {
    fn new(config: &ChunkedDownloadConfig) -> Self {
        Self {
            attempts_left: config.retry_max_attempts,
            deadline: Instant::now() + config.retry_max_age,
        }
    }

    /// Spends one attempt and reports whether the caller may take it.
    fn spend(&mut self) -> bool {
        if self.attempts_left == 0 || Instant::now() >= self.deadline {
            return false;
        }
        self.attempts_left -= 1;
        true
    }
}

pub struct FetchOrchestrator {
    cache: Arc<ContentCache>,
    index: Arc<PackageIndex>,
    fleet: Arc<FleetCoordinator>,
    scorer: Arc<PeerScorer>,
    timeouts: Arc<TimeoutManager>,
    overlay: Arc<dyn Overlay>,
    mirror: Arc<dyn MirrorClient>,
    rate_limiter: Arc<RateLimiter>,
    config: OrchestratorConfig,
}

impl FetchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ContentCache>,
        index: Arc<PackageIndex>,
        fleet: Arc<FleetCoordinator>,
        scorer: Arc<PeerScorer>,
        timeouts: Arc<TimeoutManager>,
        overlay: Arc<dyn Overlay>,
        mirror: Arc<dyn MirrorClient>,
        rate_limiter: Arc<RateLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cache,
            index,
            fleet,
            scorer,
            timeouts,
            overlay,
            mirror,
            rate_limiter,
            config,
        }
    }

    /// `ParseRequest -> IndexLookup -> ...`. `path` is the request's URL
    /// path, as forwarded by the package manager (e.g.
    /// `/ubuntu/pool/main/x/xyz_1.2_amd64.deb`). Urgency is
    /// detected once here and threaded through every downstream transfer so
    /// it can bypass the rate limiter's global bucket.
    pub async fn handle_request(&self, path: &str) -> OrchestratorResult<FetchOutcome> {
        let urgent = is_urgent(path);
        let Some((_matched_key, entry)) = self.index.lookup_suffix(path) else {
            debug!(path, "no index entry, routing straight to mirror");
            return self.stream_from_mirror_uncached(path).await;
        };

        if self.cache.has(&entry.digest).await? {
            return self.serve_from_cache(entry.digest).await;
        }

        match self.fetch_known_digest(path, &entry, urgent).await {
            Ok(outcome) => Ok(outcome),
            Err(peer_wan_err) => {
                warn!(path, error = %peer_wan_err, "peer/WAN paths exhausted, falling back to mirror");
                self.stream_from_mirror_known(path, &entry, urgent).await.map_err(|mirror_err| {
                    // Surface the original exhaustion reason: the mirror's
                    // own failure is secondary context in the log.
                    warn!(path, error = %mirror_err, "mirror fallback also failed");
                    peer_wan_err
                })
            }
        }
    }

    async fn serve_from_cache(&self, digest: Digest) -> OrchestratorResult<FetchOutcome> {
        let (file, size) = self
            .cache
            .get(&digest)
            .await?
            .ok_or(CacheError::NotFound(digest))?;
        Ok(FetchOutcome {
            digest: Some(digest),
            size: Some(size),
            body: file_to_stream(file),
            source: FetchSource::Cache,
        })
    }

    /// `FleetDecide -> {FetchLAN, WaitPeer, FetchWAN}`, each eventually
    /// landing in `Verify -> CacheInsert -> Announce -> Done`. A single
    /// request's retry budget (`retry_max_attempts` within `retry_max_age`)
    /// governs moving to the next source category — FetchLAN fails over to
    /// FetchWAN(peer) before this falls through to the mirror in
    /// `handle_request` — never back onto a peer/category that already
    /// produced a digest mismatch.
    async fn fetch_known_digest(
        &self,
        path: &str,
        entry: &IndexEntry,
        urgent: bool,
    ) -> OrchestratorResult<FetchOutcome> {
        let want = self.fleet.want_package(entry.digest, entry.size).await?;
        let mut retries = RetryBudget::new(&self.config.chunked);

        match want.decision {
            Decision::FetchLAN(peer) => {
                match self.fetch_from_single_peer(path, entry, peer, urgent).await {
                    Ok(outcome) => Ok(outcome),
                    Err(lan_err) if retries.spend() => {
                        warn!(%entry.digest, error = %lan_err, "LAN peer fetch failed, retrying over WAN");
                        self.fetch_wan(path, entry, urgent).await
                    }
                    Err(lan_err) => Err(lan_err),
                }
            }
            Decision::WaitPeer(fetcher) => {
                let wait = want.wait.expect("WaitPeer decision always carries a wait handle");
                match tokio::time::timeout(self.config.fleet_wait_timeout, wait).await {
                    Ok(Ok(FleetOutcome::Success)) => match fetcher {
                        Fetcher::Peer(peer) => {
                            match self.fetch_from_single_peer(path, entry, peer, urgent).await {
                                Ok(outcome) => Ok(outcome),
                                Err(lan_err) if retries.spend() => {
                                    warn!(%entry.digest, error = %lan_err, "LAN peer fetch failed, retrying over WAN");
                                    self.fetch_wan(path, entry, urgent).await
                                }
                                Err(lan_err) => Err(lan_err),
                            }
                        }
                        Fetcher::SelfNode => {
                            // We were the WAN winner all along (e.g. a
                            // concurrent local request); the blob should now
                            // be cached.
                            self.serve_from_cache(entry.digest).await
                        }
                    },
                    Ok(Ok(FleetOutcome::Failed(reason))) => {
                        warn!(%entry.digest, reason, "fleet winner failed, attempting WAN ourselves");
                        self.fetch_wan(path, entry, urgent).await
                    }
                    Ok(Err(_)) | Err(_) => {
                        warn!(%entry.digest, "fleet wait timed out or winner vanished, attempting WAN ourselves");
                        self.fetch_wan(path, entry, urgent).await
                    }
                }
            }
            Decision::FetchWAN => self.fetch_wan(path, entry, urgent).await,
        }
    }

    /// Pulls the whole payload from one LAN peer that already has it cached
    /// (`FetchLAN`/`WaitPeer` success), verifies, and inserts.
    async fn fetch_from_single_peer(
        &self,
        path: &str,
        entry: &IndexEntry,
        peer: PeerId,
        urgent: bool,
    ) -> OrchestratorResult<FetchOutcome> {
        self.rate_limiter
            .acquire(Direction::Download, &peer, entry.size, urgent)
            .await;

        let started = Instant::now();
        let bytes = peer_transfer::fetch_range(
            self.overlay.as_ref(),
            &peer,
            entry.digest,
            0,
            entry.size,
            self.timeouts.get_for_size(Operation::PeerTransfer, entry.size),
        )
        .await
        .map_err(|e| OrchestratorError::MirrorFailure(format!("peer transfer failed: {e}")))?;

        let elapsed = started.elapsed();
        let throughput = bytes.len() as f64 / elapsed.as_secs_f64().max(0.001);

        let parsed = ParsedPackage {
            name: entry.name.clone(),
            version: entry.version.clone(),
            arch: entry.arch.clone(),
        };
        match self
            .cache
            .put(bytes.as_ref(), entry.digest, basename(path), parsed)
            .await
        {
            Ok(_) => {
                self.scorer.record_success(&peer, elapsed, throughput);
                self.overlay.provide(entry.digest).await.ok();
                self.serve_from_cache(entry.digest).await
            }
            Err(CacheError::DigestMismatch { expected, actual }) => {
                self.scorer.record_failure(&peer);
                warn!(%expected, %actual, %peer, "peer served mismatched payload");
                Err(OrchestratorError::AllSourcesMismatched(expected))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `FetchWAN -> DiscoverProviders -> ParallelChunkedDownload(d)`.
    async fn fetch_wan(&self, path: &str, entry: &IndexEntry, urgent: bool) -> OrchestratorResult<FetchOutcome> {
        let providers = self
            .overlay
            .find_providers(entry.digest, self.config.chunked.max_providers)
            .await
            .map_err(|e| OrchestratorError::MirrorFailure(format!("provider discovery failed: {e}")))?;

        if providers.is_empty() {
            self.fleet
                .fail(entry.digest, "no WAN providers available".to_string())
                .await;
            return Err(OrchestratorError::ProviderExhausted(entry.digest));
        }

        let temp_path = chunked::download(
            self.overlay.clone(),
            self.scorer.clone(),
            self.timeouts.clone(),
            self.rate_limiter.clone(),
            entry.digest,
            entry.size,
            providers,
            &self.config.staging_dir,
            &self.config.chunked,
            urgent,
        )
        .await
        .map_err(|e| OrchestratorError::MirrorFailure(e.to_string()))?;

        let file = tokio::fs::File::open(&temp_path).await.map_err(CacheError::Io)?;
        let parsed = ParsedPackage {
            name: entry.name.clone(),
            version: entry.version.clone(),
            arch: entry.arch.clone(),
        };
        let result = self.cache.put(file, entry.digest, basename(path), parsed).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match result {
            Ok(_) => {
                self.fleet.complete(entry.digest, entry.size).await;
                self.overlay.provide(entry.digest).await.ok();
                self.serve_from_cache(entry.digest).await
            }
            Err(CacheError::DigestMismatch { expected, actual }) => {
                self.fleet
                    .fail(entry.digest, format!("assembled payload hashed to {actual}"))
                    .await;
                Err(OrchestratorError::AllSourcesMismatched(expected))
            }
            Err(e) => {
                self.fleet.fail(entry.digest, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// `StreamFromMirror -> Verify -> CacheInsert -> Done`, used once the
    /// peer/WAN paths are exhausted for a digest the index did know about.
    /// The client is served the tee'd stream immediately; `Verify` and
    /// `CacheInsert` happen in a detached task so the client never waits on
    /// the cache commit — the mirror is the terminal source in the state
    /// diagram, so a mismatch here just means the bytes are not cached,
    /// not a retry.
    async fn stream_from_mirror_known(
        &self,
        path: &str,
        entry: &IndexEntry,
        urgent: bool,
    ) -> OrchestratorResult<FetchOutcome> {
        self.rate_limiter
            .acquire_global(Direction::Download, entry.size, urgent)
            .await;

        let url = format!("{}{}", self.config.mirror_base_url, path);
        let resp = self
            .mirror
            .fetch(&url, self.timeouts.get_for_size(Operation::MirrorFetch, entry.size))
            .await
            .map_err(|e| OrchestratorError::MirrorFailure(e.to_string()))?;

        let parsed = ParsedPackage {
            name: entry.name.clone(),
            version: entry.version.clone(),
            arch: entry.arch.clone(),
        };
        let body = tee::tee_to_cache(
            resp.body,
            self.cache.clone(),
            self.overlay.clone(),
            entry.digest,
            basename(path).to_string(),
            parsed,
        );
        Ok(FetchOutcome {
            digest: Some(entry.digest),
            size: resp.content_length.or(Some(entry.size)),
            body,
            source: FetchSource::Mirror,
        })
    }

    /// `StreamFromMirror -> CacheInsertOptional -> Done` for an index miss:
    /// there is no expected digest to verify against, so this is a plain
    /// pass-through proxy and the cache insert is skipped (see DESIGN.md).
    async fn stream_from_mirror_uncached(&self, path: &str) -> OrchestratorResult<FetchOutcome> {
        let url = format!("{}{}", self.config.mirror_base_url, path);
        let resp = self
            .mirror
            .fetch(&url, self.config.mirror_timeout)
            .await
            .map_err(|e| OrchestratorError::MirrorFailure(e.to_string()))?;

        Ok(FetchOutcome {
            digest: None,
            size: resp.content_length,
            body: resp.body,
            source: FetchSource::Mirror,
        })
    }
}
