//! LAN fleet coordination: deduplicates WAN fetches across co-located
//! peers via a nonce election over [`wire::FleetMessage`].
//!
//! Per-digest state is guarded by a single mutex: the
//! election phase and the post-election `FetchState` table share one
//! `Mutex<HashMap<..>>` so a peer message never observes a torn view.
//! Inbound wire messages are drained through a bounded channel (capacity
//! 100) by a dispatch loop [`FleetCoordinator::new`] spawns once at
//! construction time; it calls `handle_message` for every
//! `(peer, FleetMessage)` pair that arrives on the returned
//! `mpsc::Sender`. The server crate's overlay-stream accept loop is the
//! intended producer: it decodes bytes received on `FLEET_PROTOCOL_ID`
//! streams into `FleetMessage`s (see [`decode_inbound`]) and feeds them
//! into that sender, which `main` stores on the shared `Context` (see
//! `packswarm-core::context`) so a production `Overlay` implementation can
//! reach it without threading it through every constructor.
//!
//! A naive design ends up with a cyclic reference between the
//! coordinator and the overlay's protocol object (coordinator sends,
//! protocol dispatches inbound to the coordinator). Here `Overlay` already
//! exposes `send_message`/`broadcast` directly, so the coordinator just
//! holds an `Arc<dyn Overlay>` — construction is linear (build the
//! overlay, then the coordinator), and the inbound side is a plain
//! `mpsc::Sender` the caller feeds from its own stream-accept loop. See
//! DESIGN.md.
//!
//! A digest the coordinator already holds cached always answers
//! `WantPackage` with `HavePackage` unconditionally — ahead of, not
//! instead of, the in-progress-fetcher check — since an unrelated
//! in-flight WAN fetch must never hide a cache hit from an asking peer.

pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::ContentCache;
use crate::digest::Digest;
use crate::error::{FleetError, FleetResult};
use crate::overlay::{Overlay, PeerId, FLEET_PROTOCOL_ID};
use wire::FleetMessage;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub enabled: bool,
    pub claim_timeout: Duration,
    pub max_wait_time: Duration,
    pub allow_concurrent: bool,
    pub progress_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            claim_timeout: Duration::from_secs(5),
            max_wait_time: Duration::from_secs(5 * 60),
            allow_concurrent: false,
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Who is responsible for fetching a digest from the WAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetcher {
    SelfNode,
    Peer(PeerId),
}

impl std::fmt::Display for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fetcher::SelfNode => write!(f, "self"),
            Fetcher::Peer(p) => write!(f, "{p}"),
        }
    }
}

/// What `want_package` tells the orchestrator to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    FetchWAN,
    FetchLAN(PeerId),
    WaitPeer(Fetcher),
}

/// Terminal result delivered to a `want_package` caller that was told to
/// `WaitPeer`: either the winner finished and the waiter should now pull
/// the blob via the standard peer path, or it failed and the waiter should
/// consider attempting its own WAN fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetOutcome {
    Success,
    Failed(String),
}

/// The receiving half handed back alongside `Decision::WaitPeer`.
pub type WaitHandle = oneshot::Receiver<FleetOutcome>;

/// `want_package`'s full result: the decision, plus a wait handle when the
/// decision is `WaitPeer` (always `Some` in that case, `None` otherwise).
pub struct WantOutcome {
    pub decision: Decision,
    pub wait: Option<WaitHandle>,
}

struct FetchStateEntry {
    size: u64,
    fetcher: Fetcher,
    nonce: u32,
    offset: u64,
    started_at: Instant,
    last_update: Instant,
    waiters: Vec<oneshot::Sender<FleetOutcome>>,
}

impl FetchStateEntry {
    fn new(size: u64, fetcher: Fetcher, nonce: u32) -> Self {
        let now = Instant::now();
        Self {
            size,
            fetcher,
            nonce,
            offset: 0,
            started_at: now,
            last_update: now,
            waiters: Vec::new(),
        }
    }

    fn is_stale(&self, max_wait_time: Duration) -> bool {
        self.last_update.elapsed() > max_wait_time
    }
}

/// Events observed during the claim-timeout election window for a single
/// digest, fed from [`FleetCoordinator::run`] into the waiting
/// `want_package` call via an unbounded channel.
enum ElectionEvent {
    Have(PeerId),
    Fetching { peer: PeerId, nonce: u32 },
}

/// Which kind of response decided the election, distinguishing a peer that
/// already holds the blob cached (answer immediately, nothing to wait on)
/// from a peer that won the nonce race and is fetching from WAN (wait for
/// its completion broadcast).
enum ElectionWinner {
    Have(PeerId),
    Fetching(PeerId),
}

pub struct FleetCoordinator {
    overlay: Arc<dyn Overlay>,
    cache: Arc<ContentCache>,
    config: FleetConfig,
    table: Mutex<HashMap<Digest, FetchStateEntry>>,
    elections: Mutex<HashMap<Digest, mpsc::UnboundedSender<ElectionEvent>>>,
}

impl FleetCoordinator {
    /// Builds the coordinator and returns the sender end of its inbound
    /// message channel. Feed every decoded [`FleetMessage`] the overlay
    /// delivers (on `FLEET_PROTOCOL_ID` streams) into that sender; the
    /// server crate owns the accept loop that produces them.
    pub fn new(
        overlay: Arc<dyn Overlay>,
        cache: Arc<ContentCache>,
        config: FleetConfig,
    ) -> (Arc<Self>, mpsc::Sender<(PeerId, FleetMessage)>) {
        let (tx, rx) = mpsc::channel(100);
        let coordinator = Arc::new(Self {
            overlay,
            cache,
            config,
            table: Mutex::new(HashMap::new()),
            elections: Mutex::new(HashMap::new()),
        });
        let worker = coordinator.clone();
        tokio::spawn(async move { worker.run(rx).await });
        (coordinator, tx)
    }

    /// Drains inbound messages one at a time, serializing all mutation of
    /// the fetch-state and election tables.
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<(PeerId, FleetMessage)>) {
        while let Some((peer, msg)) = rx.recv().await {
            if let Err(e) = self.handle_message(peer, msg).await {
                warn!(error = %e, "fleet message handling failed");
            }
        }
        debug!("fleet coordinator message loop exiting");
    }

    async fn handle_message(&self, peer: PeerId, msg: FleetMessage) -> FleetResult<()> {
        match msg {
            FleetMessage::WantPackage { digest, size, .. } => {
                // A digest we already hold cached always answers
                // `HavePackage`, unconditionally, ahead of the
                // in-progress-fetcher check below: the requester needs to
                // know it can pull from us directly, even if we happen to
                // also be mid-election for some unrelated digest.
                match self.cache.has(&digest).await {
                    Ok(true) => {
                        self.unicast(&peer, FleetMessage::HavePackage { digest, size }).await;
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%digest, error = %e, "cache lookup failed while answering WantPackage"),
                }
                let our_nonce = {
                    let table = self.table.lock().await;
                    table
                        .get(&digest)
                        .filter(|e| e.fetcher == Fetcher::SelfNode)
                        .map(|e| e.nonce)
                };
                if let Some(nonce) = our_nonce {
                    self.unicast(&peer, FleetMessage::Fetching { digest, size: 0, nonce })
                        .await;
                }
            }
            FleetMessage::HavePackage { digest, .. } => {
                self.notify_election(&digest, ElectionEvent::Have(peer)).await;
            }
            FleetMessage::Fetching { digest, nonce, .. } => {
                self.notify_election(&digest, ElectionEvent::Fetching { peer, nonce }).await;
            }
            FleetMessage::FetchProgress { digest, offset, .. } => {
                let mut table = self.table.lock().await;
                if let Some(entry) = table.get_mut(&digest) {
                    entry.offset = offset as u64;
                    entry.last_update = Instant::now();
                }
            }
            FleetMessage::Fetched { digest, .. } => {
                self.release(&digest, FleetOutcome::Success).await;
            }
            FleetMessage::FetchFailed { digest, reason } => {
                self.release(&digest, FleetOutcome::Failed(reason)).await;
            }
        }
        Ok(())
    }

    async fn notify_election(&self, digest: &Digest, event: ElectionEvent) {
        let elections = self.elections.lock().await;
        if let Some(tx) = elections.get(digest) {
            let _ = tx.send(event);
        }
    }

    async fn unicast(&self, peer: &PeerId, msg: FleetMessage) {
        if let Err(e) = self
            .overlay
            .send_message(peer, FLEET_PROTOCOL_ID, msg.encode())
            .await
        {
            debug!(%peer, error = %e, "fleet unicast failed");
        }
    }

    async fn broadcast(&self, msg: FleetMessage) {
        if let Err(e) = self.overlay.broadcast(FLEET_PROTOCOL_ID, msg.encode()).await {
            debug!(error = %e, "fleet broadcast failed");
        }
    }

    /// The nonce election for a digest. Called by the orchestrator once
    /// it has an index-known digest that missed the cache. A `WaitPeer`
    /// decision always comes with a `wait` handle the caller should await
    /// (bounded by `max_wait_time` via [`Self::sweep_stale`]) before
    /// deciding whether to retry.
    pub async fn want_package(&self, digest: Digest, size: u64) -> FleetResult<WantOutcome> {
        if !self.config.enabled {
            return Ok(WantOutcome { decision: Decision::FetchWAN, wait: None });
        }

        {
            let mut table = self.table.lock().await;
            if let Some(entry) = table.get_mut(&digest) {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                let fetcher = entry.fetcher.clone();
                drop(table);
                return Ok(WantOutcome {
                    decision: Decision::WaitPeer(fetcher),
                    wait: Some(rx),
                });
            }
        }

        let peers = self.overlay.connected_peers().await;
        if peers.is_empty() {
            let nonce = random_nonce();
            self.install(digest, size, Fetcher::SelfNode, nonce).await;
            return Ok(WantOutcome { decision: Decision::FetchWAN, wait: None });
        }

        let nonce = random_nonce();
        let (election_tx, mut election_rx) = mpsc::unbounded_channel();
        self.elections.lock().await.insert(digest, election_tx);

        self.broadcast(FleetMessage::WantPackage { digest, size: size as i64, nonce })
            .await;

        let deadline = Instant::now() + self.config.claim_timeout;
        let mut winner: Option<ElectionWinner> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, election_rx.recv()).await {
                Ok(Some(ElectionEvent::Have(peer))) => {
                    winner = Some(ElectionWinner::Have(peer));
                    break;
                }
                Ok(Some(ElectionEvent::Fetching { peer, nonce: other })) => {
                    if other < nonce {
                        winner = Some(ElectionWinner::Fetching(peer));
                        break;
                    }
                    // Otherwise we are still winning the election; keep waiting.
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.elections.lock().await.remove(&digest);

        match winner {
            // A peer already holds the blob cached: no fetch is in
            // progress for us to wait on, so the caller downloads it
            // directly over the standard peer path. No `FetchStateEntry`
            // is installed — there is nothing to coalesce other callers
            // onto here, each just asks the same peer directly.
            Some(ElectionWinner::Have(peer)) => Ok(WantOutcome { decision: Decision::FetchLAN(peer), wait: None }),
            // A peer won the nonce election and is fetching from WAN on
            // our behalf: wait for its `Fetched`/`FetchFailed` broadcast.
            Some(ElectionWinner::Fetching(peer)) => {
                let fetcher = Fetcher::Peer(peer);
                let rx = self.install(digest, size, fetcher.clone(), nonce).await;
                Ok(WantOutcome { decision: Decision::WaitPeer(fetcher), wait: Some(rx) })
            }
            None => {
                self.install(digest, size, Fetcher::SelfNode, nonce).await;
                self.broadcast(FleetMessage::Fetching { digest, size: size as i64, nonce })
                    .await;
                Ok(WantOutcome { decision: Decision::FetchWAN, wait: None })
            }
        }
    }

    /// Installs a fresh `FetchStateEntry` and enrolls the caller as its
    /// first waiter (relevant only for `Fetcher::Peer`; the WAN winner
    /// itself never waits on its own entry).
    async fn install(&self, digest: Digest, size: u64, fetcher: Fetcher, nonce: u32) -> WaitHandle {
        let mut table = self.table.lock().await;
        let mut entry = FetchStateEntry::new(size, fetcher, nonce);
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        table.insert(digest, entry);
        rx
    }

    /// Called by the orchestrator while it holds the WAN-fetch role for
    /// `digest`, at `progress_interval`.
    pub async fn report_progress(&self, digest: Digest, offset: u64, size: u64) {
        {
            let mut table = self.table.lock().await;
            if let Some(entry) = table.get_mut(&digest) {
                entry.offset = offset;
                entry.last_update = Instant::now();
            }
        }
        self.broadcast(FleetMessage::FetchProgress {
            digest,
            offset: offset as i64,
            size: size as i64,
        })
        .await;
    }

    /// Called by the orchestrator on successful WAN completion.
    pub async fn complete(&self, digest: Digest, size: u64) {
        self.broadcast(FleetMessage::Fetched { digest, size: size as i64 }).await;
        self.release(&digest, FleetOutcome::Success).await;
    }

    /// Called by the orchestrator when the WAN fetch it owns fails.
    pub async fn fail(&self, digest: Digest, reason: impl Into<String>) {
        let reason = reason.into();
        self.broadcast(FleetMessage::FetchFailed { digest, reason: reason.clone() }).await;
        self.release(&digest, FleetOutcome::Failed(reason)).await;
    }

    async fn release(&self, digest: &Digest, outcome: FleetOutcome) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.remove(digest) {
            for waiter in entry.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Sweeps the fetch-state table for entries whose winner has gone
    /// silent past `max_wait_time`, releasing their waiters with an error
    /// so a subsequent `want_package` re-elects. Intended to be driven by
    /// a periodic task in the server crate.
    pub async fn sweep_stale(&self) {
        let stale: Vec<Digest> = {
            let table = self.table.lock().await;
            table
                .iter()
                .filter(|(_, entry)| entry.is_stale(self.config.max_wait_time))
                .map(|(d, _)| *d)
                .collect()
        };
        for digest in stale {
            warn!(%digest, "fleet fetch state went stale, releasing waiters");
            self.release(&digest, FleetOutcome::Failed("fetch state stale".into())).await;
        }
    }

}

fn random_nonce() -> u32 {
    rand::rng().random::<u32>()
}

/// Convenience used by the server crate's overlay-stream accept loop to
/// turn raw bytes into a routable `(peer, message)` pair.
pub fn decode_inbound(peer: PeerId, bytes: Bytes) -> FleetResult<(PeerId, FleetMessage)> {
    let msg = FleetMessage::decode(&bytes).map_err(|e| FleetError::Overlay(e.to_string()))?;
    Ok((peer, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ParsedPackage;
    use crate::overlay::mock_support::MockOverlay;

    fn overlay_with_peers(peers: Vec<PeerId>) -> MockOverlay {
        let mut mock = MockOverlay::new();
        mock.expect_connected_peers()
            .returning(move || peers.clone());
        mock.expect_broadcast().returning(|_, _| Ok(()));
        mock.expect_send_message().returning(|_, _, _| Ok(()));
        mock
    }

    /// A cache with nothing cached, backed by a scratch tempdir kept alive
    /// for the caller's scope.
    async fn empty_cache() -> (Arc<ContentCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().to_path_buf(), 0, 0).await.unwrap());
        (cache, dir)
    }

    #[tokio::test]
    async fn no_peers_returns_fetch_wan_immediately() {
        let overlay = overlay_with_peers(vec![]);
        let (cache, _dir) = empty_cache().await;
        let (coordinator, _tx) = FleetCoordinator::new(Arc::new(overlay), cache, FleetConfig::default());
        let digest = Digest::of(b"pkg");
        let outcome = coordinator.want_package(digest, 1024).await.unwrap();
        assert_eq!(outcome.decision, Decision::FetchWAN);
        assert!(outcome.wait.is_none());
    }

    #[tokio::test]
    async fn second_caller_for_same_digest_waits() {
        let overlay = overlay_with_peers(vec![]);
        let (cache, _dir) = empty_cache().await;
        let (coordinator, _tx) = FleetCoordinator::new(Arc::new(overlay), cache, FleetConfig::default());
        let digest = Digest::of(b"pkg");
        let first = coordinator.want_package(digest, 1024).await.unwrap();
        assert_eq!(first.decision, Decision::FetchWAN);

        let second = coordinator.want_package(digest, 1024).await.unwrap();
        assert_eq!(second.decision, Decision::WaitPeer(Fetcher::SelfNode));
        assert!(second.wait.is_some());
    }

    #[tokio::test]
    async fn complete_releases_waiters_with_success() {
        let overlay = overlay_with_peers(vec![]);
        let (cache, _dir) = empty_cache().await;
        let (coordinator, _tx) = FleetCoordinator::new(Arc::new(overlay), cache, FleetConfig::default());
        let digest = Digest::of(b"pkg");
        coordinator.want_package(digest, 1024).await.unwrap();

        let mut table = coordinator.table.lock().await;
        let entry = table.get_mut(&digest).unwrap();
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        drop(table);

        coordinator.complete(digest, 1024).await;
        assert!(matches!(rx.await, Ok(FleetOutcome::Success)));
    }

    #[tokio::test]
    async fn election_safety_lowest_nonce_wins() {
        // Three simulated nodes sharing one coordinator instance (the
        // election logic is per-process; this exercises the comparison
        // directly rather than three real processes).
        let overlay = overlay_with_peers(vec!["peer-b".into(), "peer-c".into()]);
        let (cache, _dir) = empty_cache().await;
        let (coordinator, _tx) = FleetCoordinator::new(Arc::new(overlay), cache, FleetConfig {
            claim_timeout: Duration::from_millis(50),
            ..FleetConfig::default()
        });
        let digest = Digest::of(b"pkg");

        let coordinator2 = coordinator.clone();
        let handle = tokio::spawn(async move {
            // Simulate peer-b announcing `Fetching{nonce=100}` shortly
            // after our own WantPackage broadcast.
            tokio::time::sleep(Duration::from_millis(5)).await;
            coordinator2
                .notify_election(
                    &digest,
                    ElectionEvent::Fetching { peer: "peer-b".into(), nonce: 100 },
                )
                .await;
        });

        let outcome = coordinator.want_package(digest, 2048).await.unwrap();
        handle.await.unwrap();
        assert_eq!(outcome.decision, Decision::WaitPeer(Fetcher::Peer("peer-b".into())));
    }

    #[tokio::test]
    async fn stale_fetch_state_releases_waiters_with_error() {
        let overlay = overlay_with_peers(vec![]);
        let (cache, _dir) = empty_cache().await;
        let (coordinator, _tx) = FleetCoordinator::new(
            Arc::new(overlay),
            cache,
            FleetConfig { max_wait_time: Duration::from_millis(10), ..FleetConfig::default() },
        );
        let digest = Digest::of(b"pkg");
        coordinator.want_package(digest, 1024).await.unwrap();
        let second = coordinator.want_package(digest, 1024).await.unwrap();
        assert_eq!(second.decision, Decision::WaitPeer(Fetcher::SelfNode));

        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.sweep_stale().await;
        assert!(coordinator.table.lock().await.get(&digest).is_none());
    }

    #[tokio::test]
    async fn want_package_for_cached_digest_replies_have_package_unconditionally() {
        use std::sync::Mutex as StdMutex;

        let digest = Digest::of(b"cached-pkg");
        let (cache, _dir) = empty_cache().await;
        cache
            .put(b"cached-pkg".as_slice(), digest, "cached-pkg.deb", ParsedPackage::default())
            .await
            .unwrap();

        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let mut mock = MockOverlay::new();
        mock.expect_connected_peers().returning(|| vec![]);
        mock.expect_broadcast().returning(|_, _| Ok(()));
        mock.expect_send_message().returning(move |peer, _protocol, bytes| {
            sent_clone.lock().unwrap().push((peer.clone(), bytes));
            Ok(())
        });

        let (coordinator, _tx) = FleetCoordinator::new(Arc::new(mock), cache, FleetConfig::default());

        // We happen to also be fetching some other digest from WAN; the
        // cached-digest reply must still take priority over the
        // in-progress-fetcher branch.
        let other_digest = Digest::of(b"unrelated");
        coordinator.want_package(other_digest, 4096).await.unwrap();

        coordinator
            .handle_message(
                "peer-a".to_string(),
                FleetMessage::WantPackage { digest, size: 11, nonce: 7 },
            )
            .await
            .unwrap();

        let replies = sent.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "peer-a");
        assert_eq!(
            FleetMessage::decode(&replies[0].1).unwrap(),
            FleetMessage::HavePackage { digest, size: 11 }
        );
    }
}
