//! Ephemeral in-memory peer ranking.
//!
//! `Rank(peer)` combines success ratio, inverse latency, throughput, and
//! recency into a scalar in `[0, 1]`. The only public contract is `top_k`;
//! the weighting itself is free to tune.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const RECENCY_HALF_LIFE: Duration = Duration::from_secs(300);
const MAX_TRACKED_PEERS: usize = 4096;

#[derive(Debug, Clone)]
struct ScoreState {
    successes: u64,
    failures: u64,
    timeouts: u64,
    mean_latency: Duration,
    mean_throughput_bytes_per_sec: f64,
    last_seen: Instant,
}

impl ScoreState {
    fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            timeouts: 0,
            mean_latency: Duration::from_millis(200),
            mean_throughput_bytes_per_sec: 0.0,
            last_seen: Instant::now(),
        }
    }

    fn rank(&self) -> f64 {
        let total = (self.successes + self.failures + self.timeouts).max(1) as f64;
        let success_ratio = self.successes as f64 / total;

        let latency_score = 1.0 / (1.0 + self.mean_latency.as_secs_f64());

        let throughput_score =
            (self.mean_throughput_bytes_per_sec / 10_000_000.0).min(1.0);

        let age = self.last_seen.elapsed().as_secs_f64();
        let recency_score =
            0.5f64.powf(age / RECENCY_HALF_LIFE.as_secs_f64());

        (0.45 * success_ratio + 0.2 * latency_score + 0.2 * throughput_score
            + 0.15 * recency_score)
            .clamp(0.0, 1.0)
    }
}

fn ema(prev: f64, observed: f64, alpha: f64) -> f64 {
    alpha * observed + (1.0 - alpha) * prev
}

/// In-memory rolling score per peer. Cheap to construct; typically one per
/// daemon, shared behind an `Arc`.
pub struct PeerScorer {
    peers: DashMap<String, ScoreState>,
}

impl Default for PeerScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScorer {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    fn entry(&self, peer: &str) -> dashmap::mapref::one::RefMut<'_, String, ScoreState> {
        self.peers
            .entry(peer.to_string())
            .or_insert_with(ScoreState::new)
    }

    pub fn record_success(&self, peer: &str, latency: Duration, throughput_bytes_per_sec: f64) {
        let mut s = self.entry(peer);
        s.successes += 1;
        s.mean_latency = Duration::from_secs_f64(ema(
            s.mean_latency.as_secs_f64(),
            latency.as_secs_f64(),
            0.3,
        ));
        s.mean_throughput_bytes_per_sec =
            ema(s.mean_throughput_bytes_per_sec, throughput_bytes_per_sec, 0.3);
        s.last_seen = Instant::now();
    }

    pub fn record_failure(&self, peer: &str) {
        let mut s = self.entry(peer);
        s.failures += 1;
        s.last_seen = Instant::now();
    }

    pub fn record_timeout(&self, peer: &str) {
        let mut s = self.entry(peer);
        s.timeouts += 1;
        s.last_seen = Instant::now();
    }

    pub fn rank_of(&self, peer: &str) -> f64 {
        self.peers.get(peer).map(|s| s.rank()).unwrap_or(0.5)
    }

    /// Returns up to `k` of `candidates` ordered by descending rank.
    /// Candidates are typically the overlay's provider set for a digest;
    /// unknown peers rank at a neutral 0.5 so fresh providers aren't starved.
    pub fn top_k(&self, candidates: &[String], k: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|p| (p.clone(), self.rank_of(p)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored.into_iter().map(|(p, _)| p).collect()
    }

    pub fn disconnect(&self, peer: &str) {
        self.peers.remove(peer);
    }

    /// Bounds memory growth: drops the stalest entries once the table grows
    /// past `MAX_TRACKED_PEERS`.
    pub fn evict_lru_if_oversized(&self) {
        if self.peers.len() <= MAX_TRACKED_PEERS {
            return;
        }
        let mut entries: Vec<(String, Instant)> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen))
            .collect();
        entries.sort_by_key(|(_, last_seen)| *last_seen);
        let overflow = entries.len() - MAX_TRACKED_PEERS;
        for (peer, _) in entries.into_iter().take(overflow) {
            self.peers.remove(&peer);
        }
    }
}
