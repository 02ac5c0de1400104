//! Token-bucket rate limiting: a global bucket plus a per-peer bucket per
//! direction. A transfer acquires from both and waits until both have
//! tokens. Capacity 0 means unlimited (the bucket is bypassed).
//!
//! The bucket math (tokens, `last_update`, generated-since-elapsed, clamp to
//! capacity) runs synchronously over a `Mutex<BucketState>` since this
//! daemon has no multi-node deployment target.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug)]
struct BucketState {
    /// bytes/sec; 0 means unlimited.
    rate: u64,
    capacity: u64,
    tokens: f64,
    last_update: Instant,
}

impl BucketState {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            capacity: rate.max(1),
            tokens: rate as f64,
            last_update: Instant::now(),
        }
    }

    fn unlimited(&self) -> bool {
        self.rate == 0
    }

    fn refill(&mut self) {
        if self.unlimited() {
            return;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
        self.last_update = now;
    }

    /// Attempts to take `amount` tokens. Returns `None` on success, or
    /// `Some(wait)` — how long the caller should sleep before retrying.
    fn try_take(&mut self, amount: u64) -> Option<Duration> {
        if self.unlimited() {
            return None;
        }
        self.refill();
        if self.tokens >= amount as f64 {
            self.tokens -= amount as f64;
            None
        } else {
            let deficit = amount as f64 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate as f64))
        }
    }

    fn set_rate(&mut self, rate: u64) {
        self.refill();
        self.rate = rate;
        self.capacity = rate.max(self.capacity).max(1);
    }
}

struct Buckets {
    global: BucketState,
    per_peer: HashMap<String, BucketState>,
    per_peer_rate: u64,
}

/// Lock-free on the read-mostly path is not attempted here; access windows
/// are short and contain no I/O.
pub struct RateLimiter {
    upload: Mutex<Buckets>,
    download: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(
        global_upload: u64,
        global_download: u64,
        per_peer_upload: u64,
        per_peer_download: u64,
    ) -> Self {
        Self {
            upload: Mutex::new(Buckets {
                global: BucketState::new(global_upload),
                per_peer: HashMap::new(),
                per_peer_rate: per_peer_upload,
            }),
            download: Mutex::new(Buckets {
                global: BucketState::new(global_download),
                per_peer: HashMap::new(),
                per_peer_rate: per_peer_download,
            }),
        }
    }

    fn buckets(&self, dir: Direction) -> &Mutex<Buckets> {
        match dir {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    /// The Window Scheduler writes a new global capacity on every window
    /// transition. `0` means unlimited.
    pub fn set_global_capacity(&self, dir: Direction, bytes_per_sec: u64) {
        let mut b = self.buckets(dir).lock().expect("rate limiter poisoned");
        b.global.set_rate(bytes_per_sec);
    }

    /// Reapplies the configured per-peer rate to every already-tracked peer
    /// bucket plus the rate new peers will be created with. Driven by a
    /// SIGHUP configuration reload (rate limits and the cache integrity
    /// check are reloadable without a restart).
    pub fn set_per_peer_capacity(&self, dir: Direction, bytes_per_sec: u64) {
        let mut b = self.buckets(dir).lock().expect("rate limiter poisoned");
        b.per_peer_rate = bytes_per_sec;
        for bucket in b.per_peer.values_mut() {
            bucket.set_rate(bytes_per_sec);
        }
    }

    /// Acquires `amount` bytes worth of tokens from both the global and
    /// per-peer buckets, blocking (via bounded sleeps) until both are
    /// satisfied. Urgent transfers bypass the global bucket entirely.
    pub async fn acquire(&self, dir: Direction, peer: &str, amount: u64, urgent: bool) {
        loop {
            let wait = {
                let mut b = self.buckets(dir).lock().expect("rate limiter poisoned");
                let peer_rate = b.per_peer_rate;
                let peer_bucket = b
                    .per_peer
                    .entry(peer.to_string())
                    .or_insert_with(|| BucketState::new(peer_rate));
                let peer_wait = peer_bucket.try_take(amount);

                let global_wait = if urgent {
                    None
                } else {
                    b.global.try_take(amount)
                };

                match (peer_wait, global_wait) {
                    (None, None) => None,
                    (Some(p), None) => Some(p),
                    (None, Some(g)) => Some(g),
                    (Some(p), Some(g)) => Some(p.max(g)),
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d.min(Duration::from_millis(250))).await,
            }
        }
    }

    /// Acquires `amount` bytes worth of tokens from the global bucket only,
    /// skipping the per-peer bucket. Used for sources that aren't a
    /// identifiable overlay peer (the conventional mirror fallback), which
    /// still count against the process-wide cap.
    pub async fn acquire_global(&self, dir: Direction, amount: u64, urgent: bool) {
        if urgent {
            return;
        }
        loop {
            let wait = {
                let mut b = self.buckets(dir).lock().expect("rate limiter poisoned");
                b.global.try_take(amount)
            };
            match wait {
                None => return,
                Some(d) => sleep(d.min(Duration::from_millis(250))).await,
            }
        }
    }

    /// Evicts per-peer bucket state for peers that have not transferred
    /// recently, bounding memory growth on long-running daemons.
    pub fn prune_peers(&self, dir: Direction, older_than: Duration) {
        let mut b = self.buckets(dir).lock().expect("rate limiter poisoned");
        let now = Instant::now();
        b.per_peer
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < older_than);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let rl = RateLimiter::new(0, 0, 0, 0);
        rl.acquire(Direction::Download, "peer-a", 10_000_000_000, false)
            .await;
    }

    #[tokio::test]
    async fn per_peer_bucket_is_independent_of_global() {
        let rl = RateLimiter::new(1_000_000, 0, 500_000, 0);
        rl.acquire(Direction::Download, "peer-a", 400_000, false).await;
        rl.acquire(Direction::Download, "peer-b", 400_000, false).await;
    }

    #[tokio::test]
    async fn urgent_bypasses_global_bucket() {
        let rl = RateLimiter::new(1, 0, 0, 0);
        let start = Instant::now();
        rl.acquire(Direction::Download, "peer-a", 10_000, true).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn set_global_capacity_changes_rate() {
        let rl = RateLimiter::new(1_000, 0, 0, 0);
        rl.set_global_capacity(Direction::Upload, 0);
        let b = rl.upload.lock().unwrap();
        assert!(b.global.unlimited());
    }
}
