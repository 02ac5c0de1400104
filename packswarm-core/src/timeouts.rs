//! Per-operation adaptive timeouts with EMA-based learning.
//!
//! One [`TimeoutManager`] is shared across the daemon; each operation class
//! tracks its own [`TimeoutEntry`] behind a single mutex (access windows are
//! short, no I/O happens under the lock, per the concurrency model).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const FLOOR: Duration = Duration::from_millis(50);
const CEILING: Duration = Duration::from_secs(60);
const EMA_ALPHA: f64 = 0.2;

/// The closed set of operations the daemon ever awaits a timeout on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DhtLookupShort,
    DhtLookupFull,
    PeerConnect,
    PeerFirstByte,
    PeerTransfer,
    MirrorFetch,
    ChunkDownload,
}

impl Operation {
    fn base(self) -> Duration {
        match self {
            Operation::DhtLookupShort => Duration::from_millis(500),
            Operation::DhtLookupFull => Duration::from_secs(5),
            Operation::PeerConnect => Duration::from_secs(2),
            Operation::PeerFirstByte => Duration::from_secs(3),
            Operation::PeerTransfer => Duration::from_secs(10),
            Operation::MirrorFetch => Duration::from_secs(15),
            Operation::ChunkDownload => Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
struct TimeoutEntry {
    base: Duration,
    current: Duration,
    ema_observed: Duration,
    successes: u64,
    failures: u64,
    timeouts: u64,
}

impl TimeoutEntry {
    fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            ema_observed: base,
            successes: 0,
            failures: 0,
            timeouts: 0,
        }
    }

    fn clamp(d: Duration) -> Duration {
        d.clamp(FLOOR, CEILING)
    }

    fn record_success(&mut self, observed: Duration) {
        self.successes += 1;
        self.ema_observed = ema(self.ema_observed, observed);
        if observed < self.current / 2 {
            let floor = self.base.max(self.ema_observed * 2);
            self.current = Self::clamp((self.current.mul_f64(0.9)).max(floor));
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.current = Self::clamp(self.current.mul_f64(1.5));
    }

    fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.current = Self::clamp(self.current.mul_f64(2.0));
    }

    fn decay(&mut self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        let delta = self.current.as_secs_f64() - self.base.as_secs_f64();
        let moved = self.base.as_secs_f64() + delta * (1.0 - factor);
        self.current = Self::clamp(Duration::from_secs_f64(moved.max(0.0)));
    }
}

fn ema(prev: Duration, observed: Duration) -> Duration {
    let next = EMA_ALPHA * observed.as_secs_f64() + (1.0 - EMA_ALPHA) * prev.as_secs_f64();
    Duration::from_secs_f64(next.max(0.0))
}

/// Estimated sustained throughput used by [`TimeoutManager::get_for_size`]
/// when no configured value is supplied.
const DEFAULT_THROUGHPUT_BYTES_PER_SEC: u64 = 1_000_000;

pub struct TimeoutManager {
    adaptive_enabled: bool,
    throughput_bytes_per_sec: u64,
    entries: Mutex<HashMap<Operation, TimeoutEntry>>,
}

impl TimeoutManager {
    pub fn new(adaptive_enabled: bool, throughput_bytes_per_sec: Option<u64>) -> Self {
        Self {
            adaptive_enabled,
            throughput_bytes_per_sec: throughput_bytes_per_sec
                .unwrap_or(DEFAULT_THROUGHPUT_BYTES_PER_SEC),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn with_entry<R>(&self, op: Operation, f: impl FnOnce(&mut TimeoutEntry) -> R) -> R {
        let mut table = self.entries.lock().expect("timeout table poisoned");
        let entry = table.entry(op).or_insert_with(|| TimeoutEntry::new(op.base()));
        f(entry)
    }

    pub fn get(&self, op: Operation) -> Duration {
        self.with_entry(op, |e| e.current)
    }

    /// Current timeout plus an allowance for `bytes` at the configured
    /// throughput estimate, with a 1.5x margin, clamped to [50ms, 60s].
    pub fn get_for_size(&self, op: Operation, bytes: u64) -> Duration {
        let base = self.get(op);
        let transfer = Duration::from_secs_f64(bytes as f64 / self.throughput_bytes_per_sec as f64);
        let total = (base + transfer).mul_f64(1.5);
        total.clamp(FLOOR, CEILING)
    }

    pub fn record_success(&self, op: Operation, observed: Duration) {
        if !self.adaptive_enabled {
            return;
        }
        self.with_entry(op, |e| e.record_success(observed));
    }

    pub fn record_failure(&self, op: Operation) {
        if !self.adaptive_enabled {
            return;
        }
        self.with_entry(op, |e| e.record_failure());
    }

    pub fn record_timeout(&self, op: Operation) {
        if !self.adaptive_enabled {
            return;
        }
        self.with_entry(op, |e| e.record_timeout());
    }

    /// Moves every operation's current timeout toward its base by `factor`.
    /// Invoked by the periodic timeout-decay task (default every 5 minutes).
    pub fn decay(&self, factor: f64) {
        let mut table = self.entries.lock().expect("timeout table poisoned");
        for entry in table.values_mut() {
            entry.decay(factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_hold_after_repeated_timeouts() {
        let mgr = TimeoutManager::new(true, None);
        for _ in 0..20 {
            mgr.record_timeout(Operation::PeerTransfer);
        }
        let t = mgr.get(Operation::PeerTransfer);
        assert!(t >= FLOOR && t <= CEILING);
        assert_eq!(t, CEILING);
    }

    #[test]
    fn timeout_strictly_increases_until_ceiling() {
        let mgr = TimeoutManager::new(true, None);
        let mut prev = mgr.get(Operation::MirrorFetch);
        loop {
            mgr.record_timeout(Operation::MirrorFetch);
            let next = mgr.get(Operation::MirrorFetch);
            if next == prev {
                break;
            }
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(prev, CEILING);
    }

    #[test]
    fn success_with_fast_observation_decreases_until_floor() {
        let mgr = TimeoutManager::new(true, None);
        for _ in 0..10 {
            mgr.record_timeout(Operation::PeerConnect);
        }
        let inflated = mgr.get(Operation::PeerConnect);
        assert_eq!(inflated, CEILING);

        let mut prev = inflated;
        for _ in 0..50 {
            mgr.record_success(Operation::PeerConnect, Duration::from_millis(1));
            let next = mgr.get(Operation::PeerConnect);
            assert!(next <= prev);
            prev = next;
        }
        assert!(prev >= FLOOR);
    }

    #[test]
    fn disabled_adaptation_never_moves_current() {
        let mgr = TimeoutManager::new(false, None);
        let base = mgr.get(Operation::ChunkDownload);
        mgr.record_timeout(Operation::ChunkDownload);
        mgr.record_failure(Operation::ChunkDownload);
        assert_eq!(mgr.get(Operation::ChunkDownload), base);
    }

    #[test]
    fn get_for_size_scales_with_bytes() {
        let mgr = TimeoutManager::new(true, Some(1_000_000));
        let small = mgr.get_for_size(Operation::ChunkDownload, 1_000);
        let large = mgr.get_for_size(Operation::ChunkDownload, 100_000_000);
        assert!(large > small);
        assert!(large <= CEILING);
    }

    #[test]
    fn decay_moves_toward_base() {
        let mgr = TimeoutManager::new(true, None);
        for _ in 0..5 {
            mgr.record_timeout(Operation::DhtLookupShort);
        }
        let inflated = mgr.get(Operation::DhtLookupShort);
        mgr.decay(0.1);
        let decayed = mgr.get(Operation::DhtLookupShort);
        assert!(decayed < inflated);
        assert!(decayed >= Operation::DhtLookupShort.base());
    }
}
