//! Background maintenance loops driven next to the HTTP server: re-announce,
//! metrics refresh, and timeout decay, plus the upkeep the core crate's
//! docs defer to the server crate —
//! fleet stale-claim sweeping, rate limiter peer pruning, scorer eviction,
//! and pushing the window scheduler's current rate into the rate limiter.
//!
//! Each loop is its own `tokio::spawn`, one task per concern, rather than
//! a single loop multiplexing several `tokio::time::interval`s.

use std::time::Duration;

use packswarm_core::rate_limiter::Direction;
use packswarm_core::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const TIMEOUT_DECAY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const FLEET_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const PEER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const SCHEDULER_RATE_INTERVAL: Duration = Duration::from_secs(30);
const STALE_PEER_AGE: chrono::Duration = chrono::Duration::minutes(30);

/// Re-announces cached blobs the overlay hasn't heard about recently.
/// Under [`crate::overlay_null::NullOverlay`] this is a
/// no-op besides the bookkeeping, since `provide` never fails and there's
/// no real DHT to tell.
pub fn spawn_announce_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let cache = ctx.cache();
                    let overlay = ctx.overlay();
                    match cache.get_unannounced(chrono::Duration::from_std(ANNOUNCE_INTERVAL).unwrap_or(chrono::Duration::minutes(5))).await {
                        Ok(digests) => {
                            if digests.is_empty() {
                                continue;
                            }
                            debug!(count = digests.len(), "re-announcing cached blobs");
                            for digest in digests {
                                if let Err(e) = overlay.provide(digest).await {
                                    warn!(%digest, error = %e, "announce failed");
                                    continue;
                                }
                                if let Err(e) = cache.mark_announced(&digest).await {
                                    warn!(%digest, error = %e, "failed to record announcement");
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to list unannounced blobs"),
                    }
                }
            }
        }
        info!("announce loop stopped");
    })
}

/// Logs a cache/peer snapshot every 30s. A real deployment would export
/// these as `prometheus` gauges; the daemon restricts itself to structured
/// log lines here and leaves a metrics exporter to the control surface's
/// `/stats` endpoint, which callers can scrape instead.
pub fn spawn_metrics_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(METRICS_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match ctx.cache().stats().await {
                        Ok(stats) => info!(
                            count = stats.blob_count,
                            total_size = stats.total_size,
                            pinned_count = stats.pinned_count,
                            bandwidth_saved = stats.bandwidth_saved(),
                            "cache stats"
                        ),
                        Err(e) => warn!(error = %e, "failed to collect cache stats"),
                    }
                }
            }
        }
        info!("metrics loop stopped");
    })
}

/// Relaxes the adaptive timeout estimates back toward their base durations
/// so a transient burst of slow peers doesn't permanently inflate every
/// future deadline.
pub fn spawn_timeout_decay_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TIMEOUT_DECAY_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    ctx.timeouts().decay(0.1);
                    debug!("decayed adaptive timeout estimates");
                }
            }
        }
        info!("timeout decay loop stopped");
    })
}

/// Expires fleet claims nobody has reported progress on within the claim
/// window, so a crashed winning peer doesn't wedge every waiter forever.
pub fn spawn_fleet_sweep_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(FLEET_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    ctx.fleet().sweep_stale().await;
                }
            }
        }
        info!("fleet sweep loop stopped");
    })
}

/// Prunes idle per-peer rate-limiter buckets and trims the peer scorer's
/// tracked set, keeping both bounded as peers churn.
pub fn spawn_peer_maintenance_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PEER_MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let limiter = ctx.rate_limiter();
                    limiter.prune_peers(Direction::Upload, STALE_PEER_AGE);
                    limiter.prune_peers(Direction::Download, STALE_PEER_AGE);
                    ctx.scorer().evict_lru_if_oversized();
                }
            }
        }
        info!("peer maintenance loop stopped");
    })
}

/// Pushes the window scheduler's current rate into the global rate limiter
/// so a window boundary takes effect without restarting the daemon.
pub fn spawn_scheduler_loop(ctx: Context, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SCHEDULER_RATE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    ctx.apply_scheduler_rate(false);
                }
            }
        }
        info!("scheduler rate loop stopped");
    })
}

/// Spawns every periodic task and returns their join handles, for the
/// caller to await alongside the HTTP server during shutdown.
pub fn spawn_all(ctx: Context, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_announce_loop(ctx.clone(), cancel.clone()),
        spawn_metrics_loop(ctx.clone(), cancel.clone()),
        spawn_timeout_decay_loop(ctx.clone(), cancel.clone()),
        spawn_fleet_sweep_loop(ctx.clone(), cancel.clone()),
        spawn_peer_maintenance_loop(ctx.clone(), cancel.clone()),
        spawn_scheduler_loop(ctx, cancel),
    ]
}
