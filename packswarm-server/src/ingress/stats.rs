//! `/_packswarm/stats` and `/_packswarm/reannounce`: the dashboard data
//! source and manual re-announce trigger. The
//! dashboard UI itself is out of scope; these just expose the snapshot a
//! UI (or `curl`) would consume.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use packswarm_core::Context;
use serde_json::json;
use tracing::warn;

pub async fn stats(State(ctx): State<Context>) -> impl IntoResponse {
    let cache_stats = match ctx.cache().stats().await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to collect cache stats for /stats");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let now = chrono::Utc::now();
    let scheduler = ctx.scheduler();
    let overlay = ctx.overlay();

    Json(json!({
        "cache": {
            "blob_count": cache_stats.blob_count,
            "total_size": cache_stats.total_size,
            "pinned_count": cache_stats.pinned_count,
            "bytes_served": cache_stats.bytes_served,
            "max_size": cache_stats.max_size,
            "bandwidth_saved": cache_stats.bandwidth_saved(),
        },
        "index": {
            "entry_count": ctx.index().len(),
        },
        "scheduler": {
            "in_window": scheduler.is_in_window(now),
            "current_rate": scheduler.current_rate(now, false),
            "next_open": scheduler.next_open(now).map(|t| t.to_rfc3339()),
        },
        "overlay": {
            "connected_peers": overlay.connected_peers().await.len(),
            "routing_table_size": overlay.routing_table_size().await,
        },
    }))
    .into_response()
}

/// Forces an immediate re-announce sweep rather than waiting for the
/// periodic loop's next tick.
pub async fn reannounce(State(ctx): State<Context>) -> impl IntoResponse {
    let cache = ctx.cache();
    let overlay = ctx.overlay();

    let digests = match cache.get_unannounced(chrono::Duration::zero()).await {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to list unannounced blobs for manual reannounce");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let mut announced = 0u64;
    let mut failed = 0u64;
    for digest in &digests {
        match overlay.provide(*digest).await {
            Ok(()) => {
                if cache.mark_announced(digest).await.is_ok() {
                    announced += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                warn!(%digest, error = %e, "manual reannounce failed");
                failed += 1;
            }
        }
    }

    Json(json!({ "announced": announced, "failed": failed })).into_response()
}
