//! Router assembly: the proxied mirror path plus the `/_packswarm/*` control
//! surface, built as one public `Router` builder with `TraceLayer` +
//! permissive CORS layered on top.

pub mod proxy;
mod stats;

use axum::routing::{get, post};
use axum::Router;
use packswarm_core::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(ctx: Context) -> Router {
    Router::new()
        .route("/_packswarm/healthz", get(proxy::health))
        .route("/_packswarm/stats", get(stats::stats))
        .route("/_packswarm/reannounce", post(stats::reannounce))
        .route("/{*path}", get(proxy::get_package))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
