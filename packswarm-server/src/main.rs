//! `packswarmd`: process entrypoint. Loads configuration, wires every core
//! subsystem into one [`Context`], spawns the periodic maintenance loops,
//! and serves the HTTP ingress (config load, tracing init, service
//! construction, `axum::serve`).

mod errors;
mod ingress;
mod overlay_null;
mod periodic;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use packswarm_config::ConfigLoader;
use packswarm_core::cache::ContentCache;
use packswarm_core::fleet::FleetCoordinator;
use packswarm_core::index::{spawn_watch, PackageIndex};
use packswarm_core::mirror::ReqwestMirrorClient;
use packswarm_core::orchestrator::chunked::ChunkedDownloadConfig;
use packswarm_core::orchestrator::{FetchOrchestrator, OrchestratorConfig};
use packswarm_core::overlay::Overlay;
use packswarm_core::rate_limiter::RateLimiter;
use packswarm_core::scheduler::WindowScheduler;
use packswarm_core::scorer::PeerScorer;
use packswarm_core::timeouts::TimeoutManager;
use packswarm_core::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overlay_null::NullOverlay;

/// Command line arguments for the packswarm proxy daemon.
#[derive(Parser, Debug)]
#[command(name = "packswarmd")]
#[command(about = "Local HTTP proxy that fetches OS packages from a P2P overlay before falling back to mirrors")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "PACKSWARM_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packswarm_server=info,packswarm_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config_path = args.config.clone();
    let config = ConfigLoader::new().load(config_path.as_deref())?;
    info!(
        proxy_port = config.network.proxy_port,
        cache_path = %config.cache.path.display(),
        "configuration loaded"
    );
    if !config.network.bind_address.is_loopback() {
        warn!(
            bind_address = %config.network.bind_address,
            "proxy is bound to a non-loopback interface; the daemon has no admin \
             authentication and trusts anything that can reach this port"
        );
    }

    let cancel = CancellationToken::new();

    let cache = Arc::new(
        ContentCache::open(config.cache.path.clone(), config.cache.max_size, config.cache.min_free_space).await?,
    );

    let index = Arc::new(PackageIndex::new());
    spawn_watch(index.clone(), config.index.watch_dir.clone(), cancel.clone());

    let overlay: Arc<dyn Overlay> = Arc::new(NullOverlay);

    // `fleet_inbound` is the sender half of the dispatch loop
    // `FleetCoordinator::new` already spawned; it is stored on `Context`
    // rather than dropped here so a production `Overlay`'s stream-accept
    // loop (replacing `NullOverlay`) can reach it without this function
    // threading it through every downstream constructor.
    let (fleet, fleet_inbound) = FleetCoordinator::new(overlay.clone(), cache.clone(), config.fleet.to_core());

    let scorer = Arc::new(PeerScorer::new());
    let timeouts = Arc::new(TimeoutManager::new(
        config.timeouts.adaptive_enabled,
        config.timeouts.bytes_per_second,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.transfer.max_upload_rate,
        config.transfer.max_download_rate,
        config.transfer.per_peer_upload_rate,
        config.transfer.per_peer_download_rate,
    ));
    let scheduler = Arc::new(WindowScheduler::new(config.scheduler.to_core()?));

    let mirror: Arc<dyn packswarm_core::mirror::MirrorClient> = Arc::new(ReqwestMirrorClient::new());

    let orchestrator_config = OrchestratorConfig {
        mirror_base_url: config.network.mirror_base_url.clone(),
        mirror_timeout: std::time::Duration::from_secs(15),
        fleet_wait_timeout: config.fleet.max_wait_time,
        staging_dir: config.cache.path.join("staging"),
        chunked: ChunkedDownloadConfig {
            chunk_size: config.transfer.chunk_size,
            max_workers: config.transfer.max_workers,
            retry_max_attempts: config.transfer.retry_max_attempts,
            retry_max_age: config.transfer.retry_max_age,
            ..ChunkedDownloadConfig::default()
        },
    };
    let orchestrator = Arc::new(FetchOrchestrator::new(
        cache.clone(),
        index.clone(),
        fleet.clone(),
        scorer.clone(),
        timeouts.clone(),
        overlay.clone(),
        mirror.clone(),
        rate_limiter.clone(),
        orchestrator_config,
    ));

    let ctx = Context::new(
        cache,
        index,
        fleet,
        fleet_inbound,
        scorer,
        timeouts,
        rate_limiter,
        scheduler,
        overlay,
        mirror,
        orchestrator,
        cancel.clone(),
    );

    ctx.apply_scheduler_rate(false);
    let periodic_handles = periodic::spawn_all(ctx.clone(), cancel.clone());

    let app = ingress::build_router(ctx.clone());
    let addr = std::net::SocketAddr::new(config.network.bind_address, config.network.proxy_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "packswarmd listening");

    let reload_handle = spawn_reload_listener(ctx.clone(), config_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;
    reload_handle.abort();

    cancel.cancel();
    for handle in periodic_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "periodic task panicked during shutdown");
        }
    }

    Ok(())
}

/// Reloads rate limits and re-runs the cache integrity check in place on
/// SIGHUP, without restarting the process (rate limits and integrity check
/// only; port changes require restart). Only unix has SIGHUP, so this is a no-op
/// future on other platforms.
fn spawn_reload_listener(ctx: packswarm_core::Context, config_path: Option<PathBuf>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGHUP handler, config reload disabled");
                    return;
                }
            };
            loop {
                sighup.recv().await;
                info!("SIGHUP received, reloading rate limits and re-checking cache integrity");
                match ConfigLoader::new().load(config_path.as_deref()) {
                    Ok(config) => {
                        let limiter = ctx.rate_limiter();
                        limiter.set_global_capacity(
                            packswarm_core::rate_limiter::Direction::Upload,
                            config.transfer.max_upload_rate,
                        );
                        limiter.set_global_capacity(
                            packswarm_core::rate_limiter::Direction::Download,
                            config.transfer.max_download_rate,
                        );
                        limiter.set_per_peer_capacity(
                            packswarm_core::rate_limiter::Direction::Upload,
                            config.transfer.per_peer_upload_rate,
                        );
                        limiter.set_per_peer_capacity(
                            packswarm_core::rate_limiter::Direction::Download,
                            config.transfer.per_peer_download_rate,
                        );
                        ctx.apply_scheduler_rate(false);
                    }
                    Err(e) => {
                        warn!(error = %e, "SIGHUP config reload failed, keeping previous configuration");
                    }
                }
                match ctx.cache().check_integrity().await {
                    Ok(report) => info!(?report, "post-reload integrity check complete"),
                    Err(e) => warn!(error = %e, "post-reload integrity check failed"),
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctx;
            let _ = config_path;
            std::future::pending::<()>().await;
        }
    })
}

/// Waits for SIGINT (Ctrl-C) or, on unix, SIGTERM, then trips the shared
/// cancellation token so `axum::serve` and every periodic loop unwind
/// together.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    cancel.cancel();
}
