//! Shared daemon state. One [`Context`] is constructed at startup and cloned
//! into every request handler and periodic task; every field is an `Arc`, so
//! cloning is cheap.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::ContentCache;
use crate::fleet::wire::FleetMessage;
use crate::fleet::FleetCoordinator;
use crate::index::PackageIndex;
use crate::mirror::MirrorClient;
use crate::orchestrator::FetchOrchestrator;
use crate::overlay::{Overlay, PeerId};
use crate::rate_limiter::{Direction, RateLimiter};
use crate::scheduler::WindowScheduler;
use crate::scorer::PeerScorer;
use crate::timeouts::TimeoutManager;

#[derive(Clone)]
pub struct Context {
    cache: Arc<ContentCache>,
    index: Arc<PackageIndex>,
    fleet: Arc<FleetCoordinator>,
    fleet_inbound: mpsc::Sender<(PeerId, FleetMessage)>,
    scorer: Arc<PeerScorer>,
    timeouts: Arc<TimeoutManager>,
    rate_limiter: Arc<RateLimiter>,
    scheduler: Arc<WindowScheduler>,
    overlay: Arc<dyn Overlay>,
    mirror: Arc<dyn MirrorClient>,
    orchestrator: Arc<FetchOrchestrator>,
    cancel: CancellationToken,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ContentCache>,
        index: Arc<PackageIndex>,
        fleet: Arc<FleetCoordinator>,
        fleet_inbound: mpsc::Sender<(PeerId, FleetMessage)>,
        scorer: Arc<PeerScorer>,
        timeouts: Arc<TimeoutManager>,
        rate_limiter: Arc<RateLimiter>,
        scheduler: Arc<WindowScheduler>,
        overlay: Arc<dyn Overlay>,
        mirror: Arc<dyn MirrorClient>,
        orchestrator: Arc<FetchOrchestrator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
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
            cancel,
        }
    }

    pub fn cache(&self) -> Arc<ContentCache> {
        Arc::clone(&self.cache)
    }

    pub fn index(&self) -> Arc<PackageIndex> {
        Arc::clone(&self.index)
    }

    pub fn fleet(&self) -> Arc<FleetCoordinator> {
        Arc::clone(&self.fleet)
    }

    /// The fleet coordinator's inbound-message sender. A production
    /// `Overlay`'s own stream-accept loop decodes bytes received on
    /// `FLEET_PROTOCOL_ID` into `FleetMessage`s (see
    /// `packswarm_core::fleet::decode_inbound`) and feeds them in here;
    /// [`FleetCoordinator::new`] already spawned the dispatch loop that
    /// drains the matching receiver and calls `handle_message`.
    pub fn fleet_inbound(&self) -> mpsc::Sender<(PeerId, FleetMessage)> {
        self.fleet_inbound.clone()
    }

    pub fn scorer(&self) -> Arc<PeerScorer> {
        Arc::clone(&self.scorer)
    }

    pub fn timeouts(&self) -> Arc<TimeoutManager> {
        Arc::clone(&self.timeouts)
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    pub fn scheduler(&self) -> Arc<WindowScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn overlay(&self) -> Arc<dyn Overlay> {
        Arc::clone(&self.overlay)
    }

    pub fn mirror(&self) -> Arc<dyn MirrorClient> {
        Arc::clone(&self.mirror)
    }

    pub fn orchestrator(&self) -> Arc<FetchOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Shared shutdown signal, checked at every suspension point (fleet
    /// wait, chunk worker loop, mirror stream) and cloned into every
    /// periodic task so a single `cancel()` drains the daemon cleanly.
    pub fn cancel(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pushes the window scheduler's current rate into the rate limiter.
    /// Driven by a periodic task (default every 30s) so a
    /// window transition takes effect without restarting the daemon.
    pub fn apply_scheduler_rate(&self, urgent: bool) {
        let now = chrono::Utc::now();
        let rate = self.scheduler.current_rate(now, urgent);
        self.rate_limiter.set_global_capacity(Direction::Download, rate);
    }
}
