//! Core subsystems for the packswarm proxy daemon: the content-addressed
//! cache, package index, fleet coordinator, adaptive timeouts, rate
//! limiter, window scheduler, peer scorer, and the fetch orchestrator that
//! ties them together. HTTP ingress and periodic task scheduling live in
//! `packswarm-server`; this crate has no axum dependency.

pub mod cache;
pub mod context;
pub mod digest;
pub mod error;
pub mod fleet;
pub mod index;
pub mod mirror;
pub mod orchestrator;
pub mod overlay;
pub mod rate_limiter;
pub mod scheduler;
pub mod scorer;
pub mod timeouts;

pub use cache::ContentCache;
pub use context::Context;
pub use digest::Digest;
pub use fleet::FleetCoordinator;
pub use index::PackageIndex;
pub use orchestrator::FetchOrchestrator;
pub use overlay::Overlay;
pub use rate_limiter::RateLimiter;
pub use scheduler::WindowScheduler;
pub use scorer::PeerScorer;
pub use timeouts::TimeoutManager;
