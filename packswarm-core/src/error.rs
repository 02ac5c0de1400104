//! Error kinds for the core crate: one `thiserror` enum per concern,
//! `#[from]` for the handful of cases that wrap a foreign error type
//! cleanly.

use thiserror::Error;

use crate::digest::Digest;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("cache full: cannot free {needed} bytes (pinned rows cannot be evicted)")]
    CacheFull { needed: u64 },

    #[error("blob not found for digest {0}")]
    NotFound(Digest),

    #[error("structural corruption detected: {0}")]
    DiskCorruption(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("no response from any peer within claim timeout")]
    ClaimTimeout,

    #[error("fetch state for digest {0} went stale")]
    Stale(Digest),

    #[error("winning peer {0} reported failure: {1}")]
    WinnerFailed(String, String),

    #[error("overlay error: {0}")]
    Overlay(String),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("no index entry for path {0}")]
    UnknownPath(String),

    #[error("all providers exhausted for digest {0}")]
    ProviderExhausted(Digest),

    #[error("mirror fetch failed: {0}")]
    MirrorFailure(String),

    #[error("request timed out with no bytes delivered")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("digest mismatch on every source attempted for {0}")]
    AllSourcesMismatched(Digest),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
