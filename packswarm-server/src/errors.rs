//! Maps [`OrchestratorError`] onto the HTTP status taxonomy the proxy
//! promises callers: one small wrapper type with a status code and a short
//! message, rather than matching on error variants at every call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use packswarm_core::error::{CacheError, OrchestratorError};

pub struct ProxyError {
    status: StatusCode,
    message: String,
}

impl ProxyError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Maps the failure taxonomy onto HTTP status: 404 for an unknown
/// index entry with a mirror miss, 502 for exhausted peer+mirror budget,
/// 504 for a timeout with no bytes delivered, everything else a generic
/// 502 since the orchestrator never returns a bare 500 for exhaustion paths.
impl From<OrchestratorError> for ProxyError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::UnknownPath(path) => {
                Self::new(StatusCode::NOT_FOUND, format!("no index entry for {path}"))
            }
            OrchestratorError::Cache(CacheError::NotFound(digest)) => {
                Self::new(StatusCode::NOT_FOUND, format!("blob not found for {digest}"))
            }
            OrchestratorError::Timeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "request timed out with no bytes delivered".to_string())
            }
            OrchestratorError::ProviderExhausted(digest) => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("no providers available for {digest} and mirror fallback failed"),
            ),
            OrchestratorError::MirrorFailure(msg) => {
                Self::new(StatusCode::BAD_GATEWAY, format!("mirror fetch failed: {msg}"))
            }
            OrchestratorError::AllSourcesMismatched(digest) => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("every source served a mismatched payload for {digest}"),
            ),
            OrchestratorError::Cancelled => {
                Self::new(StatusCode::BAD_GATEWAY, "request cancelled".to_string())
            }
            other => Self::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}
