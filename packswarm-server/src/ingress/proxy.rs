//! The proxy GET handler. Request path is
//! the full mirror URL path; streams the orchestrator's body straight
//! through to the client (backpressure follows from the client's own read
//! rate).

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use packswarm_core::Context;

use crate::errors::ProxyError;

pub async fn get_package(State(ctx): State<Context>, uri: Uri) -> Result<Response, ProxyError> {
    let path = uri.path();
    let outcome = ctx.orchestrator().handle_request(path).await?;

    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(size) = outcome.size {
        response = response.header(header::CONTENT_LENGTH, size);
    }
    response = response.header(header::CONTENT_TYPE, "application/octet-stream");

    let body = Body::from_stream(outcome.body);
    Ok(response.body(body).map_err(|e| {
        ProxyError::from(packswarm_core::error::OrchestratorError::MirrorFailure(e.to_string()))
    })?)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
