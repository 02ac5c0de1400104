//! HTTP client for the conventional mirror fallback path. A small trait
//! boundary mirrors [`crate::overlay::Overlay`]: production code talks to
//! `reqwest`, tests plug in a `mockall` double instead of a real mirror.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror returned status {0}")]
    Status(u16),
    #[error("mirror request failed: {0}")]
    Request(String),
}

/// A successful mirror response: a byte stream plus whatever `Content-Length`
/// the mirror advertised (absent on chunked-transfer-encoded responses).
pub struct MirrorResponse {
    pub body: ByteStream,
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait MirrorClient: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<MirrorResponse, MirrorError>;
}

/// Default production implementation, backed by `reqwest`.
pub struct ReqwestMirrorClient {
    client: reqwest::Client,
}

impl ReqwestMirrorClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(8)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for ReqwestMirrorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorClient for ReqwestMirrorClient {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<MirrorResponse, MirrorError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MirrorError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MirrorError::Status(resp.status().as_u16()));
        }

        let content_length = resp.content_length();
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));
        Ok(MirrorResponse {
            body: Box::pin(stream),
            content_length,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn mock_client_reports_status_error() {
        use mock_support::MockMirrorClient;

        let mut mock = MockMirrorClient::new();
        mock.expect_fetch()
            .returning(|_, _| Err(MirrorError::Status(404)));

        let err = mock.fetch("http://mirror/pkg", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Status(404)));
    }

    #[tokio::test]
    async fn mock_client_streams_body() {
        use mock_support::MockMirrorClient;

        let mut mock = MockMirrorClient::new();
        mock.expect_fetch().returning(|_, _| {
            let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
            Ok(MirrorResponse {
                body: Box::pin(stream::iter(chunks)),
                content_length: Some(11),
            })
        });

        let resp = mock.fetch("http://mirror/pkg", Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.content_length, Some(11));
        let collected: Vec<Bytes> = resp.body.map(|c| c.unwrap()).collect().await;
        let joined: Vec<u8> = collected.into_iter().flatten().collect();
        assert_eq!(joined, b"hello world");
    }
}
