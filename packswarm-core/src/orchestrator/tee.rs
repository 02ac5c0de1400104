//! The mirror-fallback "tee": pipelines mirror bytes to the client and to a
//! background cache writer at the same time, so the client never waits on
//! the cache commit.
//!
//! The pump task owns the source stream and fans each chunk out to two
//! bounded channels. The cache-writer channel has capacity 1, so the pump
//! tolerates the cache writer lagging by one chunk before it starts
//! applying the same backpressure to the source read that a slow client
//! would.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::warn;

use crate::cache::{ContentCache, ParsedPackage};
use crate::digest::Digest;
use crate::error::CacheError;
use crate::mirror::ByteStream;
use crate::overlay::Overlay;

const CLIENT_CHANNEL_CAPACITY: usize = 8;
const CACHE_CHANNEL_CAPACITY: usize = 1;

/// Wraps `body` so its bytes are streamed to the returned [`ByteStream`]
/// (for the HTTP client) while a detached task independently assembles the
/// same bytes into the cache under `expected_digest`. A digest mismatch on
/// the mirror's bytes only suppresses the cache insert — the client has
/// already received whatever the mirror sent, matching the state diagram's
/// `StreamFromMirror -> Verify -> CacheInsert` ordering where `Verify`
/// gates caching, not delivery (the mirror fallback is the terminal source;
/// there is nowhere left to retry once it has answered).
pub fn tee_to_cache(
    mut body: ByteStream,
    cache: Arc<ContentCache>,
    overlay: Arc<dyn Overlay>,
    expected_digest: Digest,
    filename: String,
    parsed: ParsedPackage,
) -> ByteStream {
    let (client_tx, client_rx) = mpsc::channel::<std::io::Result<Bytes>>(CLIENT_CHANNEL_CAPACITY);
    let (cache_tx, cache_rx) = mpsc::channel::<Bytes>(CACHE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let reader = StreamReader::new(ReceiverStream::new(cache_rx).map(Ok::<_, std::io::Error>));
        match cache.put(reader, expected_digest, &filename, parsed).await {
            Ok(_) => {
                if let Err(e) = overlay.provide(expected_digest).await {
                    warn!(%expected_digest, error = %e, "failed to announce tee-cached blob");
                }
            }
            Err(CacheError::DigestMismatch { expected, actual }) => {
                warn!(%expected, %actual, "mirror tee: assembled bytes did not match index digest, not caching");
            }
            Err(e) => {
                warn!(%expected_digest, error = %e, "mirror tee: cache insert failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut client_alive = true;
        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => {
                    if cache_tx.send(bytes.clone()).await.is_err() {
                        // Cache writer gave up (e.g. already cached, or
                        // failed); keep pumping to the client regardless.
                    }
                    if client_alive && client_tx.send(Ok(bytes)).await.is_err() {
                        client_alive = false;
                    }
                }
                Err(e) => {
                    if client_alive {
                        let _ = client_tx.send(Err(std::io::Error::new(e.kind(), e.to_string()))).await;
                    }
                    break;
                }
            }
        }
        // Dropping both senders here closes the cache reader (clean EOF)
        // and ends the client stream.
    });

    Box::pin(ReceiverStream::new(client_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest as Dg;
    use crate::overlay::mock_support::MockOverlay;
    use futures::stream;
    use std::time::Duration;

    #[tokio::test]
    async fn tee_streams_to_client_and_caches_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path(), 0, 0).await.unwrap());
        let mut overlay = MockOverlay::new();
        overlay.expect_provide().returning(|_| Ok(()));

        let payload = b"hello tee world".to_vec();
        let digest = Dg::of(&payload);
        let chunks: Vec<std::io::Result<Bytes>> = payload
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body: ByteStream = Box::pin(stream::iter(chunks));

        let mut out = tee_to_cache(
            body,
            cache.clone(),
            Arc::new(overlay),
            digest,
            "pkg.deb".to_string(),
            ParsedPackage::default(),
        );

        let mut collected = Vec::new();
        while let Some(chunk) = out.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, payload);

        // The cache writer task runs detached; give it a moment to finish.
        for _ in 0..50 {
            if cache.has(&digest).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.has(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn tee_skips_cache_insert_on_mismatch_but_still_streams_client() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path(), 0, 0).await.unwrap());
        let mut overlay = MockOverlay::new();
        overlay.expect_provide().returning(|_| Ok(()));

        let payload = b"wrong bytes entirely".to_vec();
        let wrong_digest = Dg::of(b"something else");
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(payload.clone()))]));

        let mut out = tee_to_cache(
            body,
            cache.clone(),
            Arc::new(overlay),
            wrong_digest,
            "pkg.deb".to_string(),
            ParsedPackage::default(),
        );

        let mut collected = Vec::new();
        while let Some(chunk) = out.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, payload);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.has(&wrong_digest).await.unwrap());
    }
}
