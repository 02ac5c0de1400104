//! Wire sub-protocol for pulling a byte range of a payload from a single
//! peer stream. The fleet coordination protocol is defined separately;
//! the actual chunk-payload transport is left to this implementation.
//! Framing:
//!
//! Request:  `[u16-BE hash_len][hash bytes ascii-hex][u64-BE offset][u64-BE length]`
//! Response: `[u8 status][u64-BE body_len][body_len bytes]`, `status = 0` ok,
//! `status = 1` error (`body` is a UTF-8 message instead of payload bytes).

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::digest::Digest;
use crate::overlay::{Overlay, OverlayError, PeerId};

pub const PEER_TRANSFER_PROTOCOL_ID: &str = "/packswarm/transfer/1.0.0";

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// Caps a single response body so a misbehaving peer can't force unbounded
/// buffering; callers never request chunks larger than the configured
/// `chunk_size` in practice.
const MAX_RESPONSE_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PeerTransferError {
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("peer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer reported error: {0}")]
    PeerReported(String),

    #[error("response body {0} bytes exceeds maximum {MAX_RESPONSE_LEN}")]
    ResponseTooLarge(u64),

    #[error("request timed out")]
    Timeout,
}

fn encode_request(digest: Digest, offset: u64, length: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + 64 + 16);
    let hex = digest.to_hex();
    buf.put_u16(hex.len() as u16);
    buf.put_slice(hex.as_bytes());
    buf.put_u64(offset);
    buf.put_u64(length);
    buf
}

/// Opens a fresh stream to `peer`, requests `[offset, offset+length)` of
/// `digest`'s payload, and returns the response bytes. Bounded by `timeout`.
pub async fn fetch_range(
    overlay: &dyn Overlay,
    peer: &PeerId,
    digest: Digest,
    offset: u64,
    length: u64,
    timeout: Duration,
) -> Result<bytes::Bytes, PeerTransferError> {
    let fut = async {
        let mut stream = overlay.open_stream(peer, PEER_TRANSFER_PROTOCOL_ID).await?;
        let request = encode_request(digest, offset, length);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let status = stream.read_u8().await?;
        let body_len = stream.read_u64().await?;
        if status == STATUS_ERR {
            let mut msg = vec![0u8; body_len as usize];
            stream.read_exact(&mut msg).await?;
            return Err(PeerTransferError::PeerReported(
                String::from_utf8_lossy(&msg).into_owned(),
            ));
        }
        if status != STATUS_OK {
            return Err(PeerTransferError::PeerReported(format!(
                "unrecognized status byte {status}"
            )));
        }
        if body_len > MAX_RESPONSE_LEN {
            return Err(PeerTransferError::ResponseTooLarge(body_len));
        }
        let mut body = vec![0u8; body_len as usize];
        stream.read_exact(&mut body).await?;
        Ok(bytes::Bytes::from(body))
    };

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PeerTransferError::Timeout),
    }
}

/// Decodes an inbound request, for use by the server crate's peer-transfer
/// listen loop (the serving side is this daemon's cache, not exercised here).
pub fn decode_request(mut buf: &[u8]) -> Option<(Digest, u64, u64)> {
    if buf.len() < 2 {
        return None;
    }
    let hash_len = buf.get_u16() as usize;
    if buf.len() < hash_len + 16 {
        return None;
    }
    let hash_bytes = buf.copy_to_bytes(hash_len);
    let digest: Digest = std::str::from_utf8(&hash_bytes).ok()?.parse().ok()?;
    let offset = buf.get_u64();
    let length = buf.get_u64();
    Some((digest, offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_decode() {
        let digest = Digest::of(b"chunk");
        let encoded = encode_request(digest, 4096, 1024);
        let (d, offset, length) = decode_request(&encoded).unwrap();
        assert_eq!(d, digest);
        assert_eq!(offset, 4096);
        assert_eq!(length, 1024);
    }
}
