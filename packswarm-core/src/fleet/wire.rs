//! Normative binary wire format for fleet coordination messages. Bit-exact:
//! `[u8 type][u32-BE nonce][u16-BE hash_len <= 1024][hash_len bytes ascii-hex]
//! [i64-BE size][i64-BE offset]`. No framing header — one message per
//! opened stream, or concatenated on a persistent stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::digest::Digest;

pub const MAX_HASH_LEN: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message type byte {0}")]
    UnknownType(u8),
    #[error("hash length {0} exceeds maximum of {MAX_HASH_LEN}")]
    HashTooLong(usize),
    #[error("malformed digest: {0}")]
    MalformedDigest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetMessage {
    WantPackage { digest: Digest, size: i64, nonce: u32 },
    HavePackage { digest: Digest, size: i64 },
    Fetching { digest: Digest, size: i64, nonce: u32 },
    FetchProgress { digest: Digest, offset: i64, size: i64 },
    Fetched { digest: Digest, size: i64 },
    FetchFailed { digest: Digest, reason: String },
}

const TYPE_WANT_PACKAGE: u8 = 1;
const TYPE_HAVE_PACKAGE: u8 = 2;
const TYPE_FETCHING: u8 = 3;
const TYPE_FETCH_PROGRESS: u8 = 4;
const TYPE_FETCHED: u8 = 5;
const TYPE_FETCH_FAILED: u8 = 6;

impl FleetMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            FleetMessage::WantPackage { digest, size, nonce } => {
                buf.put_u8(TYPE_WANT_PACKAGE);
                buf.put_u32(*nonce);
                put_digest(&mut buf, digest);
                buf.put_i64(*size);
                buf.put_i64(0);
            }
            FleetMessage::HavePackage { digest, size } => {
                buf.put_u8(TYPE_HAVE_PACKAGE);
                buf.put_u32(0);
                put_digest(&mut buf, digest);
                buf.put_i64(*size);
                buf.put_i64(0);
            }
            FleetMessage::Fetching { digest, size, nonce } => {
                buf.put_u8(TYPE_FETCHING);
                buf.put_u32(*nonce);
                put_digest(&mut buf, digest);
                buf.put_i64(*size);
                buf.put_i64(0);
            }
            FleetMessage::FetchProgress { digest, offset, size } => {
                buf.put_u8(TYPE_FETCH_PROGRESS);
                buf.put_u32(0);
                put_digest(&mut buf, digest);
                buf.put_i64(*size);
                buf.put_i64(*offset);
            }
            FleetMessage::Fetched { digest, size } => {
                buf.put_u8(TYPE_FETCHED);
                buf.put_u32(0);
                put_digest(&mut buf, digest);
                buf.put_i64(*size);
                buf.put_i64(0);
            }
            FleetMessage::FetchFailed { digest, reason } => {
                // `reason` is smuggled as the ascii-hex payload is fixed at
                // a digest width, so failures instead encode the reason
                // length in `size` and carry the bytes after the header.
                buf.put_u8(TYPE_FETCH_FAILED);
                buf.put_u32(0);
                put_digest(&mut buf, digest);
                buf.put_i64(reason.len() as i64);
                buf.put_i64(0);
                buf.put_slice(reason.as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 1 + 4 + 2 {
            return Err(WireError::Truncated {
                need: 7,
                have: buf.len(),
            });
        }
        let msg_type = buf.get_u8();
        let nonce = buf.get_u32();
        let hash_len = buf.get_u16() as usize;
        if hash_len > MAX_HASH_LEN {
            return Err(WireError::HashTooLong(hash_len));
        }
        if buf.len() < hash_len + 8 + 8 {
            return Err(WireError::Truncated {
                need: hash_len + 16,
                have: buf.len(),
            });
        }
        let hash_bytes = buf.copy_to_bytes(hash_len);
        let hash_str = std::str::from_utf8(&hash_bytes)
            .map_err(|e| WireError::MalformedDigest(e.to_string()))?;
        let digest: Digest = hash_str
            .parse()
            .map_err(|e: crate::digest::DigestParseError| WireError::MalformedDigest(e.to_string()))?;
        let size = buf.get_i64();
        let offset = buf.get_i64();

        Ok(match msg_type {
            TYPE_WANT_PACKAGE => FleetMessage::WantPackage { digest, size, nonce },
            TYPE_HAVE_PACKAGE => FleetMessage::HavePackage { digest, size },
            TYPE_FETCHING => FleetMessage::Fetching { digest, size, nonce },
            TYPE_FETCH_PROGRESS => FleetMessage::FetchProgress { digest, offset, size },
            TYPE_FETCHED => FleetMessage::Fetched { digest, size },
            TYPE_FETCH_FAILED => {
                let reason_len = size as usize;
                if buf.remaining() < reason_len {
                    return Err(WireError::Truncated {
                        need: reason_len,
                        have: buf.remaining(),
                    });
                }
                let reason_bytes = buf.copy_to_bytes(reason_len);
                let reason = String::from_utf8_lossy(&reason_bytes).into_owned();
                FleetMessage::FetchFailed { digest, reason }
            }
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

fn put_digest(buf: &mut BytesMut, digest: &Digest) {
    let hex = digest.to_hex();
    buf.put_u16(hex.len() as u16);
    buf.put_slice(hex.as_bytes());
}
