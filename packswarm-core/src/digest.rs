//! The sole content identifier used throughout the core: a hex-encoded
//! SHA-256 of payload bytes. Equality on bytes is the only trust relation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Length in ASCII-hex characters of a SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    #[error("digest must be exactly {DIGEST_HEX_LEN} hex characters, got {0}")]
    WrongLength(usize),
    #[error("digest contains non-hex characters: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A fixed-width hex-encoded SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First byte as a two-character hex shard prefix, e.g. `"a3"`.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hashes a complete in-memory payload.
    pub fn of(payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DigestParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_hex()
    }
}

/// Streaming hasher used by the cache's `put` path so the digest can be
/// computed incrementally while bytes are written to a temp file.
#[derive(Default)]
pub struct DigestHasher(Sha256);

impl DigestHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let d = Digest::of(b"hello world");
        let hex = d.to_hex();
        assert_eq!(hex.len(), DIGEST_HEX_LEN);
        let parsed: Digest = hex.parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            "abcd".parse::<Digest>(),
            Err(DigestParseError::WrongLength(4))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "z".repeat(DIGEST_HEX_LEN);
        assert!(matches!(
            bad.parse::<Digest>(),
            Err(DigestParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let d = Digest::of(b"x");
        assert_eq!(d.shard_prefix(), d.to_hex()[..2]);
    }

    #[test]
    fn streaming_hasher_matches_one_shot() {
        let mut hasher = DigestHasher::new();
        hasher.update(b"hel");
        hasher.update(b"lo world");
        assert_eq!(hasher.finalize(), Digest::of(b"hello world"));
    }
}
