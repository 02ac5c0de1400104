use chrono::{DateTime, Utc};

use crate::digest::Digest;

/// Persistent row describing a blob held in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlob {
    pub digest: Digest,
    pub size: u64,
    pub filename: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub bytes_served: u64,
    pub pinned: bool,
    pub announced: bool,
    pub last_announce: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPackage {
    pub name: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub blob_count: u64,
    pub total_size: u64,
    pub pinned_count: u64,
    pub bytes_served: u64,
    pub max_size: u64,
}

impl CacheStats {
    /// Approximates egress avoided thanks to cache hits.
    pub fn bandwidth_saved(&self) -> u64 {
        self.bytes_served
    }
}

/// Result of `check_integrity()`: structural issues in the metadata store
/// itself, found without touching the filesystem.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub rows_checked: u64,
    pub duplicate_digests: Vec<Digest>,
    pub zero_sized_rows: Vec<Digest>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_digests.is_empty() && self.zero_sized_rows.is_empty()
    }
}

/// Result of `verify()`: a full re-hash walk of every row's payload file.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: u64,
    pub missing_files: Vec<Digest>,
    pub hash_mismatches: Vec<Digest>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty() && self.hash_mismatches.is_empty()
    }
}
