//! In-memory `path -> {digest, size, name?, version?, arch?}` map, kept
//! current by a filesystem watcher over the package manager's index cache
//! directory (e.g. apt's `/var/lib/apt/lists`).
//!
//! Watcher strategy: a debounced native watcher for local filesystems,
//! falling back to a periodic rescan when no event arrives within the
//! rescan interval (network filesystems don't reliably deliver inotify
//! events).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::digest::Digest;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub digest: Digest,
    pub size: u64,
    pub name: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
}

/// Index-relative path to entry, e.g. `pool/main/x/xyz_1.2_amd64.deb`.
#[derive(Default)]
pub struct PackageIndex {
    entries: DashMap<String, IndexEntry>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, path: &str) -> Option<IndexEntry> {
        self.entries.get(path).map(|e| e.clone())
    }

    /// Falls back to a suffix match so distribution-specific mirror prefixes
    /// (e.g. `/ubuntu/` vs `/debian/`) don't defeat a lookup.
    pub fn lookup_suffix(&self, path: &str) -> Option<(String, IndexEntry)> {
        if let Some(entry) = self.lookup(path) {
            return Some((path.to_string(), entry));
        }
        self.entries
            .iter()
            .find(|kv| path.ends_with(kv.key().as_str()))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
    }

    fn replace_all(&self, fresh: HashMap<String, IndexEntry>) {
        self.entries.retain(|k, _| fresh.contains_key(k));
        for (path, entry) in fresh {
            self.entries.insert(path, entry);
        }
    }

    /// Parses one index file in the Debian `Packages`-style stanza format:
    /// blank-line-separated stanzas of `Key: Value` lines, recognizing
    /// `Filename`, `SHA256`, `Size`, `Package`, `Version`, `Architecture`.
    fn parse_index_file(contents: &str) -> HashMap<String, IndexEntry> {
        let mut out = HashMap::new();
        let mut filename: Option<String> = None;
        let mut sha256: Option<String> = None;
        let mut size: Option<u64> = None;
        let mut name: Option<String> = None;
        let mut version: Option<String> = None;
        let mut arch: Option<String> = None;

        let flush = |out: &mut HashMap<String, IndexEntry>,
                     filename: &mut Option<String>,
                     sha256: &mut Option<String>,
                     size: &mut Option<u64>,
                     name: &mut Option<String>,
                     version: &mut Option<String>,
                     arch: &mut Option<String>| {
            if let (Some(path), Some(hash), Some(sz)) =
                (filename.take(), sha256.take(), size.take())
            {
                if let Ok(digest) = hash.parse::<Digest>() {
                    out.insert(
                        path,
                        IndexEntry {
                            digest,
                            size: sz,
                            name: name.take(),
                            version: version.take(),
                            arch: arch.take(),
                        },
                    );
                }
            }
            *name = None;
            *version = None;
            *arch = None;
        };

        for line in contents.lines() {
            if line.trim().is_empty() {
                flush(
                    &mut out, &mut filename, &mut sha256, &mut size, &mut name, &mut version,
                    &mut arch,
                );
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "Filename" => filename = Some(value),
                "SHA256" => sha256 = Some(value),
                "Size" => size = value.parse().ok(),
                "Package" => name = Some(value),
                "Version" => version = Some(value),
                "Architecture" => arch = Some(value),
                _ => {}
            }
        }
        flush(
            &mut out, &mut filename, &mut sha256, &mut size, &mut name, &mut version, &mut arch,
        );
        out
    }

    /// Rebuilds the whole index from every regular file under `dir`.
    pub async fn rebuild(&self, dir: &Path) -> std::io::Result<()> {
        let dir = dir.to_path_buf();
        let fresh = tokio::task::spawn_blocking(move || Self::scan_dir(&dir))
            .await
            .unwrap_or_default();
        info!(entries = fresh.len(), "package index rebuilt");
        self.replace_all(fresh);
        Ok(())
    }

    fn scan_dir(dir: &Path) -> HashMap<String, IndexEntry> {
        let mut merged = HashMap::new();
        let Ok(read_dir) = std::fs::read_dir(dir) else {
            warn!(path = %dir.display(), "index directory unreadable");
            return merged;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(contents) => merged.extend(Self::parse_index_file(&contents)),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read index file"),
            }
        }
        merged
    }
}

const RESCAN_FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the watch loop: a native `notify` watcher pushes debounced change
/// notifications, and a periodic rescan runs regardless in case the native
/// watcher misses events (common on network filesystems).
pub fn spawn_watch(
    index: Arc<PackageIndex>,
    dir: PathBuf,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = index.rebuild(&dir).await {
            error!(error = %e, "initial index build failed");
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watch_dir = dir.clone();
        let mut watcher: Option<RecommendedWatcher> =
            match RecommendedWatcher::new(
                move |res: Result<Event, notify::Error>| match res {
                    Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) => {
                        let _ = tx.send(());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "watcher error"),
                },
                notify::Config::default(),
            ) {
                Ok(mut w) => {
                    if let Err(e) = w.watch(&watch_dir, RecursiveMode::NonRecursive) {
                        warn!(error = %e, "failed to watch index directory, relying on rescan only");
                        None
                    } else {
                        Some(w)
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to construct filesystem watcher, relying on rescan only");
                    None
                }
            };

        let mut rescan = tokio::time::interval(RESCAN_FALLBACK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("index watcher shutting down");
                    break;
                }
                _ = rescan.tick() => {
                    if let Err(e) = index.rebuild(&dir).await {
                        error!(error = %e, "periodic index rescan failed");
                    }
                }
                Some(()) = rx.recv() => {
                    // Debounce a burst of filesystem events into one rebuild.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = index.rebuild(&dir).await {
                        error!(error = %e, "event-triggered index rescan failed");
                    }
                }
            }
        }
        drop(watcher.take());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_debian_style_stanza() {
        let contents = "Package: xyz\nVersion: 1.2\nArchitecture: amd64\nFilename: pool/main/x/xyz_1.2_amd64.deb\nSize: 4096\nSHA256: ".to_string()
            + &"a".repeat(64);
        let parsed = PackageIndex::parse_index_file(&contents);
        let entry = parsed.get("pool/main/x/xyz_1.2_amd64.deb").unwrap();
        assert_eq!(entry.size, 4096);
        assert_eq!(entry.name.as_deref(), Some("xyz"));
        assert_eq!(entry.version.as_deref(), Some("1.2"));
        assert_eq!(entry.arch.as_deref(), Some("amd64"));
    }

    #[test]
    fn skips_stanza_with_invalid_digest() {
        let contents = "Filename: a.deb\nSize: 10\nSHA256: not-hex\n".to_string();
        let parsed = PackageIndex::parse_index_file(&contents);
        assert!(parsed.is_empty());
    }

    #[test]
    fn lookup_suffix_matches_distro_prefix() {
        let index = PackageIndex::new();
        let mut fresh = HashMap::new();
        fresh.insert(
            "pool/main/x/xyz_1.2_amd64.deb".to_string(),
            IndexEntry {
                digest: Digest::of(b"anything"),
                size: 10,
                name: None,
                version: None,
                arch: None,
            },
        );
        index.replace_all(fresh);

        let full = "/ubuntu/pool/main/x/xyz_1.2_amd64.deb";
        let (matched_key, _entry) = index.lookup_suffix(full).unwrap();
        assert_eq!(matched_key, "pool/main/x/xyz_1.2_amd64.deb");
    }

    #[test]
    fn rebuild_replaces_stale_entries() {
        let index = PackageIndex::new();
        let mut first = HashMap::new();
        first.insert(
            "a.deb".to_string(),
            IndexEntry {
                digest: Digest::of(b"a"),
                size: 1,
                name: None,
                version: None,
                arch: None,
            },
        );
        index.replace_all(first);
        assert!(index.lookup("a.deb").is_some());

        let mut second = HashMap::new();
        second.insert(
            "b.deb".to_string(),
            IndexEntry {
                digest: Digest::of(b"b"),
                size: 1,
                name: None,
                version: None,
                arch: None,
            },
        );
        index.replace_all(second);
        assert!(index.lookup("a.deb").is_none());
        assert!(index.lookup("b.deb").is_some());
    }
}
