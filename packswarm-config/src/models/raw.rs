//! Wire-shape of the TOML file: every value that has a unit suffix
//! is deserialized as a plain string and parsed by
//! [`crate::loader::ConfigLoader`], a two-stage "raw TOML struct then
//! typed `Config`" split.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub network: RawNetwork,
    pub cache: RawCache,
    pub transfer: RawTransfer,
    pub dht: RawDht,
    pub scheduler: RawScheduler,
    pub fleet: RawFleet,
    pub timeouts: RawTimeouts,
    pub index: RawIndex,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNetwork {
    pub proxy_port: Option<u16>,
    pub listen_port: Option<u16>,
    pub max_connections: Option<usize>,
    pub mirror_base_url: Option<String>,
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCache {
    pub path: Option<String>,
    pub max_size: Option<String>,
    pub min_free_space: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTransfer {
    pub max_upload_rate: Option<String>,
    pub max_download_rate: Option<String>,
    pub per_peer_upload_rate: Option<String>,
    pub per_peer_download_rate: Option<String>,
    pub max_concurrent_peer_downloads: Option<usize>,
    pub retry_max_attempts: Option<u32>,
    pub retry_interval: Option<String>,
    pub retry_max_age: Option<String>,
    pub chunk_size: Option<String>,
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDht {
    pub provider_ttl: Option<String>,
    pub announce_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawWindow {
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawScheduler {
    pub enabled: Option<bool>,
    pub windows: Vec<RawWindow>,
    pub timezone: Option<String>,
    pub outside_window_rate: Option<String>,
    pub inside_window_rate: Option<String>,
    pub urgent_full_speed: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFleet {
    pub enabled: Option<bool>,
    pub claim_timeout: Option<String>,
    pub max_wait_time: Option<String>,
    pub allow_concurrent: Option<bool>,
    pub refresh_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTimeouts {
    pub adaptive_enabled: Option<bool>,
    pub bytes_per_second: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawIndex {
    pub watch_dir: Option<String>,
}
