pub mod raw;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use packswarm_core::fleet::FleetConfig;
use packswarm_core::scheduler::{SchedulerConfig, WeekdaySet, Window};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub dht: DhtConfig,
    pub scheduler: SchedulerSettings,
    pub fleet: FleetSettings,
    pub timeouts: TimeoutSettings,
    pub index: IndexConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub proxy_port: u16,
    pub listen_port: u16,
    pub max_connections: usize,
    /// Every deployment needs a base URL to rewrite proxy paths against
    /// when falling back to a mirror. Grouped under `network` rather than
    /// added as a new top-level table (see DESIGN.md).
    pub mirror_base_url: String,
    /// Defaults to loopback. An
    /// operator may widen this for a LAN-shared daemon; `main` logs a
    /// startup security warning whenever it isn't loopback.
    pub bind_address: IpAddr,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_size: u64,
    pub min_free_space: u64,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_upload_rate: u64,
    pub max_download_rate: u64,
    pub per_peer_upload_rate: u64,
    pub per_peer_download_rate: u64,
    pub max_concurrent_peer_downloads: usize,
    pub retry_max_attempts: u32,
    pub retry_interval: Duration,
    pub retry_max_age: Duration,
    pub chunk_size: u64,
    pub max_workers: usize,
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub provider_ttl: Duration,
    pub announce_interval: Duration,
}

/// The watched directory holding the package manager's index files. Given
/// its own top-level table rather than folded into `cache` since it has
/// nothing to do with the content-addressed store (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub watch_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
}

impl WindowSpec {
    fn to_core(&self) -> ConfigResult<Window> {
        let days = self
            .days
            .iter()
            .map(|d| WeekdaySet::parse(d).map_err(ConfigError::BadWeekday))
            .collect::<ConfigResult<Vec<_>>>()?;
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        Ok(Window { days, start, end })
    }
}

fn parse_hhmm(raw: &str) -> ConfigResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ConfigError::InvalidValue(format!("not a valid HH:MM time: {raw:?}")))
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub windows: Vec<WindowSpec>,
    pub timezone: String,
    pub outside_window_rate: u64,
    pub inside_window_rate: u64,
    pub urgent_full_speed: bool,
}

impl SchedulerSettings {
    pub fn to_core(&self) -> ConfigResult<SchedulerConfig> {
        let timezone: chrono_tz::Tz = self
            .timezone
            .parse()
            .map_err(|_| ConfigError::BadTimezone(self.timezone.clone()))?;
        let windows = self
            .windows
            .iter()
            .map(WindowSpec::to_core)
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(SchedulerConfig {
            enabled: self.enabled,
            windows,
            timezone,
            inside_window_rate: self.inside_window_rate,
            outside_window_rate: self.outside_window_rate,
            urgent_full_speed: self.urgent_full_speed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub enabled: bool,
    pub claim_timeout: Duration,
    pub max_wait_time: Duration,
    pub allow_concurrent: bool,
    pub refresh_interval: Duration,
}

impl FleetSettings {
    pub fn to_core(&self) -> FleetConfig {
        FleetConfig {
            enabled: self.enabled,
            claim_timeout: self.claim_timeout,
            max_wait_time: self.max_wait_time,
            allow_concurrent: self.allow_concurrent,
            progress_interval: self.refresh_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub adaptive_enabled: bool,
    pub bytes_per_second: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_overrides_applied: Vec<String>,
}
