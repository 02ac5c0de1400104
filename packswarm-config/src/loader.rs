//! Composes defaults, an optional TOML file, and `PACKSWARM_*` environment
//! variables into a validated [`Config`], with file-then-env precedence
//! (env always wins).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::models::raw::{RawConfig, RawWindow};
use crate::models::{
    CacheConfig, Config, ConfigMetadata, DhtConfig, FleetSettings, IndexConfig, NetworkConfig,
    SchedulerSettings, TimeoutSettings, TransferConfig, WindowSpec,
};
use crate::units::{parse_duration, parse_rate, parse_size};

const ENV_PREFIX: &str = "PACKSWARM_";

pub struct ConfigLoader {
    overrides_applied: Vec<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { overrides_applied: Vec::new() }
    }

    /// Loads `path` (if given) as TOML, falls back to built-in defaults for
    /// anything absent, then lets `PACKSWARM_<SECTION>_<FIELD>` environment
    /// variables override whatever the file or defaults supplied.
    pub fn load(mut self, path: Option<&Path>) -> ConfigResult<Config> {
        let mut raw = match path {
            Some(p) => self.read_file(p)?,
            None => RawConfig::default(),
        };

        self.apply_env(&mut raw);

        let config = self.finish(raw, path.map(Path::to_path_buf))?;
        info!(
            config_path = ?config.metadata.config_path,
            overrides = config.metadata.env_overrides_applied.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn read_file(&self, path: &Path) -> ConfigResult<RawConfig> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents)?;
        debug!(path = %path.display(), "parsed config file");
        Ok(raw)
    }

    fn env_str(&mut self, suffix: &str, slot: &mut Option<String>) {
        let name = format!("{ENV_PREFIX}{suffix}");
        if let Ok(value) = std::env::var(&name) {
            *slot = Some(value);
            self.overrides_applied.push(name);
        }
    }

    fn env_parsed<T: std::str::FromStr>(&mut self, suffix: &str, slot: &mut Option<T>) {
        let name = format!("{ENV_PREFIX}{suffix}");
        if let Ok(value) = std::env::var(&name) {
            if let Ok(parsed) = value.parse() {
                *slot = Some(parsed);
                self.overrides_applied.push(name);
            }
        }
    }

    fn apply_env(&mut self, raw: &mut RawConfig) {
        self.env_parsed("NETWORK_PROXY_PORT", &mut raw.network.proxy_port);
        self.env_parsed("NETWORK_LISTEN_PORT", &mut raw.network.listen_port);
        self.env_parsed("NETWORK_MAX_CONNECTIONS", &mut raw.network.max_connections);
        self.env_str("NETWORK_MIRROR_BASE_URL", &mut raw.network.mirror_base_url);
        self.env_str("NETWORK_BIND_ADDRESS", &mut raw.network.bind_address);

        self.env_str("CACHE_PATH", &mut raw.cache.path);
        self.env_str("CACHE_MAX_SIZE", &mut raw.cache.max_size);
        self.env_str("CACHE_MIN_FREE_SPACE", &mut raw.cache.min_free_space);

        self.env_str("TRANSFER_MAX_UPLOAD_RATE", &mut raw.transfer.max_upload_rate);
        self.env_str("TRANSFER_MAX_DOWNLOAD_RATE", &mut raw.transfer.max_download_rate);
        self.env_str("TRANSFER_PER_PEER_UPLOAD_RATE", &mut raw.transfer.per_peer_upload_rate);
        self.env_str(
            "TRANSFER_PER_PEER_DOWNLOAD_RATE",
            &mut raw.transfer.per_peer_download_rate,
        );
        self.env_parsed(
            "TRANSFER_MAX_CONCURRENT_PEER_DOWNLOADS",
            &mut raw.transfer.max_concurrent_peer_downloads,
        );
        self.env_parsed("TRANSFER_RETRY_MAX_ATTEMPTS", &mut raw.transfer.retry_max_attempts);
        self.env_str("TRANSFER_RETRY_INTERVAL", &mut raw.transfer.retry_interval);
        self.env_str("TRANSFER_RETRY_MAX_AGE", &mut raw.transfer.retry_max_age);
        self.env_str("TRANSFER_CHUNK_SIZE", &mut raw.transfer.chunk_size);
        self.env_parsed("TRANSFER_MAX_WORKERS", &mut raw.transfer.max_workers);

        self.env_str("DHT_PROVIDER_TTL", &mut raw.dht.provider_ttl);
        self.env_str("DHT_ANNOUNCE_INTERVAL", &mut raw.dht.announce_interval);

        self.env_parsed("SCHEDULER_ENABLED", &mut raw.scheduler.enabled);
        self.env_str("SCHEDULER_TIMEZONE", &mut raw.scheduler.timezone);
        self.env_str("SCHEDULER_OUTSIDE_WINDOW_RATE", &mut raw.scheduler.outside_window_rate);
        self.env_str("SCHEDULER_INSIDE_WINDOW_RATE", &mut raw.scheduler.inside_window_rate);
        self.env_parsed("SCHEDULER_URGENT_FULL_SPEED", &mut raw.scheduler.urgent_full_speed);

        self.env_parsed("FLEET_ENABLED", &mut raw.fleet.enabled);
        self.env_str("FLEET_CLAIM_TIMEOUT", &mut raw.fleet.claim_timeout);
        self.env_str("FLEET_MAX_WAIT_TIME", &mut raw.fleet.max_wait_time);
        self.env_parsed("FLEET_ALLOW_CONCURRENT", &mut raw.fleet.allow_concurrent);
        self.env_str("FLEET_REFRESH_INTERVAL", &mut raw.fleet.refresh_interval);

        self.env_parsed("TIMEOUTS_ADAPTIVE_ENABLED", &mut raw.timeouts.adaptive_enabled);
        self.env_str("TIMEOUTS_BYTES_PER_SECOND", &mut raw.timeouts.bytes_per_second);

        self.env_str("INDEX_WATCH_DIR", &mut raw.index.watch_dir);
    }

    fn finish(self, raw: RawConfig, config_path: Option<PathBuf>) -> ConfigResult<Config> {
        let network = NetworkConfig {
            proxy_port: raw.network.proxy_port.unwrap_or(8080),
            listen_port: raw.network.listen_port.unwrap_or(9090),
            max_connections: raw.network.max_connections.unwrap_or(256),
            mirror_base_url: raw
                .network
                .mirror_base_url
                .unwrap_or_else(|| "http://archive.ubuntu.com".to_string()),
            bind_address: raw
                .network
                .bind_address
                .map(|s| {
                    s.parse::<std::net::IpAddr>()
                        .map_err(|_| ConfigError::InvalidValue(format!("not an IP address: {s:?}")))
                })
                .transpose()?
                .unwrap_or_else(|| std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        };

        let cache = CacheConfig {
            path: raw
                .cache
                .path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/cache/packswarm")),
            max_size: size_or(raw.cache.max_size, 10 * 1024 * 1024 * 1024)?,
            min_free_space: size_or(raw.cache.min_free_space, 512 * 1024 * 1024)?,
        };

        let transfer = TransferConfig {
            max_upload_rate: rate_or(raw.transfer.max_upload_rate, 0)?,
            max_download_rate: rate_or(raw.transfer.max_download_rate, 0)?,
            per_peer_upload_rate: rate_or(raw.transfer.per_peer_upload_rate, 0)?,
            per_peer_download_rate: rate_or(raw.transfer.per_peer_download_rate, 0)?,
            max_concurrent_peer_downloads: raw.transfer.max_concurrent_peer_downloads.unwrap_or(4),
            retry_max_attempts: raw.transfer.retry_max_attempts.unwrap_or(16),
            retry_interval: duration_or(raw.transfer.retry_interval, Duration::from_secs(2))?,
            retry_max_age: duration_or(raw.transfer.retry_max_age, Duration::from_secs(120))?,
            chunk_size: size_or(raw.transfer.chunk_size, 4 * 1024 * 1024)?,
            max_workers: raw.transfer.max_workers.unwrap_or(4),
        };

        let dht = DhtConfig {
            provider_ttl: duration_or(raw.dht.provider_ttl, Duration::from_secs(3600))?,
            announce_interval: duration_or(raw.dht.announce_interval, Duration::from_secs(300))?,
        };

        let scheduler = SchedulerSettings {
            enabled: raw.scheduler.enabled.unwrap_or(false),
            windows: raw.scheduler.windows.into_iter().map(window_spec).collect(),
            timezone: raw.scheduler.timezone.unwrap_or_else(|| "UTC".to_string()),
            outside_window_rate: rate_or(raw.scheduler.outside_window_rate, 0)?,
            inside_window_rate: rate_or(raw.scheduler.inside_window_rate, 0)?,
            urgent_full_speed: raw.scheduler.urgent_full_speed.unwrap_or(true),
        };
        // Validated eagerly so a bad window/timezone fails at startup, not on
        // the first scheduler tick.
        scheduler.to_core()?;

        let fleet = FleetSettings {
            enabled: raw.fleet.enabled.unwrap_or(true),
            claim_timeout: duration_or(raw.fleet.claim_timeout, Duration::from_secs(5))?,
            max_wait_time: duration_or(raw.fleet.max_wait_time, Duration::from_secs(300))?,
            allow_concurrent: raw.fleet.allow_concurrent.unwrap_or(false),
            refresh_interval: duration_or(raw.fleet.refresh_interval, Duration::from_secs(1))?,
        };

        let timeouts = TimeoutSettings {
            adaptive_enabled: raw.timeouts.adaptive_enabled.unwrap_or(true),
            bytes_per_second: raw
                .timeouts
                .bytes_per_second
                .map(|s| parse_rate(&s))
                .transpose()?,
        };

        let index = IndexConfig {
            watch_dir: raw
                .index
                .watch_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/apt/lists")),
        };

        Ok(Config {
            network,
            cache,
            transfer,
            dht,
            scheduler,
            fleet,
            timeouts,
            index,
            metadata: ConfigMetadata {
                config_path,
                env_overrides_applied: self.overrides_applied,
            },
        })
    }
}

fn window_spec(raw: RawWindow) -> WindowSpec {
    WindowSpec { days: raw.days, start: raw.start, end: raw.end }
}

fn size_or(raw: Option<String>, default: u64) -> ConfigResult<u64> {
    raw.map(|s| parse_size(&s)).transpose().map(|v| v.unwrap_or(default))
}

fn rate_or(raw: Option<String>, default: u64) -> ConfigResult<u64> {
    raw.map(|s| parse_rate(&s)).transpose().map(|v| v.unwrap_or(default))
}

fn duration_or(raw: Option<String>, default: Duration) -> ConfigResult<Duration> {
    raw.map(|s| parse_duration(&s)).transpose().map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_with_no_file() {
        let config = ConfigLoader::new().load(None).unwrap();
        assert_eq!(config.network.proxy_port, 8080);
        assert_eq!(config.cache.max_size, 10 * 1024 * 1024 * 1024);
        assert!(config.fleet.enabled);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [network]
            proxy_port = 9000

            [cache]
            max_size = "20GB"

            [transfer]
            chunk_size = "8MB"
            "#
        )
        .unwrap();

        let config = ConfigLoader::new().load(Some(file.path())).unwrap();
        assert_eq!(config.network.proxy_port, 9000);
        assert_eq!(config.cache.max_size, 20 * 1024 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 8 * 1024 * 1024);
    }

    #[test]
    fn env_override_wins_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nproxy_port = 9000\n").unwrap();

        // SAFETY: test-only, no other thread in this test touches this var.
        unsafe {
            std::env::set_var("PACKSWARM_NETWORK_PROXY_PORT", "9999");
        }
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();
        unsafe {
            std::env::remove_var("PACKSWARM_NETWORK_PROXY_PORT");
        }
        assert_eq!(config.network.proxy_port, 9999);
        assert!(config
            .metadata
            .env_overrides_applied
            .contains(&"PACKSWARM_NETWORK_PROXY_PORT".to_string()));
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\ntimezone = \"Not/AZone\"\n").unwrap();
        let err = ConfigLoader::new().load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::BadTimezone(_)));
    }
}
