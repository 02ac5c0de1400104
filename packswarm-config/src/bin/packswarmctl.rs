//! Configuration bootstrapper for the packswarm proxy daemon: a small `clap`
//! subcommand tree around the library's own [`ConfigLoader`], rather than a
//! second parallel implementation of config parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use packswarm_config::{ConfigError, ConfigLoader};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "packswarmctl", about = "packswarm configuration bootstrapper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a commented default configuration file.
    Init {
        #[arg(long, default_value = "packswarm.toml")]
        path: PathBuf,
        /// Overwrite an existing file instead of refusing.
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a configuration file (or defaults + env if omitted).
    Validate {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print the fully-resolved configuration as JSON.
    Show {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packswarmctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            std::fs::write(&path, DEFAULT_TEMPLATE)?;
            println!("wrote {}", path.display());
        }
        Command::Validate { path } => {
            match ConfigLoader::new().load(path.as_deref()) {
                Ok(config) => {
                    println!(
                        "ok: proxy_port={}, cache={}, fleet_enabled={}",
                        config.network.proxy_port,
                        config.cache.path.display(),
                        config.fleet.enabled
                    );
                }
                Err(e) => {
                    report_error(&e);
                    std::process::exit(1);
                }
            }
        }
        Command::Show { path } => {
            let config = ConfigLoader::new().load(path.as_deref())?;
            let summary = json!({
                "network": {
                    "proxy_port": config.network.proxy_port,
                    "listen_port": config.network.listen_port,
                    "max_connections": config.network.max_connections,
                    "mirror_base_url": config.network.mirror_base_url,
                    "bind_address": config.network.bind_address.to_string(),
                },
                "cache": {
                    "path": config.cache.path.display().to_string(),
                    "max_size": config.cache.max_size,
                    "min_free_space": config.cache.min_free_space,
                },
                "transfer": {
                    "max_upload_rate": config.transfer.max_upload_rate,
                    "max_download_rate": config.transfer.max_download_rate,
                    "per_peer_upload_rate": config.transfer.per_peer_upload_rate,
                    "per_peer_download_rate": config.transfer.per_peer_download_rate,
                    "max_concurrent_peer_downloads": config.transfer.max_concurrent_peer_downloads,
                    "chunk_size": config.transfer.chunk_size,
                    "max_workers": config.transfer.max_workers,
                },
                "dht": {
                    "provider_ttl_secs": config.dht.provider_ttl.as_secs(),
                    "announce_interval_secs": config.dht.announce_interval.as_secs(),
                },
                "scheduler": {
                    "enabled": config.scheduler.enabled,
                    "timezone": config.scheduler.timezone,
                    "window_count": config.scheduler.windows.len(),
                },
                "fleet": {
                    "enabled": config.fleet.enabled,
                    "allow_concurrent": config.fleet.allow_concurrent,
                },
                "timeouts": {
                    "adaptive_enabled": config.timeouts.adaptive_enabled,
                },
                "index": {
                    "watch_dir": config.index.watch_dir.display().to_string(),
                },
                "metadata": {
                    "config_path": config.metadata.config_path.as_ref().map(|p| p.display().to_string()),
                    "env_overrides_applied": config.metadata.env_overrides_applied,
                },
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn report_error(err: &ConfigError) {
    eprintln!("invalid configuration: {err}");
}

const DEFAULT_TEMPLATE: &str = r#"# packswarm configuration. Every key below is optional; anything omitted
# falls back to the daemon's built-in default, which can itself be
# overridden at runtime with a PACKSWARM_<SECTION>_<FIELD> environment
# variable (e.g. PACKSWARM_CACHE_MAX_SIZE).

[network]
proxy_port = 8080
listen_port = 9090
max_connections = 256
mirror_base_url = "http://archive.ubuntu.com"
# Loopback by default. Widening this to a LAN-reachable
# address is logged as a startup security warning since the daemon has no
# admin authentication of its own.
bind_address = "127.0.0.1"

[cache]
path = "/var/cache/packswarm"
max_size = "10GB"
min_free_space = "512MB"

[transfer]
max_upload_rate = "0"
max_download_rate = "0"
per_peer_upload_rate = "0"
per_peer_download_rate = "0"
max_concurrent_peer_downloads = 4
retry_max_attempts = 16
retry_interval = "2s"
retry_max_age = "2m"
chunk_size = "4MB"
max_workers = 4

[dht]
provider_ttl = "1h"
announce_interval = "5m"

[scheduler]
enabled = false
timezone = "UTC"
outside_window_rate = "0"
inside_window_rate = "0"
urgent_full_speed = true

# [[scheduler.windows]]
# days = ["weekday"]
# start = "09:00"
# end = "18:00"

[fleet]
enabled = true
claim_timeout = "5s"
max_wait_time = "5m"
allow_concurrent = false
refresh_interval = "1s"

[timeouts]
adaptive_enabled = true
# bytes_per_second = "1MB"

[index]
watch_dir = "/var/lib/apt/lists"
"#;
