//! Configuration loading for the packswarm proxy daemon: TOML file plus
//! `PACKSWARM_*` environment overrides, composed into a validated [`Config`].

pub mod error;
pub mod loader;
pub mod models;
pub mod units;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use models::Config;
