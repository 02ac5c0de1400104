use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    InvalidValue(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unrecognized weekday or alias: {0}")]
    BadWeekday(String),

    #[error("unrecognized IANA timezone: {0}")]
    BadTimezone(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
