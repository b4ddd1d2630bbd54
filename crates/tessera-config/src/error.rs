//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML config at {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),

    #[error("unknown conflict resolver '{0}'")]
    UnknownResolver(String),

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
