//! Structured error types for schoolgrid-core.
//!
//! Library consumers get composable `thiserror` errors; the binary wraps them
//! with `anyhow` context.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A value failed validation
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Configuration file could not be read
    #[error("failed to read config {path:?}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    /// Configuration file is not valid TOML
    #[error("failed to parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Configuration is readable but unusable
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
