//! Engine configuration
//!
//! TOML-loadable configuration with defaults for every field. A missing
//! file yields the defaults; a malformed one is a typed error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::checkpoints::MAX_CHECKPOINTS_PER_DOC;
use crate::pool::DEFAULT_CONNECTION_SIZE;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the replicated metadata store.
    pub metadata_addr: String,
    /// Destination pool capacity used when callers pass 0.
    pub default_pool_size: usize,
    /// Checkpoint records kept per document.
    pub max_checkpoint_records: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_addr: "127.0.0.1:5003".to_string(),
            default_pool_size: DEFAULT_CONNECTION_SIZE,
            max_checkpoint_records: MAX_CHECKPOINTS_PER_DOC,
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                info!(path = %path.display(), "loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
