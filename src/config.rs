//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::constants::ENTRIES_PER_LINE;
use crate::utility::{is_power_of_two, next_power_of_two};

/// Environment variable naming a TOML config file to load.
pub const CONFIG_ENV_VAR: &str = "OXITABLE_CONFIG";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
}

/// Construction parameters for an [`ObjectIndex`](crate::ObjectIndex).
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Number of buckets in the primary array.
    ///
    /// A power of two lets bucket selection be a bitmask of the key; other
    /// values are accepted but fall back to modulo indexing.
    pub n_buckets: u64,

    /// Back the bucket array with large pages when the host provides them.
    ///
    /// If the large-page allocation fails the index falls back to a standard
    /// cache-line-aligned allocation and logs a warning.
    #[serde(default)]
    pub use_large_pages: bool,
}

impl IndexConfig {
    /// Create a configuration with the given bucket count.
    pub fn new(n_buckets: u64) -> Self {
        Self {
            n_buckets,
            use_large_pages: false,
        }
    }

    /// Size the bucket array for an expected object count.
    ///
    /// Picks the next power of two of `expected_objects / ENTRIES_PER_LINE`,
    /// so a uniformly loaded index ends up roughly one cache line per bucket.
    pub fn sized_for(expected_objects: u64) -> Self {
        let lines = expected_objects / ENTRIES_PER_LINE as u64;
        Self::new(next_power_of_two(lines.max(1)))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_buckets == 0 {
            return Err(ConfigError::InvalidValue {
                key: "n_buckets".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Whether bucket selection can use a bitmask instead of modulo.
    #[inline]
    pub fn masked_indexing(&self) -> bool {
        is_power_of_two(self.n_buckets)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the file named by `OXITABLE_CONFIG`, if set.
    pub fn load_from_env() -> Result<Option<Self>, ConfigError> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from_path(path).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            n_buckets: 1 << 20, // 1M buckets
            use_large_pages: false,
        }
    }
}
