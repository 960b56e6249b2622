//! Streamer Configuration
//!
//! Cache geometry, device limits and processing-loop timing. Every field has
//! a default, so a YAML file only needs to name the values it overrides.
//!
//! ```yaml
//! global_cache_capacity: 67108864
//! global_block_size: 262144
//! max_file_handles: 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default global cache capacity (64MB)
pub const DEFAULT_GLOBAL_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default global cache block size (256KB)
pub const DEFAULT_GLOBAL_BLOCK_SIZE: u64 = 256 * 1024;

/// Default dedicated cache capacity (4MB)
pub const DEFAULT_DEDICATED_CACHE_CAPACITY: u64 = 4 * 1024 * 1024;

/// Default dedicated cache block size (64KB)
pub const DEFAULT_DEDICATED_BLOCK_SIZE: u64 = 64 * 1024;

/// Default largest single device read (8MB)
pub const DEFAULT_MAX_READ_SIZE: u64 = 8 * 1024 * 1024;

/// Configuration for the streaming engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Global cache capacity in bytes
    pub global_cache_capacity: u64,
    /// Global cache block size in bytes
    pub global_block_size: u64,
    /// Capacity of each dedicated cache in bytes
    pub dedicated_cache_capacity: u64,
    /// Dedicated cache block size in bytes
    pub dedicated_block_size: u64,
    /// Maximum number of open file handles kept by the device layer
    pub max_file_handles: usize,
    /// Maximum number of file sizes remembered by the device layer
    pub max_metadata_entries: usize,
    /// Largest single read issued to the device; longer reads are split
    pub max_read_size: u64,
    /// How long the processing thread blocks waiting for work when idle
    #[serde(with = "duration_millis")]
    pub idle_wait: Duration,
    /// Name given to the processing thread
    pub thread_name: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            global_cache_capacity: DEFAULT_GLOBAL_CACHE_CAPACITY,
            global_block_size: DEFAULT_GLOBAL_BLOCK_SIZE,
            dedicated_cache_capacity: DEFAULT_DEDICATED_CACHE_CAPACITY,
            dedicated_block_size: DEFAULT_DEDICATED_BLOCK_SIZE,
            max_file_handles: 32,
            max_metadata_entries: 256,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            idle_wait: Duration::from_millis(10),
            thread_name: "couchestream".to_string(),
        }
    }
}

impl StreamerConfig {
    /// Load a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.global_block_size == 0 {
            return Err(Error::Config("global_block_size must be > 0".into()));
        }
        if self.dedicated_block_size == 0 {
            return Err(Error::Config("dedicated_block_size must be > 0".into()));
        }
        if self.global_cache_capacity < self.global_block_size {
            return Err(Error::Config(
                "global_cache_capacity must hold at least one block".into(),
            ));
        }
        if self.dedicated_cache_capacity < self.dedicated_block_size {
            return Err(Error::Config(
                "dedicated_cache_capacity must hold at least one block".into(),
            ));
        }
        if self.max_file_handles == 0 {
            return Err(Error::Config("max_file_handles must be > 0".into()));
        }
        if self.max_read_size == 0 {
            return Err(Error::Config("max_read_size must be > 0".into()));
        }
        if self.idle_wait.is_zero() {
            return Err(Error::Config("idle_wait must be > 0".into()));
        }
        Ok(())
    }

    /// Number of blocks the global cache holds.
    pub fn global_cache_blocks(&self) -> usize {
        (self.global_cache_capacity / self.global_block_size) as usize
    }

    /// Number of blocks each dedicated cache holds.
    pub fn dedicated_cache_blocks(&self) -> usize {
        (self.dedicated_cache_capacity / self.dedicated_block_size) as usize
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StreamerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_cache_blocks(), 256);
        assert_eq!(config.dedicated_cache_blocks(), 64);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config =
            StreamerConfig::from_yaml_str("global_block_size: 4096\nidle_wait: 5\n").unwrap();
        assert_eq!(config.global_block_size, 4096);
        assert_eq!(config.idle_wait, Duration::from_millis(5));
        assert_eq!(config.max_file_handles, 32);
    }

    #[test]
    fn test_invalid_block_size_rejected() {
        let err = StreamerConfig::from_yaml_str("global_block_size: 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_capacity_smaller_than_block_rejected() {
        let config = StreamerConfig {
            dedicated_cache_capacity: 10,
            dedicated_block_size: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_yaml_error() {
        let err = StreamerConfig::from_yaml_str("max_file_handles: [oops").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }
}
