// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the spawner.

use std::path::PathBuf;

/// Default cap on captured worker output (8 KB)
pub const DEFAULT_MAX_OUTPUT: usize = 8 * 1024;

/// Default cap on each file read back from a work directory (1 MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Spawner configuration.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Directory in which work directories are created
    pub spawn_dir: PathBuf,
    /// How much of a worker's stderr is kept for error reports
    pub max_output: usize,
    /// Largest properties or error file that is read back
    pub max_file_size: u64,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            spawn_dir: std::env::temp_dir(),
            max_output: DEFAULT_MAX_OUTPUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SpawnerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `BERTH_SPAWN_DIR` (default: the system temp dir)
    /// - `BERTH_SPAWN_MAX_OUTPUT` in bytes (default: 8192)
    /// - `BERTH_SPAWN_MAX_FILE_SIZE` in bytes (default: 1048576)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let spawn_dir = std::env::var("BERTH_SPAWN_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.spawn_dir);

        let max_output = match std::env::var("BERTH_SPAWN_MAX_OUTPUT") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BERTH_SPAWN_MAX_OUTPUT", v))?,
            Err(_) => defaults.max_output,
        };

        let max_file_size = match std::env::var("BERTH_SPAWN_MAX_FILE_SIZE") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BERTH_SPAWN_MAX_FILE_SIZE", v))?,
            Err(_) => defaults.max_file_size,
        };

        Ok(Self {
            spawn_dir,
            max_output,
            max_file_size,
        })
    }

    pub fn with_spawn_dir(mut self, spawn_dir: impl Into<PathBuf>) -> Self {
        self.spawn_dir = spawn_dir.into();
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpawnerConfig::default();
        assert_eq!(config.max_output, 8192);
        assert_eq!(config.max_file_size, 1024 * 1024);
        assert_eq!(config.spawn_dir, std::env::temp_dir());
    }

    #[test]
    fn test_with_spawn_dir() {
        let config = SpawnerConfig::default().with_spawn_dir("/var/run/berth");
        assert_eq!(config.spawn_dir, PathBuf::from("/var/run/berth"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("BERTH_SPAWN_MAX_OUTPUT", "lots".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid value for BERTH_SPAWN_MAX_OUTPUT: \"lots\""
        );
    }
}
