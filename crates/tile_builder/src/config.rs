//! Configuration management for the tile builder.
//!
//! Settings are read from a TOML file; a default file is written on first run.

use anyhow::{Context, Result};
use network_tiles::{ConfigError, ConfigResult, TileSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::CliArgs;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Build and sparsify tuning
    #[serde(default)]
    pub tiles: TileSettings,
    /// Where tiles are written and served from
    #[serde(default)]
    pub output: OutputSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Root directory; each tile set goes in a subdirectory named after it
    #[serde(default = "default_output_directory")]
    pub directory: String,
    /// URL prefix under which the output directory is served
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_output_directory() -> String {
    "tiles".to_string()
}

fn default_base_url() -> String {
    "/tiles".to_string()
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            base_url: default_base_url(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write default config {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(dir) = &args.output_dir {
            self.output.directory = dir.to_string_lossy().into_owned();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if let Some(workers) = args.workers {
            self.tiles.build.worker_count = workers;
        }
        if args.all_cores {
            self.tiles.build.use_all_cores = true;
        }
        if args.seed.is_some() {
            self.tiles.sparsify.seed = args.seed;
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.directory)
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> ConfigResult<()> {
        self.tiles.validate()?;

        if self.output.directory.is_empty() {
            return Err(ConfigError::Invalid {
                field: "output.directory",
                reason: "cannot be empty".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid {
                field: "logging.level",
                reason: format!(
                    "'{}' is not one of {valid_levels:?}",
                    self.logging.level
                ),
            });
        }

        Ok(())
    }
}
