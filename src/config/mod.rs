//! Configuration management for ClipStash
//!
//! This module handles loading, validating, and publishing the typed
//! settings consumed by the history store and the synchronizer.

pub mod handle;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use handle::SettingsHandle;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Typed settings consumed by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Record clipboard changes at all
    #[serde(default = "default_true")]
    pub track_changes: bool,

    /// Record primary selection changes into the history
    #[serde(default)]
    pub primary_to_history: bool,

    /// Mirror text between the clipboard and the primary selection
    #[serde(default)]
    pub synchronize_clipboards: bool,

    /// Persist histories to disk
    #[serde(default = "default_true")]
    pub save_history: bool,

    /// Strip leading and trailing whitespace from captured text
    #[serde(default)]
    pub trim_items: bool,

    /// Append new items at the end instead of the front
    #[serde(default)]
    pub fifo: bool,

    /// Record images
    #[serde(default = "default_true")]
    pub images_support: bool,

    /// Maximum number of items in a history
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Memory budget of a history, in megabytes
    #[serde(default = "default_max_memory_usage")]
    pub max_memory_usage: u64,

    /// Captured text shorter than this (in characters) is ignored
    #[serde(default = "default_min_text_item_size")]
    pub min_text_item_size: usize,

    /// Captured text longer than this (in characters) is ignored
    #[serde(default = "default_max_text_item_size")]
    pub max_text_item_size: usize,

    /// Number of items front-ends display
    #[serde(default = "default_max_displayed_history_size")]
    pub max_displayed_history_size: usize,

    /// Name of the active history
    #[serde(default = "default_history_name")]
    pub history_name: String,

    /// Root directory for histories and the image cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fetch rich formats alongside captured text
    #[serde(default)]
    pub rich_text_support: bool,

    /// Rich formats fetched when `rich-text-support` is on
    #[serde(default = "default_special_mimes")]
    pub special_mimes: Vec<String>,

    /// Write password items to disk
    #[serde(default)]
    pub save_passwords: bool,

    /// Delay before retrying a failed background save
    #[serde(default = "default_autosave_retry_secs")]
    pub autosave_retry_secs: u64,

    /// Polling period of the system clipboard backend
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_history_size() -> usize {
    100
}

fn default_max_memory_usage() -> u64 {
    15
}

fn default_min_text_item_size() -> usize {
    1
}

fn default_max_text_item_size() -> usize {
    u32::MAX as usize
}

fn default_max_displayed_history_size() -> usize {
    30
}

fn default_history_name() -> String {
    DEFAULT_HISTORY.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("clipstash"))
        .unwrap_or_else(|| PathBuf::from("~/.local/share/clipstash"))
}

fn default_special_mimes() -> Vec<String> {
    vec!["text/html".to_string()]
}

fn default_autosave_retry_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Name of the history used when none is configured
pub const DEFAULT_HISTORY: &str = "history";

impl Default for Settings {
    fn default() -> Self {
        Self {
            track_changes: true,
            primary_to_history: false,
            synchronize_clipboards: false,
            save_history: true,
            trim_items: false,
            fifo: false,
            images_support: true,
            max_history_size: default_max_history_size(),
            max_memory_usage: default_max_memory_usage(),
            min_text_item_size: default_min_text_item_size(),
            max_text_item_size: default_max_text_item_size(),
            max_displayed_history_size: default_max_displayed_history_size(),
            history_name: default_history_name(),
            data_dir: default_data_dir(),
            rich_text_support: false,
            special_mimes: default_special_mimes(),
            save_passwords: false,
            autosave_retry_secs: default_autosave_retry_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPSTASH_CONFIG environment variable
    /// 2. ~/.config/clipstash/config.toml
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut settings = Self::default();
                settings.expand_paths();
                Ok(settings)
            }
        }
    }

    /// Load settings with an optional explicit path
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(toml_str)?;
        settings.expand_paths();
        settings.validate()?;
        Ok(settings)
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CLIPSTASH_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        dirs::config_dir()
            .map(|p| p.join("clipstash").join("config.toml"))
            .filter(|p| p.exists())
    }

    fn expand_paths(&mut self) {
        self.data_dir = expand_path(&self.data_dir);
    }

    /// Validate setting values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history_size < 1 {
            return Err(ConfigError::Validation(
                "max-history-size must be at least 1".to_string(),
            ));
        }
        if self.max_memory_usage < 1 {
            return Err(ConfigError::Validation(
                "max-memory-usage must be at least 1 MB".to_string(),
            ));
        }
        if self.min_text_item_size > self.max_text_item_size {
            return Err(ConfigError::Validation(format!(
                "min-text-item-size ({}) exceeds max-text-item-size ({})",
                self.min_text_item_size, self.max_text_item_size
            )));
        }
        if self.poll_interval_ms < 50 {
            return Err(ConfigError::Validation(
                "poll-interval-ms must be at least 50".to_string(),
            ));
        }
        crate::history::storage::validate_name(&self.history_name)
            .map_err(|e| ConfigError::Validation(format!("history-name: {}", e)))?;
        Ok(())
    }

    /// Memory budget in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_usage.saturating_mul(1024 * 1024)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not find config directory",
                ))
            })?
            .join("clipstash");

        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write the commented example file to the default location
    pub fn generate_example_config(force: bool) -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not find config directory",
                ))
            })?
            .join("clipstash");

        std::fs::create_dir_all(&config_dir)?;
        let config_path = config_dir.join("config.toml");

        if !force && config_path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }

        std::fs::write(&config_path, Self::generate_example())?;
        Ok(config_path)
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let s = Settings::default();
        format!(
            r#"# ClipStash Configuration File
# Location: ~/.config/clipstash/config.toml

# Record clipboard changes
track-changes = {}
# Record the primary (middle-click) selection too
primary-to-history = {}
# Mirror text between clipboard and primary selection
synchronize-clipboards = {}
# Persist histories to disk; turning this off deletes saved histories on next save
save-history = {}
# Strip surrounding whitespace from captured text
trim-items = {}
# Append new items at the end of the history
fifo = {}
# Record images
images-support = {}

# Maximum number of items per history
max-history-size = {}
# Memory budget per history (MB)
max-memory-usage = {}
# Text length limits (characters)
min-text-item-size = {}
max-text-item-size = {}
# Number of items shown by front-ends
max-displayed-history-size = {}

# Active history
history-name = "{}"
# Where histories and the image cache live
data-dir = "{}"

# Rich formats fetched alongside text
rich-text-support = {}
special-mimes = [{}]
# Write password items to disk
save-passwords = {}

# Seconds before a failed background save is retried
autosave-retry-secs = {}
# System clipboard polling period
poll-interval-ms = {}

# Logging level (trace, debug, info, warn, error)
log-level = "{}"
"#,
            s.track_changes,
            s.primary_to_history,
            s.synchronize_clipboards,
            s.save_history,
            s.trim_items,
            s.fifo,
            s.images_support,
            s.max_history_size,
            s.max_memory_usage,
            s.min_text_item_size,
            s.max_text_item_size,
            s.max_displayed_history_size,
            s.history_name,
            s.data_dir.display(),
            s.rich_text_support,
            s.special_mimes
                .iter()
                .map(|m| format!("\"{}\"", m))
                .collect::<Vec<_>>()
                .join(", "),
            s.save_passwords,
            s.autosave_retry_secs,
            s.poll_interval_ms,
            s.log_level,
        )
    }
}

/// Expand tilde in path
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.track_changes);
        assert!(!settings.fifo);
        assert_eq!(settings.max_history_size, 100);
        assert_eq!(settings.max_memory_bytes(), 15 * 1024 * 1024);
        assert_eq!(settings.history_name, "history");
    }

    #[test]
    fn test_load_from_toml() {
        let toml_str = r#"
            fifo = true
            max-history-size = 10
            max-memory-usage = 2
            synchronize-clipboards = true
            data-dir = "/tmp/clipstash-test"
        "#;

        let settings = Settings::from_toml(toml_str).unwrap();
        assert!(settings.fifo);
        assert!(settings.synchronize_clipboards);
        assert_eq!(settings.max_history_size, 10);
        assert_eq!(settings.max_memory_bytes(), 2 * 1024 * 1024);
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/clipstash-test"));
        assert!(settings.track_changes);
    }

    #[test]
    fn test_validation_history_size() {
        assert!(Settings::from_toml("max-history-size = 0").is_err());
    }

    #[test]
    fn test_validation_text_bounds() {
        let toml_str = r#"
            min-text-item-size = 20
            max-text-item-size = 10
        "#;
        assert!(matches!(
            Settings::from_toml(toml_str),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_history_name() {
        assert!(Settings::from_toml(r#"history-name = "../escape""#).is_err());
        assert!(Settings::from_toml(r#"history-name = "images""#).is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let settings = Settings::from_toml(r#"data-dir = "~/stash""#).unwrap();
        assert!(!settings.data_dir.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_generate_example_parses() {
        let example = Settings::generate_example();
        assert!(example.contains("ClipStash Configuration"));
        let parsed = Settings::from_toml(&example).unwrap();
        assert_eq!(parsed.max_history_size, 100);
        assert_eq!(parsed.special_mimes, vec!["text/html".to_string()]);
    }

    #[test]
    fn test_save_to_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let settings = Settings {
            fifo: true,
            history_name: "work".to_string(),
            data_dir: dir.path().join("data"),
            ..Settings::default()
        };

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from_path(&path).unwrap();
        assert_eq!(loaded, settings);
    }
}
