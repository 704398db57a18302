//! Configuration file support for the triage engine.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/clinic-triage/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub attention: AttentionConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Attend-next configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttentionConfig {
    /// Shortest consultation before the completion timer fires
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: u64,

    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Restrict attend-next to doctors of this specialty
    #[serde(default)]
    pub default_specialty: Option<String>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration_secs(),
            max_duration_secs: default_max_duration_secs(),
            default_specialty: None,
        }
    }
}

impl AttentionConfig {
    /// Completion-timer range as durations
    pub fn duration_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.min_duration_secs),
            Duration::from_secs(self.max_duration_secs),
        )
    }
}

/// Engine event channel configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|_| PathBuf::from("."))
    });
    base.join("clinic-triage")
}

fn default_min_duration_secs() -> u64 {
    30
}

fn default_max_duration_secs() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    64
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.attention.min_duration_secs > self.attention.max_duration_secs {
            return Err(Error::Config(format!(
                "attention.min_duration_secs ({}) exceeds attention.max_duration_secs ({})",
                self.attention.min_duration_secs, self.attention.max_duration_secs
            )));
        }
        if self.events.capacity == 0 {
            return Err(Error::Config("events.capacity must be positive".into()));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from("."))
        });
        base.join("clinic-triage").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.attention.min_duration_secs, 30);
        assert_eq!(config.attention.max_duration_secs, 60);
        assert_eq!(config.attention.default_specialty, None);
        assert_eq!(config.events.capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[attention]
max_duration_secs = 90
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.attention.max_duration_secs, 90);
        assert_eq!(config.attention.min_duration_secs, 30); // default
    }

    #[test]
    fn test_inverted_range_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[attention]\nmin_duration_secs = 10\nmax_duration_secs = 5\n",
        )
        .unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.attention.default_specialty = Some("Pediatrics".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.attention, config.attention);
    }
}
