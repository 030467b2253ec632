use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Manages config directory and config file operations
#[derive(Clone)]
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager with a custom config directory (primarily for testing)
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Create a new ConfigManager for the given app name
    pub fn new(app_name: &str) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| eyre!("Could not determine config directory"))?
            .join(app_name);

        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self, path: &str) -> PathBuf {
        self.config_dir.join(path)
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub display: DisplayConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window cache budget, in cached rows across all plans.
    pub row_budget: usize,
    /// Initial read-ahead batch for filtered scans, in partitions.
    pub read_ahead_partitions: usize,
    /// Worker threads serving window requests. 0 means one per core.
    pub workers: usize,
    /// Transient read failures tolerated per partition before giving up.
    pub read_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub row_numbers: bool,
    pub event_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            display: DisplayConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_budget: 100_000,
            read_ahead_partitions: 1,
            workers: 0,
            read_retries: 3,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            row_numbers: false,
            event_poll_interval_ms: 25,
        }
    }
}

impl AppConfig {
    /// Load configuration from all layers (default → user file).
    pub fn load(app_name: &str) -> Result<Self> {
        let manager = ConfigManager::new(app_name)?;
        Self::load_with(&manager)
    }

    /// Load against an explicit config directory.
    pub fn load_with(manager: &ConfigManager) -> Result<Self> {
        let mut config = AppConfig::default();

        let config_path = manager.config_path("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|e| {
                eyre!(
                    "Failed to read config file at {}: {}",
                    config_path.display(),
                    e
                )
            })?;
            let user: AppConfig = toml::from_str(&content).map_err(|e| {
                eyre!(
                    "Failed to parse config file at {}: {}",
                    config_path.display(),
                    e
                )
            })?;
            config.merge(user);
        }

        config.validate()?;
        Ok(config)
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: AppConfig) {
        self.engine.merge(other.engine);
        self.display.merge(other.display);
        self.debug.merge(other.debug);
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.row_budget == 0 {
            return Err(eyre!("row_budget must be greater than 0"));
        }
        if self.engine.read_ahead_partitions == 0 {
            return Err(eyre!("read_ahead_partitions must be greater than 0"));
        }
        if self.display.event_poll_interval_ms == 0 {
            return Err(eyre!("event_poll_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}

impl EngineConfig {
    pub fn merge(&mut self, other: Self) {
        let default = EngineConfig::default();
        if other.row_budget != default.row_budget {
            self.row_budget = other.row_budget;
        }
        if other.read_ahead_partitions != default.read_ahead_partitions {
            self.read_ahead_partitions = other.read_ahead_partitions;
        }
        if other.workers != default.workers {
            self.workers = other.workers;
        }
        if other.read_retries != default.read_retries {
            self.read_retries = other.read_retries;
        }
    }
}

impl DisplayConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DisplayConfig::default();
        if other.row_numbers != default.row_numbers {
            self.row_numbers = other.row_numbers;
        }
        if other.event_poll_interval_ms != default.event_poll_interval_ms {
            self.event_poll_interval_ms = other.event_poll_interval_ms;
        }
    }
}

impl DebugConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DebugConfig::default();
        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.engine.row_budget, 100_000);
        assert_eq!(config.engine.read_ahead_partitions, 1);
        assert_eq!(config.engine.read_retries, 3);
        assert!(!config.display.row_numbers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf());
        let config = AppConfig::load_with(&manager).unwrap();
        assert_eq!(config.engine.row_budget, AppConfig::default().engine.row_budget);
    }

    #[test]
    fn user_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[engine]\nrow_budget = 500\n\n[display]\nrow_numbers = true\n",
        )
        .unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf());
        let config = AppConfig::load_with(&manager).unwrap();
        assert_eq!(config.engine.row_budget, 500);
        assert!(config.display.row_numbers);
        // Untouched sections keep their defaults.
        assert_eq!(config.engine.read_retries, 3);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[engine]\nrow_budget = 0\n").unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf());
        assert!(AppConfig::load_with(&manager).is_err());
    }
}
