//! Configuration system for EarlyHook
//!
//! A single TOML file next to the host executable controls runtime-level
//! settings. It is created with defaults the first time the runtime starts.
//!
//! ```toml
//! version = 1
//! log_level = "info"
//! wait_for_debugger = false
//! branch_trampoline_size = 65536
//! local_trampoline_size = 65536
//! ```

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::trampoline::DEFAULT_REGION_SIZE;

pub use loader::{
    base_dir, base_dir_for, core_config_path, log_file_path, logs_dir, offsets_path, plugins_dir,
    runtime_directory, runtime_name, runtime_path,
};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine the directory of the host executable
    #[error("Config directory not available - could not resolve host executable path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Runtime configuration.
///
/// Loaded from `<host dir>/Data/EarlyHook/earlyhook.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Config version for future migration support
    pub version: u32,

    /// `tracing` filter directive, overridden by `EARLYHOOK_LOG`
    pub log_level: String,

    /// Block before phase 1 until a debugger attaches
    pub wait_for_debugger: bool,

    /// Capacity of the trampoline region near the host image
    pub branch_trampoline_size: usize,

    /// Capacity of the trampoline region near the runtime module
    pub local_trampoline_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: 1,
            log_level: "info".to_string(),
            wait_for_debugger: false,
            branch_trampoline_size: DEFAULT_REGION_SIZE,
            local_trampoline_size: DEFAULT_REGION_SIZE,
        }
    }
}

impl CoreConfig {
    /// Load core config from file, creating default if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&core_config_path()?)
    }

    /// Load from `path`, writing the defaults there if it does not exist
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded core config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default core config at {:?}", path);
            Ok(default)
        }
    }

    /// Save core config to file.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&core_config_path()?)
    }

    /// Save to `path`, creating parent directories if they don't exist.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved core config to {:?}", path);
        Ok(())
    }

    /// Reload core config from file.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = core_config_path()?;
        let content = std::fs::read_to_string(&path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded core config from {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "earlyhook-config-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_core_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.version, 1);
        assert_eq!(config.log_level, "info");
        assert!(!config.wait_for_debugger);
        assert_eq!(config.branch_trampoline_size, 64 * 1024);
        assert_eq!(config.local_trampoline_size, 64 * 1024);
    }

    #[test]
    fn test_core_config_serialize() {
        let config = CoreConfig {
            version: 2,
            wait_for_debugger: true,
            ..Default::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("version = 2"));
        assert!(toml_str.contains("wait_for_debugger = true"));

        let parsed: CoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let config: CoreConfig = toml::from_str("log_level = \"debug\"").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.version, 1);
        assert_eq!(config.branch_trampoline_size, DEFAULT_REGION_SIZE);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = scratch_dir("create");
        let path = dir.join("Data").join("EarlyHook").join("earlyhook.toml");

        let config = CoreConfig::load_from(&path).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert!(path.exists());

        // Second load reads the file back
        let mut edited = config.clone();
        edited.local_trampoline_size = 0x2000;
        edited.save_to(&path).unwrap();
        assert_eq!(CoreConfig::load_from(&path).unwrap(), edited);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = scratch_dir("invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("earlyhook.toml");
        std::fs::write(&path, "version = \"not a number\"").unwrap();

        assert!(matches!(
            CoreConfig::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
