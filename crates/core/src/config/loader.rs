//! Config path resolution
//!
//! Everything the runtime reads or writes lives under the host executable's
//! directory:
//!
//! ```text
//! <host dir>/Data/EarlyHook/
//!     earlyhook.toml
//!     offsets.json
//!     Logs/earlyhook.log
//!     Plugins/
//! ```

use std::path::{Path, PathBuf};

use super::{ConfigError, ConfigResult};

/// Full path of the host executable
pub fn runtime_path() -> ConfigResult<PathBuf> {
    std::env::current_exe().map_err(ConfigError::IoError)
}

/// File name of the host executable, e.g. `Game.exe`
pub fn runtime_name() -> ConfigResult<String> {
    runtime_path()?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Directory containing the host executable
pub fn runtime_directory() -> ConfigResult<PathBuf> {
    runtime_path()?
        .parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the EarlyHook base directory.
///
/// Path: `<host dir>/Data/EarlyHook/`
pub fn base_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir_for(&runtime_directory()?))
}

/// Base directory for a host living in `runtime_directory`
pub fn base_dir_for(runtime_directory: &Path) -> PathBuf {
    runtime_directory.join("Data").join("EarlyHook")
}

/// Path: `<host dir>/Data/EarlyHook/earlyhook.toml`
pub fn core_config_path() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("earlyhook.toml"))
}

/// Path: `<host dir>/Data/EarlyHook/Logs/`
pub fn logs_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("Logs"))
}

/// Path: `<host dir>/Data/EarlyHook/Logs/earlyhook.log`
pub fn log_file_path() -> ConfigResult<PathBuf> {
    Ok(logs_dir()?.join("earlyhook.log"))
}

/// Path: `<host dir>/Data/EarlyHook/offsets.json`
pub fn offsets_path() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("offsets.json"))
}

/// Path: `<host dir>/Data/EarlyHook/Plugins/`
pub fn plugins_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("Plugins"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_dir_layout() {
        let base = base_dir_for(Path::new("/games/host"));
        assert!(base.ends_with("Data/EarlyHook"));
        assert!(base.starts_with("/games/host"));
    }

    #[test]
    fn test_paths_share_base() {
        let base = base_dir().unwrap();
        assert_eq!(base, base_dir_for(&runtime_directory().unwrap()));
        assert_eq!(core_config_path().unwrap(), base.join("earlyhook.toml"));
        assert_eq!(offsets_path().unwrap(), base.join("offsets.json"));
        assert!(log_file_path().unwrap().starts_with(logs_dir().unwrap()));
        assert!(plugins_dir().unwrap().starts_with(&base));
    }

    #[test]
    fn test_runtime_name_is_file_name() {
        let name = runtime_name().unwrap();
        assert!(!name.is_empty());
        assert!(runtime_path().unwrap().ends_with(&name));
    }
}
