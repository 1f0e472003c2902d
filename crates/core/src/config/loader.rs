//! Config path resolution
//!
//! The config file lives next to the loaded module unless overridden through
//! the `HOOKWEAVE_CONFIG` environment variable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{ConfigError, ConfigResult};

/// Environment variable that overrides the config file location
pub const CONFIG_ENV: &str = "HOOKWEAVE_CONFIG";

/// File name of the orchestrator config
pub const CONFIG_FILE: &str = "hookweave.toml";

/// Returns the directory containing the loaded module.
///
/// When injected, the host executable and the module share a directory, so
/// the executable's parent is used.
pub fn hookweave_base_dir() -> ConfigResult<PathBuf> {
    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the configs directory.
///
/// Path: `<base>/configs/`
pub fn configs_dir() -> ConfigResult<PathBuf> {
    Ok(hookweave_base_dir()?.join("configs"))
}

/// Returns the orchestrator config path, honouring `HOOKWEAVE_CONFIG`.
pub fn config_path() -> ConfigResult<PathBuf> {
    let base = configs_dir();
    resolve_config_path(std::env::var_os(CONFIG_ENV), base.as_deref().ok())
}

/// Path resolution with the environment and base directory passed in
fn resolve_config_path(env: Option<OsString>, configs_dir: Option<&Path>) -> ConfigResult<PathBuf> {
    match env {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => configs_dir
            .map(|dir| dir.join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDirectory),
    }
}
