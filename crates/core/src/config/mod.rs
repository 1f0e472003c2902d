//! Orchestrator configuration
//!
//! This module provides the TOML-backed configuration layer:
//! - Type-safe config struct via serde
//! - Auto-generation of a default config file
//! - Manual reload
//! - Compiled exclusion patterns
//!
//! # Example
//!
//! ```ignore
//! use hookweave_core::{Orchestrator, OrchestratorConfig, SlotPort};
//!
//! let config = OrchestratorConfig::load().unwrap_or_default();
//! let orchestrator = Orchestrator::new(Arc::new(SlotPort::new()), config)?;
//! ```

mod exclusion;
mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hooks::SameTargetPolicy;

pub use exclusion::ExclusionSet;
pub use loader::{config_path, configs_dir, hookweave_base_dir, CONFIG_ENV, CONFIG_FILE};

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

    /// An exclusion pattern did not compile
    #[error("Invalid exclusion pattern: {0}")]
    Pattern(#[source] regex::Error),

    /// A value is out of range
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Could not determine config directory from module location
    #[error("Config directory not available - could not resolve module base path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Orchestrator configuration.
///
/// Loaded from `configs/hookweave.toml` next to the module, or from the path
/// in `HOOKWEAVE_CONFIG`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// How hooks on an identical target are reconciled
    pub same_target_policy: SameTargetPolicy,

    /// Maximum number of registered hooks
    pub max_hook_count: usize,

    /// Maximum number of hooks chained on one target
    pub max_chain_length: usize,

    /// Advisory per-callback timeout in milliseconds, 0 disables
    pub hook_timeout_ms: u64,

    /// Time every callback execution
    pub performance_monitoring: bool,

    /// Maximum retained error history entries
    pub max_error_history: usize,

    /// Module name globs that may never be hooked
    pub excluded_modules: Vec<String>,

    /// Function name globs that may never be hooked
    pub excluded_functions: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            same_target_policy: SameTargetPolicy::Chain,
            max_hook_count: 1000,
            max_chain_length: 16,
            hook_timeout_ms: 5000,
            performance_monitoring: true,
            max_error_history: 100,
            excluded_modules: Vec::new(),
            excluded_functions: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load config from the resolved path, creating a default if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from `path`, creating a default if missing.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            tracing::debug!("Loaded config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default config at {:?}", path);
            Ok(default)
        }
    }

    /// Save config to the resolved path.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&config_path()?)
    }

    /// Save config to `path`.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reload config from `path`.
    ///
    /// Self is left untouched if the file cannot be read or is invalid.
    pub fn reload_from(&mut self, path: &Path) -> ConfigResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        *self = config;
        tracing::debug!("Reloaded config from {:?}", path);
        Ok(())
    }

    /// Reload config from the resolved path.
    pub fn reload(&mut self) -> ConfigResult<()> {
        self.reload_from(&config_path()?)
    }

    /// Check value ranges and that every exclusion pattern compiles
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_hook_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_hook_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_chain_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_chain_length",
                reason: "must be at least 1".to_string(),
            });
        }
        ExclusionSet::from_config(self).map(|_| ())
    }

    /// Advisory timeout in nanoseconds
    pub fn hook_timeout_ns(&self) -> u64 {
        self.hook_timeout_ms.saturating_mul(1_000_000)
    }

    /// Log filter used when the environment does not set one
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
