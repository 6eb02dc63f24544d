//! Orchestrator configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. A TOML file (`kari.toml` by default)
//! 3. `KARI_*` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::loader::ModuleRoot;

/// Default locations and values.
pub mod defaults {
    pub const CONFIG_FILE: &str = "kari.toml";
    pub const PULSE_INTERVAL_SECS: f64 = 5.0;
    pub const SOCKET_PATH: &str = "/run/kari/kari.sock";
    pub const SOCKET_FALLBACK_PATH: &str = "/tmp/kari.sock";
    pub const SOCKET_MODE: u32 = 0o660;
    pub const BUILTIN_ROOT: &str = "modules/builtin";
    pub const ADDON_ROOT: &str = "modules/addons";
    pub const VOICE_MODULE: &str = "Voice Box";
    pub const ANNOUNCE_ACTION: &str = "say";
    pub const DEFAULT_HANDLER_ACTION: &str = "respond";
}

/// Environment variable names.
pub mod env_vars {
    pub const DEBUG: &str = "KARI_DEBUG";
    pub const TRACE: &str = "KARI_TRACE";
    pub const ENABLE_SOCKET: &str = "KARI_ENABLE_SOCKET";
    pub const SOCKET: &str = "KARI_SOCKET";
    pub const PULSE_INTERVAL: &str = "KARI_PULSE_INTERVAL";
    pub const ACTION_TIMEOUT_MS: &str = "KARI_ACTION_TIMEOUT_MS";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub fallback_path: PathBuf,
    pub mode: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(defaults::SOCKET_PATH),
            fallback_path: PathBuf::from(defaults::SOCKET_FALLBACK_PATH),
            mode: defaults::SOCKET_MODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleRootsConfig {
    pub builtin_root: PathBuf,
    pub addon_root: PathBuf,
}

impl Default for ModuleRootsConfig {
    fn default() -> Self {
        Self {
            builtin_root: PathBuf::from(defaults::BUILTIN_ROOT),
            addon_root: PathBuf::from(defaults::ADDON_ROOT),
        }
    }
}

/// Where free-form control lines are routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultHandlerConfig {
    pub module: String,
    pub action: String,
}

impl Default for DefaultHandlerConfig {
    fn default() -> Self {
        Self {
            module: defaults::VOICE_MODULE.to_string(),
            action: defaults::DEFAULT_HANDLER_ACTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pulse_interval_secs: f64,
    pub action_timeout_ms: Option<u64>,
    pub debug: bool,
    pub trace: bool,
    pub socket: SocketConfig,
    pub modules: ModuleRootsConfig,
    pub voice_module: String,
    pub announce_action: String,
    pub default_handler: DefaultHandlerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pulse_interval_secs: defaults::PULSE_INTERVAL_SECS,
            action_timeout_ms: None,
            debug: false,
            trace: false,
            socket: SocketConfig::default(),
            modules: ModuleRootsConfig::default(),
            voice_module: defaults::VOICE_MODULE.to_string(),
            announce_action: defaults::ANNOUNCE_ACTION.to_string(),
            default_handler: DefaultHandlerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path` (or `kari.toml` in the working directory), then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(defaults::CONFIG_FILE));
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => {
                info!(category = "config", path = %path.display(), "Loading config file");
                Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(category = "config", path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `KARI_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env_vars::DEBUG) {
            self.debug = parse_bool(env_vars::DEBUG, &value)?;
        }
        if let Some(value) = lookup(env_vars::TRACE) {
            self.trace = parse_bool(env_vars::TRACE, &value)?;
        }
        if let Some(value) = lookup(env_vars::ENABLE_SOCKET) {
            self.socket.enabled = parse_bool(env_vars::ENABLE_SOCKET, &value)?;
        }
        if let Some(value) = lookup(env_vars::SOCKET) {
            if !value.trim().is_empty() {
                self.socket.path = PathBuf::from(value.trim());
            }
        }
        if let Some(value) = lookup(env_vars::PULSE_INTERVAL) {
            self.pulse_interval_secs = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: env_vars::PULSE_INTERVAL,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(env_vars::ACTION_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: env_vars::ACTION_TIMEOUT_MS,
                value: value.clone(),
            })?;
            self.action_timeout_ms = (ms > 0).then_some(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.pulse_interval_secs.is_finite() && self.pulse_interval_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "pulse_interval_secs must be positive, got {}",
                self.pulse_interval_secs
            )));
        }
        if self.socket.enabled && self.socket.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket.path is empty".to_string()));
        }
        Ok(())
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pulse_interval_secs)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }

    /// Module roots in scan order: built-in first, then add-ons.
    pub fn module_roots(&self) -> Vec<ModuleRoot> {
        vec![
            ModuleRoot::builtin(&self.modules.builtin_root),
            ModuleRoot::addon(&self.modules.addon_root),
        ]
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        }),
    }
}
