//! Configuration loading and root folder resolution
//!
//! Configuration file priority:
//! 1. Explicit path from the caller
//! 2. `DCE_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/dce/config.toml` on Linux)
//! 4. Compiled defaults
//!
//! A missing file is never fatal: the module logs a warning and continues on
//! defaults. A file that exists but does not parse is a configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV_VAR: &str = "DCE_CONFIG";
pub const ROOT_FOLDER_ENV_VAR: &str = "DCE_ROOT_FOLDER";
const APP_DIR: &str = "dce";
const DATABASE_FILE: &str = "dce.db";

/// Contents of `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding the database and export files
    pub root_folder: Option<PathBuf>,
    /// Tracing filter directive (`info`, `dce_sync=debug`, ...)
    pub log_level: String,
    /// Base URL of the import backend, e.g. `https://dce.example.org`
    pub backend_url: Option<String>,
    /// Identifies this device in exported envelopes
    pub exporter_info: String,
    /// Minimum gap between two exports
    pub export_cooldown_ms: u64,
    /// Quiet period after the last keystroke before searching
    pub search_debounce_ms: u64,
    /// Quiet period after the last mutation before persisting
    pub persistence_debounce_ms: u64,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            log_level: "info".to_string(),
            backend_url: None,
            exporter_info: format!("dce/{}", env!("CARGO_PKG_VERSION")),
            export_cooldown_ms: 2000,
            search_debounce_ms: 300,
            persistence_debounce_ms: 500,
        }
    }
}

impl TomlConfig {
    /// Parse configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration following the priority order above
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = resolve_config_path(explicit) else {
            warn!("No configuration file found, using compiled defaults");
            return Ok(Self::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using compiled defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.exporter_info.trim().is_empty() {
            return Err(Error::Config("exporter_info must not be empty".to_string()));
        }
        if let Some(url) = &self.backend_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "backend_url must be an http(s) URL, got {:?}",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn export_cooldown(&self) -> Duration {
        Duration::from_millis(self.export_cooldown_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    /// Root folder: environment variable, then TOML, then platform default
    pub fn resolve_root_folder(&self) -> PathBuf {
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        if let Some(path) = &self.root_folder {
            return path.clone();
        }
        default_root_folder()
    }

    /// Database file inside the resolved root folder
    pub fn database_path(&self) -> PathBuf {
        self.resolve_root_folder().join(DATABASE_FILE)
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join("config.toml"))
        .filter(|path| path.exists())
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./dce_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.export_cooldown(), Duration::from_secs(2));
        assert_eq!(config.search_debounce(), Duration::from_millis(300));
        assert!(config.exporter_info.starts_with("dce/"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = TomlConfig::from_toml_str("export_cooldown_ms = 5000\n").unwrap();
        assert_eq!(config.export_cooldown_ms, 5000);
        assert_eq!(config.persistence_debounce_ms, 500);
    }

    #[test]
    fn test_invalid_backend_url_rejected() {
        let err = TomlConfig::from_toml_str("backend_url = \"ftp://example\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_file_rejected() {
        assert!(TomlConfig::from_toml_str("export_cooldown_ms = \"soon\"").is_err());
    }
}
