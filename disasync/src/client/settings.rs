//! Persistent client settings
//!
//! The list of known relays is read when the host starts and written back
//! when it shuts down.

use crate::fs::ensure_directory_exists;
use anyhow::{Context, Result};
use config::{ConfigError, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// One relay the user can connect to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub no_ssl: bool,
}

impl ServerEntry {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Settings {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).format(FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("settings not initialized")]
pub struct SettingsNotInitialized {}

pub fn read_settings(path: &Path) -> Result<Result<Settings, SettingsNotInitialized>> {
    if !path.exists() {
        return Ok(Err(SettingsNotInitialized {}));
    }
    tracing::debug!("Reading settings from {}", path.display());

    let settings = Settings::read(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;

    Ok(Ok(settings))
}

pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    ensure_directory_exists(path)
        .with_context(|| format!("failed to create directory for {}", path.display()))?;

    let toml = toml::to_string(settings)?;
    fs::write(path, toml)
        .with_context(|| format!("failed to write settings file {}", path.display()))?;

    tracing::debug!("Settings written to {}", path.display());
    Ok(())
}
