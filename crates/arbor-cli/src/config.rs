//! CLI configuration: a small TOML file under the user config directory,
//! with environment variables taking precedence.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use arbor_db::DbConfig;

/// On-disk configuration for the `arbor` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    /// SQLite URL; `ARBOR_DATABASE_URL` overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Default bind address for `arbor serve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ArborConfig {
    /// Default path: `<config_dir>/arbor/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arbor")
            .join("config.toml")
    }

    /// Load the config file if present; a missing file is an empty config.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write the config file, creating parent directories.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Resolve the database config: CLI flag, then env, then file, then the
    /// platform default.
    pub fn db_config(&self, cli_override: Option<&str>) -> DbConfig {
        if let Some(url) = cli_override {
            return DbConfig::new(url);
        }
        if let Ok(url) = std::env::var("ARBOR_DATABASE_URL") {
            return DbConfig::new(url);
        }
        match &self.database_url {
            Some(url) => DbConfig::new(url.clone()),
            None => DbConfig::new(DbConfig::default_url()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_override_wins() {
        let config = ArborConfig {
            database_url: Some("sqlite:///from-file.db".into()),
            ..Default::default()
        };
        let db = config.db_config(Some("sqlite:///from-flag.db"));
        assert_eq!(db.database_url, "sqlite:///from-flag.db");
    }

    #[test]
    fn file_value_used_when_no_override() {
        let config = ArborConfig {
            database_url: Some("sqlite:///from-file.db".into()),
            ..Default::default()
        };
        // Only meaningful when the env var is unset in the test environment.
        if std::env::var("ARBOR_DATABASE_URL").is_err() {
            let db = config.db_config(None);
            assert_eq!(db.database_url, "sqlite:///from-file.db");
        }
    }

    #[test]
    fn toml_roundtrip() {
        let config = ArborConfig {
            database_url: Some("sqlite:///x.db".into()),
            bind: Some("0.0.0.0".into()),
            port: Some(7410),
        };
        let raw = toml::to_string_pretty(&config).unwrap();
        let back: ArborConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.port, Some(7410));
        assert_eq!(back.bind.as_deref(), Some("0.0.0.0"));
    }
}
