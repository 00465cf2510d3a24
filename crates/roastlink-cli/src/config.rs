//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use roastlink_core::{ConnectionConfig, SessionConfig};

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Default analyzer address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Last successfully connected analyzer (auto-updated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonded_device: Option<String>,

    /// Name of the bonded analyzer (for display)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonded_device_name: Option<String>,

    /// Offline queue database (defaults to the platform data directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_path: Option<PathBuf>,

    /// Complete a measurement once its mandatory values are in, without
    /// waiting for the analyzer's completion event
    #[serde(default)]
    pub checklist_fallback: bool,

    /// Measurement backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Timeouts in seconds
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Measurement backend settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://roastery.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Timeouts in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect")]
    pub connect: u64,
    #[serde(default = "default_auto_connect")]
    pub auto_connect: u64,
    #[serde(default = "default_measurement")]
    pub measurement: u64,
    #[serde(default = "default_secondary_phase")]
    pub secondary_phase: u64,
    #[serde(default = "default_checklist_grace")]
    pub checklist_grace: u64,
}

fn default_connect() -> u64 {
    roastlink_core::manager::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_auto_connect() -> u64 {
    roastlink_core::manager::DEFAULT_AUTO_CONNECT_TIMEOUT.as_secs()
}

fn default_measurement() -> u64 {
    SessionConfig::default().session_timeout.as_secs()
}

fn default_secondary_phase() -> u64 {
    SessionConfig::default().secondary_phase_timeout.as_secs()
}

fn default_checklist_grace() -> u64 {
    SessionConfig::default().checklist_grace.as_secs()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            auto_connect: default_auto_connect(),
            measurement: default_measurement(),
            secondary_phase: default_secondary_phase(),
            checklist_grace: default_checklist_grace(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roastlink")
            .join("config.toml")
    }

    /// Load config from `path`, or return default if missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Copy with secrets replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.backend.token.is_some() {
            config.backend.token = Some("<redacted>".to_string());
        }
        config
    }

    /// Where the offline queue lives.
    pub fn queue_path(&self) -> PathBuf {
        self.queue_path
            .clone()
            .unwrap_or_else(roastlink_store::default_db_path)
    }

    /// Connection settings, with an optional connect timeout override.
    pub fn connection_config(&self, connect_timeout: Option<u64>) -> Result<ConnectionConfig> {
        let config = ConnectionConfig::default()
            .connect_timeout(Duration::from_secs(
                connect_timeout.unwrap_or(self.timeouts.connect),
            ))
            .auto_connect_timeout(Duration::from_secs(self.timeouts.auto_connect));
        config.validate().context("Invalid connection timeouts")?;
        Ok(config)
    }

    /// Session settings, with an optional measurement timeout override.
    pub fn session_config(&self, measurement_timeout: Option<u64>) -> Result<SessionConfig> {
        let config = SessionConfig::default()
            .session_timeout(Duration::from_secs(
                measurement_timeout.unwrap_or(self.timeouts.measurement),
            ))
            .secondary_phase_timeout(Duration::from_secs(self.timeouts.secondary_phase))
            .checklist_fallback(self.checklist_fallback)
            .checklist_grace(Duration::from_secs(self.timeouts.checklist_grace));
        config.validate().context("Invalid measurement timeouts")?;
        Ok(config)
    }

    /// Explicit device, then configured default, then the bonded device.
    pub fn resolve_device(&self, device: Option<String>) -> Option<String> {
        device
            .or_else(|| self.device.clone())
            .or_else(|| self.bonded_device.clone())
    }
}

/// Remember the analyzer that was just connected.
///
/// Re-reads the file so concurrent edits are not clobbered.
pub fn update_bonded_device(path: &Path, identifier: &str, name: Option<&str>) -> Result<()> {
    let mut config = Config::load(path);
    if config.bonded_device.as_deref() == Some(identifier)
        && config.bonded_device_name.as_deref() == name
    {
        return Ok(());
    }
    config.bonded_device = Some(identifier.to_string());
    config.bonded_device_name = name.map(|n| n.to_string());
    config.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_core() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.connect, 10);
        assert_eq!(timeouts.auto_connect, 15);
        assert_eq!(timeouts.measurement, 300);
        assert_eq!(timeouts.secondary_phase, 180);
        assert_eq!(timeouts.checklist_grace, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            url = "https://roastery.example.com"

            [timeouts]
            measurement = 120
            "#,
        )
        .unwrap();
        assert_eq!(
            config.backend.url.as_deref(),
            Some("https://roastery.example.com")
        );
        assert_eq!(config.timeouts.measurement, 120);
        assert_eq!(config.timeouts.secondary_phase, 180);
        assert!(config.device.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.device = Some("AA:BB:CC:DD:EE:01".to_string());
        config.backend.token = Some("secret".to_string());
        config.timeouts.connect = 20;

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path), config);
    }

    #[test]
    fn test_missing_or_broken_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(Config::load(&path), Config::default());

        fs::write(&path, "device = [not toml").unwrap();
        assert_eq!(Config::load(&path), Config::default());
    }

    #[test]
    fn test_redacted_hides_token() {
        let mut config = Config::default();
        config.backend.token = Some("secret".to_string());
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_resolve_device_order() {
        let mut config = Config::default();
        assert_eq!(config.resolve_device(None), None);

        config.bonded_device = Some("bonded".to_string());
        assert_eq!(config.resolve_device(None).as_deref(), Some("bonded"));

        config.device = Some("default".to_string());
        assert_eq!(config.resolve_device(None).as_deref(), Some("default"));
        assert_eq!(
            config.resolve_device(Some("explicit".to_string())).as_deref(),
            Some("explicit")
        );
    }

    #[test]
    fn test_update_bonded_device() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        update_bonded_device(&path, "AA:BB:CC:DD:EE:01", Some("CoffeeLab 0042")).unwrap();
        let config = Config::load(&path);
        assert_eq!(config.bonded_device.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(config.bonded_device_name.as_deref(), Some("CoffeeLab 0042"));
    }

    #[test]
    fn test_timeouts_override() {
        let config = Config::default();
        let session = config.session_config(Some(60)).unwrap();
        assert_eq!(session.session_timeout, Duration::from_secs(60));
        assert!(!session.checklist_fallback);

        let config: Config = toml::from_str("checklist_fallback = true").unwrap();
        assert!(config.session_config(None).unwrap().checklist_fallback);

        let mut config = Config::default();
        config.timeouts.measurement = 0;
        assert!(config.session_config(None).is_err());
    }
}
