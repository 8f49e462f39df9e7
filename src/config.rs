// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Runner configuration.

use backup_runner_ipc::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Environment variable that switches single-instance enforcement on or off.
pub const SINGLE_INSTANCE_ENV: &str = "SINGLE_INSTANCE_ENABLED";

const CONFIG_FILE: &str = "runner.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Connect/retry budget for one client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Connect timeout, and receive timeout for operations that read a reply.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub per_attempt_timeout: Duration,
    #[serde(rename = "delay_ms", with = "millis")]
    pub inter_attempt_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, timeout_ms: u64, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            per_attempt_timeout: Duration::from_millis(timeout_ms),
            inter_attempt_delay: Duration::from_millis(delay_ms),
        }
    }

    /// Budget for asking the running instance to raise its window.
    pub const fn notify_default() -> Self {
        Self::new(5, 500, 200)
    }

    /// Budget for the owner query; shorter, since its result is advisory.
    pub const fn query_default() -> Self {
        Self::new(3, 300, 100)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Contents of `runner.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Loopback port of the notification channel.
    #[serde(default = "default_port")]
    pub port: u16,
    /// When false, the launch lock is skipped and any number of instances may run.
    #[serde(default = "default_true")]
    pub single_instance_enabled: bool,
    /// Mirror log output into `runner_startup.log`.
    #[serde(default = "default_true")]
    pub log_to_file: bool,
    #[serde(default = "RetryPolicy::notify_default")]
    pub notify_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::query_default")]
    pub query_retry: RetryPolicy,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            single_instance_enabled: true,
            log_to_file: true,
            notify_retry: RetryPolicy::notify_default(),
            query_retry: RetryPolicy::query_default(),
        }
    }
}

impl RunnerConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Apply the `SINGLE_INSTANCE_ENABLED` override, if set.
    ///
    /// Returns whether the override changed the configured value. Runs
    /// before logging is up, so reporting is left to the caller.
    pub fn apply_env_override(&mut self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        let enabled = !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "false" | "0" | "no" | "off"
        );
        let changed = enabled != self.single_instance_enabled;
        self.single_instance_enabled = enabled;
        changed
    }
}

/// Loads and saves `runner.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Config manager rooted at the platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("com", "BackupDatabase", "BackupDatabase")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::with_dir(config_dir))
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load the config; a missing file yields defaults.
    pub fn load(&self) -> Result<RunnerConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(RunnerConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        Ok(RunnerConfig::from_toml(&content)?)
    }

    #[allow(dead_code)]
    pub fn save(&self, config: &RunnerConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        let path = self.config_path();
        fs::write(&path, config.to_toml()?)?;
        debug!("Saved runner config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path());
        let config = manager.load().unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.single_instance_enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = RunnerConfig::from_toml(
            r#"
port = 50123

[query_retry]
max_attempts = 1
timeout_ms = 50
delay_ms = 0
"#,
        )
        .unwrap();
        assert_eq!(config.port, 50123);
        assert_eq!(config.query_retry, RetryPolicy::new(1, 50, 0));
        assert_eq!(config.notify_retry, RetryPolicy::notify_default());
        assert!(config.log_to_file);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("nested"));
        let config = RunnerConfig {
            port: 40001,
            single_instance_enabled: false,
            ..RunnerConfig::default()
        };
        manager.save(&config).unwrap();
        assert_eq!(manager.load().unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path());
        fs::write(manager.config_path(), "port = \"not a number\"").unwrap();
        assert!(matches!(manager.load(), Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_env_override() {
        let mut config = RunnerConfig::default();
        assert!(!config.apply_env_override(None));
        assert!(config.single_instance_enabled);

        assert!(config.apply_env_override(Some("FALSE")));
        assert!(!config.single_instance_enabled);

        assert!(config.apply_env_override(Some("true")));
        assert!(config.single_instance_enabled);

        // Matching the file's value is not reported as an override.
        assert!(!config.apply_env_override(Some("1")));
        assert!(config.single_instance_enabled);

        assert!(config.apply_env_override(Some("off")));
        assert!(!config.single_instance_enabled);
    }
}
