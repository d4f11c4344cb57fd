//! Persistent configuration for the chai CLI.
//!
//! Config file lives at `~/.config/chai/client.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chai_sdk::ConnectParams;
use serde::{Deserialize, Serialize};

/// Default chat API base URL.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
/// Default socket endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";

/// User configuration (persisted in client.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Socket endpoint, without the user/token query.
    pub endpoint: Option<String>,
    /// Base URL for the HTTP API (token refresh).
    pub api_url: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    /// Path of the stored credential pair.
    pub credentials: Option<PathBuf>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chai")
}

pub fn config_path() -> PathBuf {
    config_dir().join("client.toml")
}

impl Config {
    /// Load from `path`. A missing file is an empty config.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("bad config file {}", path.display()))
    }

    /// Load the default config file, falling back to defaults on error.
    pub fn load() -> Self {
        Self::load_from(&config_path()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring config file");
            Self::default()
        })
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("can't save config to {}", path.display()))
    }
}

/// Effective settings after merging CLI args > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub endpoint: String,
    pub api_url: String,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub credentials: PathBuf,
}

impl Resolved {
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        let defaults = ConnectParams::default();

        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| config.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let api_url = cli
            .api_url
            .clone()
            .or_else(|| config.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let retry_attempts = cli
            .retry_attempts
            .or(config.retry_attempts)
            .unwrap_or(defaults.retry_attempts);
        let retry_interval = cli
            .retry_interval_ms
            .or(config.retry_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_interval);
        let credentials = cli
            .credentials
            .clone()
            .or_else(|| config.credentials.clone())
            .unwrap_or_else(chai_sdk::credentials::default_path);

        Self {
            endpoint,
            api_url,
            retry_attempts,
            retry_interval,
            credentials,
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            endpoint: self.endpoint.clone(),
            retry_attempts: self.retry_attempts,
            retry_interval: self.retry_interval,
            ..ConnectParams::default()
        }
    }

    /// The settings as a config file.
    pub fn to_config(&self) -> Config {
        Config {
            endpoint: Some(self.endpoint.clone()),
            api_url: Some(self.api_url.clone()),
            retry_attempts: Some(self.retry_attempts),
            retry_interval_ms: Some(self.retry_interval.as_millis() as u64),
            credentials: Some(self.credentials.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> super::super::Cli {
        super::super::Cli::parse_from(std::iter::once("chai").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_when_nothing_set() {
        let r = Resolved::merge(&cli(&[]), &Config::default());
        assert_eq!(r.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(r.api_url, DEFAULT_API_URL);
        assert_eq!(r.retry_attempts, 3);
        assert_eq!(r.retry_interval, Duration::from_millis(1500));
    }

    #[test]
    fn cli_overrides_config() {
        let config = Config {
            endpoint: Some("wss://from-config/ws".into()),
            retry_attempts: Some(5),
            retry_interval_ms: Some(250),
            ..Default::default()
        };
        let r = Resolved::merge(&cli(&["--endpoint", "wss://from-cli/ws"]), &config);
        assert_eq!(r.endpoint, "wss://from-cli/ws");
        assert_eq!(r.retry_attempts, 5);
        assert_eq!(r.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chai").join("client.toml");
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let args = cli(&["--api-url", "https://api.example.com"]);
        let r = Resolved::merge(&args, &Config::default());
        r.to_config().save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(loaded.retry_attempts, Some(3));
    }

    #[test]
    fn bad_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "retry_attempts = \"many\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
