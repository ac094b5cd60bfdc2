use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheSettings, FailedRefresh};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub cache: CacheConfig,
  pub broker: BrokerConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub host: String,
  pub port: u16,
  /// Per-request timeout for REST calls and the event stream handshake
  pub fetch_timeout_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 8080,
      fetch_timeout_ms: 5000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  pub expire_minutes: u64,
  pub failed_refresh: FailedRefresh,
  pub event_capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      expire_minutes: 60,
      failed_refresh: FailedRefresh::default(),
      event_capacity: 256,
    }
  }
}

impl CacheConfig {
  pub fn settings(&self) -> CacheSettings {
    CacheSettings {
      expire_after: Duration::from_secs(self.expire_minutes * 60),
      failed_refresh: self.failed_refresh,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  pub call_timeout_ms: u64,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      call_timeout_ms: 5000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for rolling log files (defaults to the user data directory)
  pub directory: Option<PathBuf>,
  /// `EnvFilter` directive; `RUST_LOG` takes precedence
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      directory: None,
      filter: "info".to_string(),
    }
  }
}

impl LogConfig {
  pub fn directory(&self) -> Result<PathBuf> {
    match &self.directory {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|dir| dir.join("habsync").join("logs"))
        .ok_or_else(|| eyre!("Could not determine data directory for logs")),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./habsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/habsync/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("habsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("habsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.remote.fetch_timeout_ms)
  }

  pub fn call_timeout(&self) -> Duration {
    Duration::from_millis(self.broker.call_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.remote.host, "localhost");
    assert_eq!(config.remote.port, 8080);
    assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
    assert_eq!(config.call_timeout(), Duration::from_secs(5));
    assert_eq!(config.cache.settings().expire_after, Duration::from_secs(3600));
    assert_eq!(config.cache.failed_refresh, FailedRefresh::Retry);
    assert_eq!(config.log.filter, "info");
  }

  #[test]
  fn test_partial_sections() {
    let config = Config::parse(
      "remote:\n  host: openhab.local\ncache:\n  expire_minutes: 5\n  failed_refresh: suppress\n",
    )
    .unwrap();
    assert_eq!(config.remote.host, "openhab.local");
    assert_eq!(config.remote.port, 8080);
    assert_eq!(config.cache.settings().expire_after, Duration::from_secs(300));
    assert_eq!(config.cache.failed_refresh, FailedRefresh::Suppress);
    assert_eq!(config.cache.event_capacity, 256);
  }

  #[test]
  fn test_invalid_policy_is_rejected() {
    assert!(Config::parse("cache:\n  failed_refresh: sometimes\n").is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "broker:\n  call_timeout_ms: 250").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.call_timeout(), Duration::from_millis(250));

    assert!(Config::load(Some(Path::new("/nonexistent/habsync.yaml"))).is_err());
  }
}
