use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin serving both the app shell and the `/api/*` endpoints
  pub origin: String,
  pub cache: CacheConfig,
  pub api: ApiConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub notifications: NotificationConfig,
  pub storage: StorageConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      api: ApiConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      notifications: NotificationConfig::default(),
      storage: StorageConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the one cache store that is current; bump to invalidate everything
  pub version: String,
  /// Document served to navigations when the network is unreachable
  pub app_shell: String,
  /// Resources fetched and stored on install (all-or-nothing)
  pub precache: Vec<String>,
  /// Activate right after a successful install instead of waiting
  pub skip_waiting_on_install: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "disaster-management-v1".to_string(),
      app_shell: "/index.html".to_string(),
      precache: [
        "/",
        "/index.html",
        "/styles.css",
        "/script.js",
        "/manifest.json",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
        "https://cdn.tailwindcss.com/",
        "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
        "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.9.4/leaflet.min.css",
        "https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.9.4/leaflet.min.js",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      skip_waiting_on_install: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Path prefix that marks a request as an API call
  pub prefix: String,
  /// POST endpoints whose offline failures are queued for later delivery
  pub queued_endpoints: Vec<String>,
  /// Number shown to the user when a submission could not be delivered
  pub emergency_number: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      prefix: "/api/".to_string(),
      queued_endpoints: vec!["/api/sos".to_string(), "/api/report".to_string()],
      emergency_number: "112".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag that drains the submission queue
  pub tag: String,
  /// Endpoint probed by the `run` host to detect restored connectivity
  pub health_path: String,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "background-sync-sos".to_string(),
      health_path: "/api/health".to_string(),
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub connect_timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: 10,
      user_agent: concat!("resq/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

/// Fallbacks and presentation for push notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub body: String,
  pub tag: String,
  pub url: String,
  pub icon: String,
  pub badge: String,
  pub sound: String,
  pub vibrate: Vec<u32>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Emergency Alert".to_string(),
      body: "New emergency alert received".to_string(),
      tag: "disaster-alert".to_string(),
      url: "/".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
      sound: "/sounds/emergency-alert.mp3".to_string(),
      vibrate: vec![200, 100, 200, 100, 200, 100, 200],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file holding the caches and the submission queue
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./resq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resq/config.yaml
  ///
  /// Falls back to built-in defaults when nothing is found. `RESQ_ORIGIN`
  /// overrides the configured origin.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("RESQ_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("resq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if !self.api.prefix.starts_with('/') {
      return Err(eyre!("api.prefix must start with '/': {}", self.api.prefix));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_disaster_app() {
    let config = Config::default();
    assert_eq!(config.cache.version, "disaster-management-v1");
    assert_eq!(config.sync.tag, "background-sync-sos");
    assert!(config.api.queued_endpoints.contains(&"/api/sos".to_string()));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://alerts.example.org\ncache:\n  version: disaster-management-v2\n",
    )
    .unwrap();
    assert_eq!(config.origin, "https://alerts.example.org");
    assert_eq!(config.cache.version, "disaster-management-v2");
    assert_eq!(config.cache.app_shell, "/index.html");
    assert_eq!(config.notifications.title, "Emergency Alert");
  }

  #[test]
  fn test_invalid_origin_rejected() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }
}
