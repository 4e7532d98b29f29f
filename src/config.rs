use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

const FONTS_STYLESHEET: &str = "https://fonts.googleapis.com/css2?family=Amiri:wght@400;700&family=Tajawal:wght@300;400;500;700&display=swap";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app shell is served from; relative manifest paths resolve against it
  pub origin: Url,
  /// Name of the cache generation this build owns
  pub generation: String,
  /// App shell resources that must be cached on install
  pub manifest: Vec<String>,
  /// Requests whose host contains this string always go to the network
  pub network_only_host: String,
  /// Age after which cache-first entries are refreshed
  pub expiry_hours: i64,
  /// `max-age` stamped onto always-network responses
  pub network_only_max_age_secs: u64,
  /// Activate a freshly installed generation without waiting for clients
  pub skip_waiting: bool,
  /// Background sync tag that replays the offline queue
  pub sync_tag: String,
  pub notification: NotificationConfig,
  /// Cache database path (default: $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  /// Network timeout; unset leaves the client default (none)
  pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub icon: String,
  pub badge: String,
  /// Window opened when a notification is clicked
  pub open_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Saudi Music Database".to_string(),
      icon: "/GOASTFLOWER_LOGO.png".to_string(),
      badge: "/GOASTFLOWER_LOGO.png".to_string(),
      open_url: "/".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
      generation: "saudi-music-db-v1".to_string(),
      manifest: [
        "/",
        "/index.html",
        "/styles.css",
        "/app.js",
        "/GOASTFLOWER_LOGO.png",
        FONTS_STYLESHEET,
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      network_only_host: "sheets.googleapis.com".to_string(),
      expiry_hours: 24,
      network_only_max_age_secs: 180,
      skip_waiting: true,
      sync_tag: "background-sync".to_string(),
      notification: NotificationConfig::default(),
      database: None,
      request_timeout_secs: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if self.network_only_host.trim().is_empty() {
      return Err(eyre!("network_only_host must not be empty"));
    }
    if self.expiry_hours <= 0 {
      return Err(eyre!("expiry_hours must be positive"));
    }
    Ok(())
  }

  pub fn expiry(&self) -> Duration {
    Duration::hours(self.expiry_hours)
  }

  /// Cache database path, defaulting to the XDG data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("cache.db"))
  }
}

/// Per-user data directory for the cache database and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("shellcache"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_app_shell() {
    let config = Config::default();
    assert_eq!(config.generation, "saudi-music-db-v1");
    assert_eq!(config.manifest.len(), 6);
    assert_eq!(config.expiry(), Duration::hours(24));
    assert_eq!(config.network_only_max_age_secs, 180);
    assert!(config.skip_waiting);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://directory.example/\ngeneration: v2\nmanifest: [/, /styles.css]\n",
    )
    .unwrap();
    assert_eq!(config.origin.as_str(), "https://directory.example/");
    assert_eq!(config.generation, "v2");
    assert_eq!(config.manifest, vec!["/", "/styles.css"]);
    assert_eq!(config.network_only_host, "sheets.googleapis.com");
    assert_eq!(config.notification.title, "Saudi Music Database");
  }

  #[test]
  fn test_nested_notification_override() {
    let config = Config::from_yaml("notification:\n  title: Directory\n").unwrap();
    assert_eq!(config.notification.title, "Directory");
    assert_eq!(config.notification.icon, "/GOASTFLOWER_LOGO.png");
  }

  #[test]
  fn test_validate_rejects_empty_generation() {
    let config = Config {
      generation: " ".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/shellcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
