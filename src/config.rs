use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Lowercase path suffixes treated as immutable static assets.
  pub static_suffixes: Vec<String>,
  /// Path prefixes whose GET responses are cached with a freshness window.
  pub api_prefixes: Vec<String>,
  /// Seconds before a cached API response is flagged stale.
  pub freshness_secs: u64,
  /// Seconds between periodic background sync passes.
  pub sync_interval_secs: u64,
  /// Seconds between connectivity probes.
  pub probe_interval_secs: u64,
  /// URL probed to detect connectivity; probing is disabled when unset.
  pub probe_url: Option<String>,
  /// Core asset URLs fetched during install. Install fails if any is missing.
  pub precache: Vec<String>,
  /// Override for the cache/queue database location.
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      static_suffixes: default_static_suffixes(),
      api_prefixes: vec!["/api/".to_string()],
      freshness_secs: 300,
      sync_interval_secs: 60,
      probe_interval_secs: 15,
      probe_url: None,
      precache: Vec::new(),
      database: None,
    }
  }
}

fn default_static_suffixes() -> Vec<String> {
  [
    ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2", ".ttf",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./syncq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/syncq/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    // Check current directory
    let local = PathBuf::from("syncq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("syncq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Resolve the database path: explicit override or the default data dir.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("syncq").join("offline.db"))
  }
}
