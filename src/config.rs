use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// REST base URL, e.g. "https://api.vibely.app/v1"
  pub base_url: String,
  /// Per-request timeout in seconds
  pub timeout_secs: u64,
  /// The signed-in user, shown as the author of comments still being sent
  pub viewer: Option<ViewerConfig>,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.vibely.app/v1".to_string(),
      timeout_secs: 30,
      viewer: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long a fetched value counts as fresh
  pub stale_secs: u64,
  /// How long an unobserved entry survives before eviction
  pub gc_secs: u64,
  /// Keep confirmed snapshots on disk for offline reads
  pub persist: bool,
  /// Override for the snapshot database (defaults to the data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_secs: 60,
      gc_secs: 300,
      persist: true,
      path: None,
    }
  }
}

/// chrono durations top out at i64::MAX milliseconds
const MAX_SECS: u64 = i64::MAX as u64 / 1000;

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::seconds(self.stale_secs.min(MAX_SECS) as i64)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::seconds(self.gc_secs.min(MAX_SECS) as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  /// WebSocket endpoint for push events
  pub ws_url: String,
  /// Reconnect attempts before giving up
  pub max_attempts: u32,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      ws_url: "wss://api.vibely.app/v1/realtime".to_string(),
      max_attempts: 10,
      initial_delay_ms: 1000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is unset
  pub level: String,
  /// Write logs to a file in the data directory
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vibely.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vibely/config.yaml
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
    let local = PathBuf::from("vibely.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("vibely").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the API bearer token from the VIBELY_TOKEN environment variable.
  pub fn get_token() -> Option<String> {
    std::env::var("VIBELY_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
