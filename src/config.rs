use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// The app's own origin; only requests to this origin are intercepted
  pub origin: Url,
  /// Build version token, part of the static generation name
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Same-origin GETs under this path go network-first
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Served when a static asset is unavailable both locally and remotely
  #[serde(default = "default_offline_page")]
  pub offline_page: Option<String>,
  /// Assets pre-loaded into the static generation at install
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Activate immediately after a successful install
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  #[serde(default)]
  pub dynamic: DynamicConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
  /// Where the store and logs live (defaults to $XDG_DATA_HOME/learnmate-agent)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicConfig {
  /// Ceiling on dynamic generation entries
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
  #[serde(default = "default_evict_interval")]
  pub evict_interval_secs: u64,
}

impl Default for DynamicConfig {
  fn default() -> Self {
    Self {
      max_entries: default_max_entries(),
      evict_interval_secs: default_evict_interval(),
    }
  }
}

impl DynamicConfig {
  pub fn evict_interval(&self) -> Duration {
    Duration::from_secs(self.evict_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Only sync triggers carrying this tag drain the retry queue
  #[serde(default = "default_sync_tag")]
  pub tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_title")]
  pub title: String,
  /// Body used when a push arrives without payload
  #[serde(default = "default_body")]
  pub default_body: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_badge")]
  pub badge: String,
  #[serde(default = "default_vibrate")]
  pub vibrate: Vec<u32>,
  /// Window opened by the primary action
  #[serde(default = "default_app_path")]
  pub app_path: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: default_title(),
      default_body: default_body(),
      icon: default_icon(),
      badge: default_badge(),
      vibrate: default_vibrate(),
      app_path: default_app_path(),
    }
  }
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_cache_prefix() -> String {
  "learnmate".to_string()
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_offline_page() -> Option<String> {
  Some("/offline.html".to_string())
}

fn default_manifest() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/css/styles.css",
    "/css/responsive.css",
    "/js/app.js",
    "/js/lessons.js",
    "/js/quiz.js",
    "/js/i18n.js",
    "/manifest.json",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_true() -> bool {
  true
}

fn default_max_entries() -> usize {
  50
}

fn default_evict_interval() -> u64 {
  60
}

fn default_sync_tag() -> String {
  "sync-progress".to_string()
}

fn default_timeout() -> u64 {
  30
}

fn default_title() -> String {
  "LearnMate".to_string()
}

fn default_body() -> String {
  "New update available".to_string()
}

fn default_icon() -> String {
  "/assets/images/icon-192.png".to_string()
}

fn default_badge() -> String {
  "/assets/images/badge-72.png".to_string()
}

fn default_vibrate() -> Vec<u32> {
  vec![200, 100, 200]
}

fn default_app_path() -> String {
  "/".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./learnmate-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/learnmate-agent/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/learnmate-agent/config.yaml\n\
                 At minimum it must set `origin`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("learnmate-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("learnmate-agent").join("config.yaml");
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
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin {} cannot be used as a base URL", self.origin));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.static_generation() == self.dynamic_generation() {
      return Err(eyre!(
        "version '{}' collides with the dynamic generation name {}",
        self.version,
        self.dynamic_generation()
      ));
    }
    Ok(())
  }

  /// Name of the static generation for the configured version.
  pub fn static_generation(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  /// Name of the long-lived dynamic generation.
  pub fn dynamic_generation(&self) -> String {
    format!("{}-dynamic", self.cache_prefix)
  }

  /// Resolve a path or locator against the app origin.
  pub fn resolve(&self, locator: &str) -> Result<Url> {
    self
      .origin
      .join(locator)
      .map_err(|e| eyre!("Invalid locator '{}': {}", locator, e))
  }

  /// Directory holding the store and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("learnmate-agent"))
  }
}

#[cfg(test)]
pub fn test_config() -> Config {
  Config::from_yaml("origin: https://app.test\n").unwrap()
}
