use color_eyre::{eyre::eyre, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::connectivity::MonitorConfig;
use crate::queue::RetryPolicy;

/// Environment variable that overrides the API token from the config file.
const TOKEN_ENV: &str = "SURESNAP_API_TOKEN";

/// Backend credentials as seen by the sync engine (already trimmed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
  /// Base URL without trailing slashes. May be empty.
  pub backend_url: String,
  pub api_token: String,
}

/// Read-only supplier of backend configuration. Polled on every use.
pub trait ConfigSource: Send + Sync {
  /// Credentials for the backend, or `None` when no API token is set.
  fn api_config(&self) -> Option<ApiConfig>;

  /// Whether both backend URL and API token are set.
  fn is_configured(&self) -> bool;
}

/// User settings persisted in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
  pub backend_url: String,
  pub api_token: String,
  /// Accounts offered for capture
  pub enabled_account_ids: Vec<String>,
  pub last_used_account_id: Option<String>,
  /// Currencies `add` accepts besides the account's own
  pub currencies: Vec<String>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      backend_url: String::new(),
      api_token: String::new(),
      enabled_account_ids: Vec::new(),
      last_used_account_id: None,
      currencies: vec!["USD".into(), "EUR".into(), "ILS".into()],
    }
  }
}

/// Partial settings update. Applied with [`Settings::merge`].
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
  pub backend_url: Option<String>,
  pub api_token: Option<String>,
  pub enabled_account_ids: Option<Vec<String>>,
  pub last_used_account_id: Option<String>,
  pub currencies: Option<Vec<String>>,
}

impl Settings {
  /// Merge a patch into these settings. Non-empty patch fields win; empty
  /// strings and empty lists leave the current value alone.
  pub fn merge(self, patch: SettingsPatch) -> Self {
    fn text(current: String, next: Option<String>) -> String {
      next.filter(|s| !s.trim().is_empty()).unwrap_or(current)
    }
    fn list(current: Vec<String>, next: Option<Vec<String>>) -> Vec<String> {
      next.filter(|v| !v.is_empty()).unwrap_or(current)
    }

    Self {
      backend_url: text(self.backend_url, patch.backend_url),
      api_token: text(self.api_token, patch.api_token),
      enabled_account_ids: list(self.enabled_account_ids, patch.enabled_account_ids),
      last_used_account_id: patch
        .last_used_account_id
        .filter(|s| !s.is_empty())
        .or(self.last_used_account_id),
      currencies: list(self.currencies, patch.currencies),
    }
  }

  /// Canonical spelling of `code` if it is one of the enabled currencies
  pub fn currency(&self, code: &str) -> Option<&str> {
    self
      .currencies
      .iter()
      .find(|c| c.eq_ignore_ascii_case(code))
      .map(String::as_str)
  }

  pub fn is_configured(&self) -> bool {
    !self.backend_url.trim().is_empty() && !self.api_token.trim().is_empty()
  }

  /// Trimmed credentials, or `None` without a token. An empty backend URL is
  /// allowed here and simply yields relative request paths.
  pub fn api_config(&self) -> Option<ApiConfig> {
    let api_token = self.api_token.trim();
    if api_token.is_empty() {
      return None;
    }
    Some(ApiConfig {
      backend_url: self.backend_url.trim().trim_end_matches('/').to_string(),
      api_token: api_token.to_string(),
    })
  }
}

/// Sync engine tuning knobs (the `sync:` section of the config file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncTuning {
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
  pub request_timeout_secs: u64,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  pub max_retries: u32,
  pub persist_throttle_ms: u64,
}

impl Default for SyncTuning {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      probe_timeout_secs: 5,
      request_timeout_secs: 15,
      backoff_base_ms: 1_000,
      backoff_cap_ms: 30_000,
      max_retries: 3,
      persist_throttle_ms: 1_000,
    }
  }
}

impl SyncTuning {
  pub fn monitor_config(&self) -> MonitorConfig {
    MonitorConfig {
      probe_interval: Duration::from_secs(self.probe_interval_secs),
      probe_timeout: Duration::from_secs(self.probe_timeout_secs),
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      base_delay: Duration::from_millis(self.backoff_base_ms),
      max_delay: Duration::from_millis(self.backoff_cap_ms),
      request_timeout: Duration::from_secs(self.request_timeout_secs),
    }
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      persist_throttle: Duration::from_millis(self.persist_throttle_ms),
      fetch_timeout: Duration::from_secs(self.request_timeout_secs),
      ..CacheConfig::default()
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(flatten)]
  pub settings: Settings,
  #[serde(default)]
  pub sync: SyncTuning,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./suresnap.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/suresnap/config.yaml
  ///
  /// A missing file yields defaults; the returned path is where settings
  /// will be written back.
  pub fn load(explicit_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
    if let Some(p) = explicit_path {
      if !p.exists() {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
      return Ok((Self::load_from_path(p)?, Some(p.to_path_buf())));
    }

    match Self::find_config_file() {
      Some(p) => Ok((Self::load_from_path(&p)?, Some(p))),
      None => Ok((Self::default(), Self::default_path())),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("suresnap.yaml");
    if local.exists() {
      return Some(local);
    }

    Self::default_path().filter(|p| p.exists())
  }

  fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("suresnap").join("config.yaml"))
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
    }
    let contents =
      serde_yaml::to_string(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
    std::fs::write(path, contents)
      .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))
  }

  /// API token from the environment, if set.
  pub fn token_override() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
  }
}

/// Shared, updatable settings. This is the [`ConfigSource`] handed to the
/// sync engine; the UI updates it through [`SettingsHandle::update`].
#[derive(Clone)]
pub struct SettingsHandle {
  config: Arc<RwLock<Config>>,
  path: Option<PathBuf>,
  token_override: Option<String>,
}

impl SettingsHandle {
  pub fn new(config: Config, path: Option<PathBuf>, token_override: Option<String>) -> Self {
    Self {
      config: Arc::new(RwLock::new(config)),
      path,
      token_override,
    }
  }

  /// Effective settings, including the environment token override.
  pub fn settings(&self) -> Settings {
    let mut settings = self.config.read().settings.clone();
    if let Some(token) = &self.token_override {
      settings.api_token = token.clone();
    }
    settings
  }

  pub fn sync_tuning(&self) -> SyncTuning {
    self.config.read().sync.clone()
  }

  /// Where settings are written back, if anywhere.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Merge a patch and write the config file back.
  pub fn update(&self, patch: SettingsPatch) -> Result<()> {
    let snapshot = {
      let mut config = self.config.write();
      config.settings = config.settings.clone().merge(patch);
      config.clone()
    };

    match &self.path {
      Some(path) => snapshot.save(path),
      None => Ok(()),
    }
  }
}

impl ConfigSource for SettingsHandle {
  fn api_config(&self) -> Option<ApiConfig> {
    self.settings().api_config()
  }

  fn is_configured(&self) -> bool {
    self.settings().is_configured()
  }
}
