//! # Engine Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MEDSYNC_API_URL=https://api.example.com                            │
//! │     MEDSYNC_DEBOUNCE_MS=500                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/medsync/medsync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.medsync.medsync/ (macOS)         │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     localhost services, trailing debounce of 250ms                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [service]
//! api_url = "https://api.medsync.app"
//! realtime_url = "wss://api.medsync.app/realtime"
//!
//! [sync]
//! debounce_ms = 250
//! debounce_policy = "trailing"  # trailing | leading
//! request_timeout_secs = 15
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::DebounceConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::TransportConfig;

/// Shortest accepted debounce window.
pub const MIN_DEBOUNCE_MS: u64 = 250;

/// Longest accepted debounce window.
pub const MAX_DEBOUNCE_MS: u64 = 10_000;

// =============================================================================
// Debounce Policy
// =============================================================================

/// How a burst of change events turns into refetches.
///
/// ```text
///   events:    x  x   x              x
///   TRAILING:  ───────────[fetch]    ───────[fetch]
///   LEADING:   [fetch]────[fetch]    [fetch]
///              first event fires, the rest of the burst coalesces
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebouncePolicy {
    /// Fire on the first event, coalesce the remainder of the burst.
    Leading,

    /// Wait for a quiet window, then fire once.
    #[default]
    Trailing,
}

impl std::fmt::Display for DebouncePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebouncePolicy::Leading => write!(f, "leading"),
            DebouncePolicy::Trailing => write!(f, "trailing"),
        }
    }
}

impl std::str::FromStr for DebouncePolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leading" | "immediate" => Ok(DebouncePolicy::Leading),
            "trailing" | "coalesced" => Ok(DebouncePolicy::Trailing),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown debounce policy: '{}'. Valid options: leading, trailing",
                other
            ))),
        }
    }
}

// =============================================================================
// Service Settings
// =============================================================================

/// Where the Data Service and the change feed live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Base URL of the REST Data Service.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// WebSocket URL of the change feed.
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,

    /// Public project key sent as `apikey` on every request, if the
    /// deployment requires one.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_api_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_realtime_url() -> String {
    "ws://localhost:8080/realtime".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            api_url: default_api_url(),
            realtime_url: default_realtime_url(),
            api_key: None,
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Debounce window (milliseconds).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default)]
    pub debounce_policy: DebouncePolicy,

    /// Change feed connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// REST request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Maximum reconnection attempts before giving up.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Keepalive ping interval on the change feed (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_debounce_ms() -> u64 {
    MIN_DEBOUNCE_MS
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    15
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    0 // Infinite
}
fn default_ping_interval() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            debounce_ms: default_debounce_ms(),
            debounce_policy: DebouncePolicy::default(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: default_max_retries(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (medsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        let api = url::Url::parse(&self.service.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.service.api_url
            )));
        }

        let realtime = url::Url::parse(&self.service.realtime_url)?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Realtime URL must start with ws:// or wss://, got: {}",
                self.service.realtime_url
            )));
        }

        if !(MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&self.sync.debounce_ms) {
            return Err(SyncError::InvalidConfig(format!(
                "debounce_ms must be between {} and {}, got {}",
                MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS, self.sync.debounce_ms
            )));
        }

        if self.sync.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MEDSYNC_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.service.api_url = url;
        }

        if let Ok(url) = std::env::var("MEDSYNC_REALTIME_URL") {
            debug!(url = %url, "Overriding realtime URL from environment");
            self.service.realtime_url = url;
        }

        if let Ok(key) = std::env::var("MEDSYNC_API_KEY") {
            self.service.api_key = Some(key);
        }

        if let Ok(ms) = std::env::var("MEDSYNC_DEBOUNCE_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => self.sync.debounce_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring non-numeric MEDSYNC_DEBOUNCE_MS"),
            }
        }

        if let Ok(policy) = std::env::var("MEDSYNC_DEBOUNCE_POLICY") {
            match policy.parse() {
                Ok(parsed) => self.sync.debounce_policy = parsed,
                Err(_) => warn!(policy = %policy, "Unknown debounce policy in environment"),
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "medsync", "medsync")
            .map(|dirs| dirs.config_dir().join("medsync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            window: Duration::from_millis(self.sync.debounce_ms),
            policy: self.sync.debounce_policy,
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.service.realtime_url.clone(),
            api_key: self.service.api_key.clone(),
            connect_timeout: Duration::from_secs(self.sync.connect_timeout_secs),
            ping_interval: Duration::from_secs(self.sync.ping_interval_secs),
            initial_backoff: Duration::from_millis(self.sync.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.sync.max_backoff_secs),
            max_retries: self.sync.max_retries,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }
}
