//! Configuration loading and persistence.
//!
//! Reads `config.json` from the config directory, then applies
//! `CHANNELMUX_*` environment overrides. The bearer token is never written
//! to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::channel::{ReconnectPolicy, DEFAULT_MAX_RECONNECT_DELAY, DEFAULT_RECONNECT_DELAY};
use crate::feeds::polling::DEFAULT_POLL_INTERVAL;
use crate::feeds::{Endpoints, StaticToken};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the channel client.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Real-time endpoint (`ws(s)://` or `http(s)://`).
    pub base_url: String,
    /// REST API root used for history and the polling fallback.
    pub api_url: String,
    /// Bearer token - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
    /// First reconnect delay in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay in milliseconds.
    pub max_reconnect_delay_ms: u64,
    /// Interval between polling fallback fetches in milliseconds.
    pub poll_interval_ms: u64,
    /// Application heartbeat period in seconds; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_secs: Option<u64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("max_reconnect_delay_ms", &self.max_reconnect_delay_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000".to_string(),
            api_url: "http://localhost:8000/api".to_string(),
            token: None,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            heartbeat_secs: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CHANNELMUX_CONFIG_DIR` wins over the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CHANNELMUX_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("channelmux")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads `config.json` from `dir`; defaults when the file is missing.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("[Config] No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Apply `CHANNELMUX_*` overrides looked up through `lookup`.
    ///
    /// Numeric values that do not parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup("CHANNELMUX_BASE_URL") {
            self.base_url = base_url;
        }

        if let Some(api_url) = lookup("CHANNELMUX_API_URL") {
            self.api_url = api_url;
        }

        // Token from env var (for CI/CD)
        if let Some(token) = lookup("CHANNELMUX_TOKEN") {
            self.token = Some(token).filter(|t| !t.is_empty());
        }

        if let Some(ms) = parse_override(&lookup, "CHANNELMUX_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = ms;
        }

        if let Some(ms) = parse_override(&lookup, "CHANNELMUX_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms;
        }

        if let Some(secs) = parse_override(&lookup, "CHANNELMUX_HEARTBEAT_SECS") {
            self.heartbeat_secs = (secs > 0).then_some(secs);
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`. The token is NOT saved.
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(path)
    }

    /// Reconnect behavior derived from this config.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::with_base_delay(Duration::from_millis(self.reconnect_delay_ms))
            .max_delay(Duration::from_millis(self.max_reconnect_delay_ms));
        match self.heartbeat_secs {
            Some(secs) => policy.heartbeat(Duration::from_secs(secs)),
            None => policy,
        }
    }

    /// Channel address builder carrying this config's token.
    pub fn endpoints(&self) -> Result<Endpoints> {
        let tokens = Arc::new(StaticToken::new(self.token.clone()));
        Endpoints::with_tokens(&self.base_url, tokens)
            .with_context(|| format!("Invalid base URL '{}'", self.base_url))
    }

    /// Polling fallback interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
