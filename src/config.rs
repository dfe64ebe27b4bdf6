//! Configuration loading and persistence.
//!
//! Handles reading and writing the client configuration file. The bearer
//! token is never written here; it lives in the credential store (see
//! [`crate::keyring`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the notification client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// REST base URL of the reporting service.
    pub server_url: String,
    /// Explicit ActionCable URL. Derived from `server_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cable_url: Option<String>,
    /// ActionCable channel carrying notification events.
    pub channel_name: String,
    /// Seconds between credential checks / connection reconciliation.
    pub token_poll_interval_secs: u64,
    /// Seconds before a connection attempt is abandoned.
    pub connect_timeout_secs: u64,
    /// Seconds before a REST request is abandoned.
    pub request_timeout_secs: u64,
    /// Page size for authoritative refreshes.
    pub page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: constants::DEFAULT_SERVER_URL.to_string(),
            cable_url: None,
            channel_name: constants::NOTIFICATIONS_CHANNEL.to_string(),
            token_poll_interval_secs: constants::TOKEN_POLL_INTERVAL.as_secs(),
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
            request_timeout_secs: constants::HTTP_REQUEST_TIMEOUT.as_secs(),
            page_size: constants::DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/roadsign-test`
    /// 2. `ROADSIGN_CONFIG_DIR` env var: explicit override
    /// 3. `ROADSIGN_ENV=test`: `tmp/roadsign-test`
    /// 4. Default: platform config dir + `roadsign-notify`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/roadsign-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("ROADSIGN_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::should_skip_keyring() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/roadsign-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("roadsign-notify")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, then applies environment overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            anyhow::bail!("Config file not found");
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).context("Invalid config.json")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("ROADSIGN_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(cable_url) = std::env::var("ROADSIGN_CABLE_URL") {
            self.cable_url = Some(cable_url);
        }

        if let Ok(interval) = std::env::var("ROADSIGN_TOKEN_POLL_INTERVAL") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.token_poll_interval_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("ROADSIGN_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.connect_timeout_secs = secs;
            }
        }

        if let Ok(page_size) = std::env::var("ROADSIGN_PAGE_SIZE") {
            if let Ok(size) = page_size.parse::<u32>() {
                self.page_size = size;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// ActionCable endpoint: the explicit `cable_url`, or the server origin
    /// with a websocket scheme and `/cable` path.
    pub fn effective_cable_url(&self) -> String {
        if let Some(url) = self.cable_url.as_deref().filter(|u| !u.is_empty()) {
            return http_to_ws_scheme(url);
        }
        let ws = http_to_ws_scheme(self.server_url.trim_end_matches('/'));
        // Strip any REST path (e.g. `/api`) so the cable sits at the origin.
        let origin = match ws.find("://") {
            Some(scheme_end) => match ws[scheme_end + 3..].find('/') {
                Some(path_start) => ws[..scheme_end + 3 + path_start].to_string(),
                None => ws,
            },
            None => ws,
        };
        format!("{origin}{}", constants::CABLE_PATH)
    }

    /// Keys accepted by [`with_value`](Self::with_value).
    pub const KEYS: &'static [&'static str] = &[
        "server_url",
        "cable_url",
        "channel_name",
        "token_poll_interval_secs",
        "connect_timeout_secs",
        "request_timeout_secs",
        "page_size",
    ];

    /// Copy with one key set from its command-line form.
    ///
    /// The value is parsed as JSON when possible (numbers, `null`) and taken
    /// as a plain string otherwise.
    pub fn with_value(&self, key: &str, value: &str) -> Result<Self> {
        if !Self::KEYS.contains(&key) {
            anyhow::bail!("Unknown config key '{key}'");
        }
        let mut json = serde_json::to_value(self)?;
        let map = json.as_object_mut().context("Config is not a JSON object")?;
        let parsed = serde_json::from_str::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
        serde_json::from_value(json).with_context(|| format!("Invalid value for '{key}'"))
    }

    /// Reconciliation cadence.
    pub fn token_poll_interval(&self) -> Duration {
        Duration::from_secs(self.token_poll_interval_secs.max(1))
    }

    /// Connection attempt bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// REST request bound.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
