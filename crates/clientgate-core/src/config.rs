//! Application configuration management.
//!
//! Two layers of configuration exist:
//!
//! - `Config`: portal settings (origin, sign-in path, branding, lifetimes,
//!   gateway timeout, mail relay). Stored at
//!   `~/.config/clientgate/config.json`.
//! - `CrmConfig`: the CRM connection (instance URL, bearer token, API
//!   version). Stored in the portal's key/value store next to the session,
//!   and overridable from `SF_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{KeyValueStore, CRM_CONFIG_KEY};

/// Application name used for config/data directory paths
const APP_NAME: &str = "clientgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Magic links are valid for 15 minutes.
pub const DEFAULT_TOKEN_MINUTES: i64 = 15;

/// Sessions last 24 hours from creation and are never extended.
pub const DEFAULT_SESSION_HOURS: i64 = 24;

/// Upper bound on a CRM call before falling open.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 8;

/// Longest accepted magic-link lifetime (one day).
const MAX_TOKEN_MINUTES: i64 = 24 * 60;

/// Longest accepted session lifetime (one year).
const MAX_SESSION_HOURS: i64 = 365 * 24;

/// Longest accepted gateway timeout.
const MAX_GATEWAY_TIMEOUT_SECS: u64 = 300;

/// Salesforce REST API version used when none is configured.
pub const DEFAULT_API_VERSION: &str = "59.0";

const DEFAULT_ORIGIN: &str = "http://localhost:8080";
const DEFAULT_SIGN_IN_PATH: &str = "/portal/login.html";
const DEFAULT_FIRM_NAME: &str = "O'Brien Immigration Law";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public origin of the portal, e.g. `https://example-law.com`.
    pub origin: String,
    /// Path of the sign-in page that redeems `?token=` links.
    pub sign_in_path: String,
    /// Firm name used in outgoing sign-in emails.
    pub firm_name: String,
    pub token_minutes: i64,
    pub session_hours: i64,
    pub gateway_timeout_secs: u64,
    /// Endpoint of the outbound mail relay. Without it links are surfaced
    /// on the console instead of emailed.
    pub mail_relay_url: Option<String>,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            firm_name: DEFAULT_FIRM_NAME.to_string(),
            token_minutes: DEFAULT_TOKEN_MINUTES,
            session_hours: DEFAULT_SESSION_HOURS,
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            mail_relay_url: None,
            data_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read config file")?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Absolute URL of the sign-in entry point.
    pub fn sign_in_url(&self) -> String {
        let origin = self.origin.trim_end_matches('/');
        if self.sign_in_path.starts_with('/') {
            format!("{}{}", origin, self.sign_in_path)
        } else {
            format!("{}/{}", origin, self.sign_in_path)
        }
    }

    /// Magic-link lifetime, clamped to 1 minute ..= 1 day.
    pub fn token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_minutes.clamp(1, MAX_TOKEN_MINUTES))
    }

    /// Session lifetime, clamped to 1 hour ..= 1 year.
    pub fn session_lifetime(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_hours.clamp(1, MAX_SESSION_HOURS))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs.clamp(1, MAX_GATEWAY_TIMEOUT_SECS))
    }
}

/// Connection settings for the CRM query API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmConfig {
    #[serde(default)]
    pub instance_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub api_version: Option<String>,
}

impl CrmConfig {
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            access_token: access_token.into(),
            api_version: None,
        }
    }

    /// A CRM is configured once an instance URL is present.
    pub fn is_configured(&self) -> bool {
        !self.instance_url.trim().is_empty()
    }

    pub fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    /// Load from the store. Missing or unreadable settings mean "not
    /// configured", which puts verification into local mode.
    pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
        match store.get(CRM_CONFIG_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable CRM config");
                    Ok(Self::default())
                }
            },
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        let contents = serde_json::to_string(self)?;
        store.set(CRM_CONFIG_KEY, &contents)
    }

    /// Apply `SF_INSTANCE_URL`, `SF_ACCESS_TOKEN` and `SF_API_VERSION`
    /// overrides from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SF_INSTANCE_URL") {
            if !url.trim().is_empty() {
                self.instance_url = url;
            }
        }
        if let Ok(token) = std::env::var("SF_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                self.access_token = token;
            }
        }
        if let Ok(version) = std::env::var("SF_API_VERSION") {
            if !version.trim().is_empty() {
                self.api_version = Some(version);
            }
        }
        self
    }
}
