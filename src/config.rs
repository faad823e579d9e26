use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

pub const DEFAULT_STORAGE_KEY: &str = "solo-tab-enforcer";
pub const DEFAULT_CHANNEL_ID: &str = "solo-tab-enforcer-channel";
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_TAB_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Ceiling for every interval and the timeout: one day.
pub const MAX_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_WARNING_MESSAGE: &str =
    "This application is already open in another tab. Please close this tab and use the existing one.";

/// What a tab does once it loses the election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Show `warning_message` through the host.
    #[default]
    Warn,
    /// Send the host to `redirect_url`.
    Redirect,
    /// Ask the host to close the tab.
    Close,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Redirect => write!(f, "redirect"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Options recognized by [`crate::guard::TabGuard`] and
/// [`crate::observer::TabObserver`].
///
/// Every field has a default, and files may spell keys either in snake_case
/// or in the camelCase of the storage format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    #[serde(alias = "storageKey")]
    pub storage_key: String,
    #[serde(alias = "channelId")]
    pub channel_id: String,
    #[serde(alias = "checkIntervalMs")]
    pub check_interval_ms: u64,
    #[serde(alias = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,
    #[serde(alias = "tabTimeoutMs")]
    pub tab_timeout_ms: u64,
    #[serde(alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    #[serde(alias = "allowMultipleTabs")]
    pub allow_multiple_tabs: bool,
    pub policy: ConflictPolicy,
    #[serde(alias = "warningMessage")]
    pub warning_message: String,
    #[serde(alias = "redirectUrl", skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub debug: bool,
    #[serde(alias = "useBroadcastTransport")]
    pub use_broadcast_transport: bool,
    #[serde(alias = "useStorageTransport")]
    pub use_storage_transport: bool,
    /// Also track the live tab set and raise added/removed/changed.
    #[serde(alias = "observeTabs")]
    pub observe_tabs: bool,
    /// Overrides for what the host reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(alias = "userAgent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            channel_id: DEFAULT_CHANNEL_ID.to_string(),
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            tab_timeout_ms: DEFAULT_TAB_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            allow_multiple_tabs: false,
            policy: ConflictPolicy::Warn,
            warning_message: DEFAULT_WARNING_MESSAGE.to_string(),
            redirect_url: None,
            debug: false,
            use_broadcast_transport: true,
            use_storage_transport: true,
            observe_tabs: false,
            url: None,
            user_agent: None,
        }
    }
}

impl GuardConfig {
    /// Enforce one active tab and warn the others.
    pub fn single_tab_enforcer() -> Self {
        Self::default()
    }

    /// Track open tabs without ever raising a conflict.
    pub fn tab_observer() -> Self {
        Self {
            allow_multiple_tabs: true,
            observe_tabs: true,
            ..Self::default()
        }
    }

    /// Enforcement plus tab tracking.
    pub fn full_manager() -> Self {
        Self {
            observe_tabs: true,
            ..Self::default()
        }
    }

    /// Load from a YAML or JSON file (JSON parses as YAML).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| GuardError::InvalidConfig(e.to_string()))
    }

    /// Coerce out-of-range values. Returns the fixed config and one note per
    /// value that was changed, for the caller to log.
    pub fn normalized(mut self) -> (Self, Vec<String>) {
        let mut notes = Vec::new();
        if self.storage_key.trim().is_empty() {
            notes.push(format!("empty storage_key, using '{DEFAULT_STORAGE_KEY}'"));
            self.storage_key = DEFAULT_STORAGE_KEY.to_string();
        }
        if self.channel_id.trim().is_empty() {
            notes.push(format!("empty channel_id, using '{DEFAULT_CHANNEL_ID}'"));
            self.channel_id = DEFAULT_CHANNEL_ID.to_string();
        }
        for (name, value, default) in [
            (
                "check_interval_ms",
                &mut self.check_interval_ms,
                DEFAULT_CHECK_INTERVAL_MS,
            ),
            (
                "heartbeat_interval_ms",
                &mut self.heartbeat_interval_ms,
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            (
                "tab_timeout_ms",
                &mut self.tab_timeout_ms,
                DEFAULT_TAB_TIMEOUT_MS,
            ),
            (
                "poll_interval_ms",
                &mut self.poll_interval_ms,
                DEFAULT_POLL_INTERVAL_MS,
            ),
        ] {
            if *value == 0 {
                notes.push(format!("{name} is 0, using {default}"));
                *value = default;
            } else if *value > MAX_INTERVAL_MS {
                notes.push(format!("{name} {value} is too large, capped at {MAX_INTERVAL_MS}"));
                *value = MAX_INTERVAL_MS;
            }
        }
        // A peer must miss at least two heartbeats before it counts as gone.
        let floor = self.heartbeat_interval_ms.saturating_mul(2);
        if self.tab_timeout_ms < floor {
            notes.push(format!(
                "tab_timeout_ms {} is below twice the heartbeat interval, raised to {floor}",
                self.tab_timeout_ms
            ));
            self.tab_timeout_ms = floor;
        }
        if self.policy == ConflictPolicy::Redirect
            && self.redirect_url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            notes.push("redirect policy without redirect_url, warning instead".to_string());
            self.policy = ConflictPolicy::Warn;
        }
        (self, notes)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_already_normal() {
        let (config, notes) = GuardConfig::default().normalized();
        assert!(notes.is_empty(), "{notes:?}");
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let config = GuardConfig {
            check_interval_ms: 0,
            heartbeat_interval_ms: 0,
            tab_timeout_ms: 0,
            ..GuardConfig::default()
        };
        let (config, notes) = config.normalized();
        assert_eq!(config.check_interval_ms, DEFAULT_CHECK_INTERVAL_MS);
        assert_eq!(config.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert_eq!(config.tab_timeout_ms, DEFAULT_TAB_TIMEOUT_MS);
        assert_eq!(notes.len(), 3);
    }

    #[test]
    fn timeout_is_raised_above_heartbeat() {
        let config = GuardConfig {
            heartbeat_interval_ms: 4000,
            tab_timeout_ms: 5000,
            ..GuardConfig::default()
        };
        let (config, notes) = config.normalized();
        assert_eq!(config.tab_timeout_ms, 8000);
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn oversized_values_are_capped() {
        let config = GuardConfig {
            check_interval_ms: u64::MAX,
            tab_timeout_ms: u64::MAX,
            ..GuardConfig::default()
        };
        let (config, notes) = config.normalized();
        assert_eq!(config.check_interval_ms, MAX_INTERVAL_MS);
        assert_eq!(config.tab_timeout_ms, MAX_INTERVAL_MS);
        assert_eq!(notes.len(), 2, "{notes:?}");

        let now = chrono::Utc::now();
        let record = crate::model::TabRecord::new(&crate::TabId::from("tab_a"), now, "", "");
        assert!(record.is_live(now, config.tab_timeout_ms));
    }

    #[test]
    fn redirect_without_url_becomes_warn() {
        let config = GuardConfig {
            policy: ConflictPolicy::Redirect,
            ..GuardConfig::default()
        };
        assert_eq!(config.normalized().0.policy, ConflictPolicy::Warn);

        let config = GuardConfig {
            policy: ConflictPolicy::Redirect,
            redirect_url: Some("/duplicate".into()),
            ..GuardConfig::default()
        };
        assert_eq!(config.normalized().0.policy, ConflictPolicy::Redirect);
    }

    #[test]
    fn parses_yaml_with_either_key_style() {
        let yaml = "storageKey: my-app\ncheck_interval_ms: 250\npolicy: close\nallowMultipleTabs: true\n";
        let config = GuardConfig::parse(yaml).unwrap();
        assert_eq!(config.storage_key, "my-app");
        assert_eq!(config.check_interval_ms, 250);
        assert_eq!(config.policy, ConflictPolicy::Close);
        assert!(config.allow_multiple_tabs);
        assert_eq!(config.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
    }

    #[test]
    fn loads_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard.json");
        fs::write(&path, r#"{"tabTimeoutMs": 9000, "debug": true}"#).unwrap();
        let config = GuardConfig::load(&path).unwrap();
        assert_eq!(config.tab_timeout_ms, 9000);
        assert!(config.debug);
    }

    #[test]
    fn malformed_file_is_invalid_config() {
        let err = GuardConfig::parse("check_interval_ms: [nope").unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[test]
    fn presets() {
        assert!(!GuardConfig::single_tab_enforcer().allow_multiple_tabs);
        let observer = GuardConfig::tab_observer();
        assert!(observer.allow_multiple_tabs && observer.observe_tabs);
        let full = GuardConfig::full_manager();
        assert!(!full.allow_multiple_tabs && full.observe_tabs);
    }
}
