//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! cache capacities, channel sizes, poll intervals, and default paths.
//! `AppConfig` is the root configuration struct containing all settings.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Cache and Channel Constants
// =============================================================================

/// Maximum entries kept in each recency cache (notifications, events)
pub const RECENT_CACHE_CAP: usize = 100;

/// Capacity of each streaming subscriber's delivery channel.
/// A subscriber that falls this far behind loses batches rather than
/// stalling the producing poll task.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the mark-read propagation queue
pub const MARK_READ_QUEUE_CAPACITY: usize = 64;

/// Maximum detail lookups memoized across mail poll batches
pub const DETAIL_CACHE_CAP: u64 = 500;

/// TTL in seconds for memoized detail lookups
pub const DETAIL_CACHE_TTL_SECS: u64 = 300;

// =============================================================================
// Poll Interval Constants
// =============================================================================

/// Floor for the list poller interval, regardless of what the provider
/// advises. Prevents hammering the events endpoint.
pub const LIST_POLL_FLOOR_SECS: u64 = 60;

/// Interval between read-state reconciliation polls
pub const RECONCILE_INTERVAL_SECS: u64 = 60;

/// Interval between mail-directory wake-up taps
pub const MAIL_WAKE_INTERVAL_SECS: u64 = 30;

/// Interval between background read-state checkpoints
pub const CHECKPOINT_INTERVAL_SECS: u64 = 300;

/// Mail older than this window is ignored during segment walks.
/// Bounds the work re-derived after a watermark reset.
pub const MAIL_EVENT_WINDOW_DAYS: i64 = 30;

/// Bounded window of events fetched per list poll cycle
pub const LIST_EVENTS_WINDOW: usize = 100;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default read-state checkpoint path
pub const DEFAULT_CHECKPOINT_PATH: &str = "readstate.json";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "transom=debug,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default GitHub API base URL
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Status HTTP server configuration
    pub http: HttpServerConfig,
    /// The single served user
    pub user: UserConfig,
    /// Mail archive settings
    pub mail: MailConfig,
    /// GitHub source settings
    pub github: GithubConfig,
    /// Gerrit source settings (optional; mail adapter is skipped if absent)
    #[serde(default)]
    pub gerrit: Option<GerritConfig>,
    /// Read-state checkpoint settings
    #[serde(default)]
    pub readstate: ReadStateConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Status HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
}

/// The single user this aggregator instance serves
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// GitHub login of the served user
    pub login: String,
    /// Gerrit username of the served user (defaults to the GitHub login)
    pub gerrit_username: Option<String>,
}

/// Mail archive settings
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Directory containing the framed mail segment files
    pub dir: String,
    /// Seconds between wake-up taps on the mail walkers
    #[serde(default = "MailConfig::default_wake_interval")]
    pub wake_interval_seconds: u64,
}

impl MailConfig {
    fn default_wake_interval() -> u64 {
        MAIL_WAKE_INTERVAL_SECS
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_seconds)
    }
}

/// GitHub source settings
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// API base URL (override for GitHub Enterprise)
    #[serde(default = "GithubConfig::default_api_base")]
    pub api_base: String,
    /// Personal access token
    pub token: Option<String>,
    /// Floor for the list poll interval in seconds
    #[serde(default = "GithubConfig::default_poll_floor")]
    pub poll_floor_seconds: u64,
}

impl GithubConfig {
    fn default_api_base() -> String {
        DEFAULT_GITHUB_API_BASE.to_string()
    }

    fn default_poll_floor() -> u64 {
        LIST_POLL_FLOOR_SECS
    }

    pub fn poll_floor(&self) -> Duration {
        Duration::from_secs(self.poll_floor_seconds)
    }
}

/// Gerrit source settings
#[derive(Debug, Clone, Deserialize)]
pub struct GerritConfig {
    /// Gerrit server host (e.g., "go-review.googlesource.com")
    pub host: String,
    /// HTTP password / token for authenticated REST calls
    pub token: Option<String>,
}

/// Read-state checkpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReadStateConfig {
    /// Path of the checkpoint file
    #[serde(default = "ReadStateConfig::default_path")]
    pub checkpoint_path: String,
    /// Seconds between background checkpoint writes
    #[serde(default = "ReadStateConfig::default_interval")]
    pub checkpoint_interval_seconds: u64,
}

impl Default for ReadStateConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: Self::default_path(),
            checkpoint_interval_seconds: Self::default_interval(),
        }
    }
}

impl ReadStateConfig {
    fn default_path() -> String {
        DEFAULT_CHECKPOINT_PATH.to_string()
    }

    fn default_interval() -> u64 {
        CHECKPOINT_INTERVAL_SECS
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;

        if config.user.login.is_empty() {
            return Err(ConfigError::Validation(
                "user.login must not be empty".to_string(),
            ));
        }
        if config.mail.dir.is_empty() {
            return Err(ConfigError::Validation(
                "mail.dir must not be empty".to_string(),
            ));
        }

        Ok(config)
    }

    /// Gerrit username of the served user, defaulting to the GitHub login
    pub fn gerrit_username(&self) -> &str {
        self.user
            .gerrit_username
            .as_deref()
            .unwrap_or(&self.user.login)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [http]
        host = "127.0.0.1"
        port = 8080

        [user]
        login = "alice"

        [mail]
        dir = "/var/mail/alice"

        [github]
        token = "t0ken"
    "#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AppConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.user.login, "alice");
        assert_eq!(config.github.api_base, DEFAULT_GITHUB_API_BASE);
        assert_eq!(config.github.poll_floor_seconds, LIST_POLL_FLOOR_SECS);
        assert!(config.gerrit.is_none());
        assert_eq!(config.readstate.checkpoint_path, DEFAULT_CHECKPOINT_PATH);
        assert_eq!(config.logging.format, DEFAULT_LOG_FORMAT);
    }

    #[test]
    fn test_gerrit_username_defaults_to_login() {
        let config: AppConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.gerrit_username(), "alice");
    }

    #[test]
    fn test_gerrit_username_override() {
        let mut config: AppConfig = toml::from_str(MINIMAL).unwrap();
        config.user.gerrit_username = Some("asmith".to_string());
        assert_eq!(config.gerrit_username(), "asmith");
    }
}
