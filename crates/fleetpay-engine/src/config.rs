//! # Engine Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FLEETPAY_DB_PATH=/var/lib/fleetpay/fleetpay.db                     │
//! │     FLEETPAY_PROCESSOR_API_KEY=sk_live_...                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fleetpay/fleetpay.toml (Linux)                           │
//! │     or an explicit path                                                │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "fleetpay.db"
//! max_connections = 8
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8080
//! admin_token = "..."
//!
//! [processor]
//! base_url = "https://api.stripe.com"
//! api_key = "sk_test_..."
//! timeout_ms = 10000
//! max_attempts = 3
//!
//! [webhook]
//! signing_secret = "whsec_..."
//! tolerance_secs = 300
//! max_retries = 8
//!
//! [settlement]
//! hold_window_days = 7
//! reconcile_interval_secs = 30
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits for the lock before failing (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fleetpay.db")
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the `/admin` routes. Unset disables them.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            admin_token: None,
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Processor Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Root of the processor's REST API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Secret API key. Required.
    #[serde(default)]
    pub api_key: String,

    /// Per-call timeout (milliseconds). A call that hits it has an unknown
    /// outcome.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per call for retryable failures, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            base_url: default_base_url(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ProcessorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Webhook Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Shared secret for `Processor-Signature`. Required.
    #[serde(default)]
    pub signing_secret: String,

    /// Maximum age of a signed timestamp (seconds).
    #[serde(default = "default_tolerance")]
    pub tolerance_secs: u64,

    /// Failed deliveries before an event goes to the operator queue.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_retry")]
    pub initial_retry_secs: u64,

    #[serde(default = "default_max_retry")]
    pub max_retry_secs: u64,

    /// Never-attempted pending events older than this are picked up by the
    /// worker (left behind by a crash between receipt and processing).
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Events handled per worker tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Processed events older than this are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_tolerance() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    8
}

fn default_initial_retry() -> u64 {
    30
}

fn default_max_retry() -> u64 {
    3600
}

fn default_stale_after() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    50
}

fn default_retention_days() -> u32 {
    30
}

impl Default for WebhookSettings {
    fn default() -> Self {
        WebhookSettings {
            signing_secret: String::new(),
            tolerance_secs: default_tolerance(),
            max_retries: default_max_retries(),
            initial_retry_secs: default_initial_retry(),
            max_retry_secs: default_max_retry(),
            stale_after_secs: default_stale_after(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
        }
    }
}

impl WebhookSettings {
    /// Delay before retry number `retry_count` (1-based): 30s, 60s, 120s, …
    /// capped at `max_retry_secs`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let cap = Duration::from_secs(self.max_retry_secs);
        let initial = Duration::from_secs(self.initial_retry_secs).min(cap);
        let mut schedule = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: cap,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        // The schedule is flat once it reaches the cap.
        for _ in 1..retry_count.clamp(1, 32) {
            schedule.next_backoff();
        }
        let delay = schedule.next_backoff().unwrap_or(cap);
        Duration::from_secs(delay.as_secs())
    }
}

// =============================================================================
// Settlement Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSettings {
    /// How long a card authorization stays capturable.
    #[serde(default = "default_hold_window_days")]
    pub hold_window_days: i64,

    /// Worker tick (seconds).
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// In-flight attempts older than this are treated as unknown.
    #[serde(default = "default_in_flight_timeout")]
    pub in_flight_timeout_secs: u64,

    /// Unknown attempts reconciled per worker tick.
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch_size: u32,
}

fn default_hold_window_days() -> i64 {
    fleetpay_core::DEFAULT_HOLD_WINDOW_DAYS
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_in_flight_timeout() -> u64 {
    300
}

fn default_reconcile_batch() -> u32 {
    25
}

impl Default for SettlementSettings {
    fn default() -> Self {
        SettlementSettings {
            hold_window_days: default_hold_window_days(),
            reconcile_interval_secs: default_reconcile_interval(),
            in_flight_timeout_secs: default_in_flight_timeout(),
            reconcile_batch_size: default_reconcile_batch(),
        }
    }
}

impl SettlementSettings {
    pub fn hold_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.hold_window_days)
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub processor: ProcessorSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub settlement: SettlementSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fleetpay.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
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

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.api_key.is_empty() {
            return Err(ConfigError::MissingRequired("processor.api_key".into()));
        }
        if self.webhook.signing_secret.is_empty() {
            return Err(ConfigError::MissingRequired("webhook.signing_secret".into()));
        }

        let base = url::Url::parse(&self.processor.base_url)
            .map_err(|e| ConfigError::invalid("processor.base_url", e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "processor.base_url",
                "must start with http:// or https://",
            ));
        }

        if self.processor.timeout_ms == 0 {
            return Err(ConfigError::invalid("processor.timeout_ms", "must be greater than 0"));
        }
        if self.processor.max_attempts == 0 {
            return Err(ConfigError::invalid("processor.max_attempts", "must be at least 1"));
        }
        if self.processor.initial_backoff_ms > self.processor.max_backoff_ms {
            return Err(ConfigError::invalid(
                "processor.initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        if self.webhook.initial_retry_secs == 0
            || self.webhook.initial_retry_secs > self.webhook.max_retry_secs
        {
            return Err(ConfigError::invalid(
                "webhook.initial_retry_secs",
                "must be positive and not exceed max_retry_secs",
            ));
        }
        if self.webhook.batch_size == 0 {
            return Err(ConfigError::invalid("webhook.batch_size", "must be greater than 0"));
        }
        if self.settlement.hold_window_days <= 0 {
            return Err(ConfigError::invalid(
                "settlement.hold_window_days",
                "must be greater than 0",
            ));
        }
        if self.settlement.reconcile_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "settlement.reconcile_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database.max_connections", "must be greater than 0"));
        }

        Ok(())
    }

    /// Applies `FLEETPAY_*` overrides read through `lookup`.
    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("FLEETPAY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }
        if let Some(max) = lookup("FLEETPAY_DB_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("FLEETPAY_DB_MAX_CONNECTIONS", &max)?;
        }
        if let Some(port) = lookup("FLEETPAY_PORT") {
            self.server.port = parse_env("FLEETPAY_PORT", &port)?;
        }
        if let Some(addr) = lookup("FLEETPAY_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(token) = lookup("FLEETPAY_ADMIN_TOKEN") {
            self.server.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(url) = lookup("FLEETPAY_PROCESSOR_BASE_URL") {
            debug!(url = %url, "Overriding processor URL from environment");
            self.processor.base_url = url;
        }
        if let Some(key) = lookup("FLEETPAY_PROCESSOR_API_KEY") {
            self.processor.api_key = key;
        }
        if let Some(timeout) = lookup("FLEETPAY_PROCESSOR_TIMEOUT_MS") {
            self.processor.timeout_ms = parse_env("FLEETPAY_PROCESSOR_TIMEOUT_MS", &timeout)?;
        }
        if let Some(secret) = lookup("FLEETPAY_WEBHOOK_SECRET") {
            self.webhook.signing_secret = secret;
        }
        if let Some(retries) = lookup("FLEETPAY_WEBHOOK_MAX_RETRIES") {
            self.webhook.max_retries = parse_env("FLEETPAY_WEBHOOK_MAX_RETRIES", &retries)?;
        }
        if let Some(days) = lookup("FLEETPAY_HOLD_WINDOW_DAYS") {
            self.settlement.hold_window_days = parse_env("FLEETPAY_HOLD_WINDOW_DAYS", &days)?;
        }

        Ok(())
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fleetpay", "fleetpay")
            .map(|dirs| dirs.config_dir().join("fleetpay.toml"))
    }

    /// Database pool configuration derived from `[database]`.
    pub fn db_config(&self) -> fleetpay_db::DbConfig {
        fleetpay_db::DbConfig::new(&self.database.path)
            .max_connections(self.database.max_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        warn!(name, value, "Unparseable environment override");
        ConfigError::invalid(name, format!("cannot parse '{}'", value))
    })
}
