use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub tiers: TierSettings,
    #[serde(default)]
    pub market: MarketSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (default: 8080)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    /// Seconds between monitor cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Accumulated changes that force a history flush
    #[serde(default = "default_save_threshold")]
    pub save_threshold: usize,
    /// Cycles after which any pending change is flushed
    #[serde(default = "default_max_save_delay")]
    pub max_save_delay: usize,
    /// Addresses per market request
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Admin-log entries per batch task
    #[serde(default = "default_notification_batch_size")]
    pub notification_batch_size: usize,
    #[serde(default = "default_max_concurrent_notifications")]
    pub max_concurrent_notifications: usize,
    #[serde(default = "default_history_ring_depth")]
    pub history_ring_depth: usize,
    /// Seconds between "still monitoring" reminder passes
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_save_threshold() -> usize {
    50
}

fn default_max_save_delay() -> usize {
    5
}

fn default_chunk_size() -> usize {
    30
}

fn default_notification_batch_size() -> usize {
    20
}

fn default_max_concurrent_notifications() -> usize {
    5
}

fn default_history_ring_depth() -> usize {
    3
}

fn default_reminder_interval() -> u64 {
    12 * 3600
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            save_threshold: default_save_threshold(),
            max_save_delay: default_max_save_delay(),
            chunk_size: default_chunk_size(),
            notification_batch_size: default_notification_batch_size(),
            max_concurrent_notifications: default_max_concurrent_notifications(),
            history_ring_depth: default_history_ring_depth(),
            reminder_interval_secs: default_reminder_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierSettings {
    /// Seconds between expiry scheduler passes (default: 2 days)
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval_secs: u64,
    /// Sleep after a failed pass before retrying
    #[serde(default = "default_expiry_error_sleep")]
    pub expiry_error_sleep_secs: u64,
    #[serde(default = "default_expiry_batch_size")]
    pub expiry_batch_size: usize,
    /// User that always gets the super admin limit
    #[serde(default)]
    pub super_admin_id: i64,
    /// Threshold seeded for users without one (percent)
    #[serde(default = "default_threshold_pct")]
    pub default_threshold_pct: f64,
}

fn default_expiry_check_interval() -> u64 {
    2 * 24 * 3600
}

fn default_expiry_error_sleep() -> u64 {
    3600
}

fn default_expiry_batch_size() -> usize {
    50
}

fn default_threshold_pct() -> f64 {
    5.0
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            expiry_check_interval_secs: default_expiry_check_interval(),
            expiry_error_sleep_secs: default_expiry_error_sleep(),
            expiry_batch_size: default_expiry_batch_size(),
            super_admin_id: 0,
            default_threshold_pct: default_threshold_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketSettings {
    /// Market data REST base URL
    #[serde(default = "default_market_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per chunk, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt; doubles each time
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_market_url() -> String {
    "https://api.dexscreener.com".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2000
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            base_url: default_market_url(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    /// Bot API root
    #[serde(default = "default_chat_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub bot_token: String,
    /// Chat receiving a copy of every user alert
    #[serde(default)]
    pub spike_log_chat_id: Option<i64>,
    /// Chat receiving delivery failures
    #[serde(default)]
    pub error_log_chat_id: Option<i64>,
    #[serde(default)]
    pub info_log_chat_id: Option<i64>,
}

fn default_chat_api_url() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_url: default_chat_api_url(),
            bot_token: String::new(),
            spike_log_chat_id: None,
            error_log_chat_id: None,
            info_log_chat_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file; console only when unset
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("monitor.poll_interval_secs", default_poll_interval())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SPIKEWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // SPIKEWATCH__MONITOR__SAVE_THRESHOLD, SPIKEWATCH__CHAT__BOT_TOKEN, ...
            .add_source(
                Environment::with_prefix("SPIKEWATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.is_empty() {
            errors.push("database.url is required".to_string());
        }

        if self.chat.bot_token.is_empty() {
            errors.push("chat.bot_token is required".to_string());
        }

        if self.monitor.poll_interval_secs == 0 {
            errors.push("monitor.poll_interval_secs must be positive".to_string());
        }

        if self.monitor.chunk_size == 0 || self.monitor.chunk_size > 30 {
            errors.push("monitor.chunk_size must be between 1 and 30".to_string());
        }

        if self.monitor.max_concurrent_notifications == 0 {
            errors.push("monitor.max_concurrent_notifications must be positive".to_string());
        }

        if self.monitor.history_ring_depth == 0 {
            errors.push("monitor.history_ring_depth must be positive".to_string());
        }

        if self.tiers.default_threshold_pct < 0.0 || !self.tiers.default_threshold_pct.is_finite() {
            errors.push("tiers.default_threshold_pct must be a non-negative number".to_string());
        }

        if self.market.max_retries == 0 {
            errors.push("market.max_retries must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings::default(),
            tiers: TierSettings::default(),
            market: MarketSettings::default(),
            chat: ChatSettings::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            health_port: Some(8080),
        }
    }
}
