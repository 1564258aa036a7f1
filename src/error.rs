use thiserror::Error;

/// Main error type for the alert service
#[derive(Error, Debug)]
pub enum SpikeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Persistence write failed: {0}")]
    PersistenceWrite(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Market data fetch failed: {0}")]
    MarketFetch(String),

    #[error("Notification delivery failed to {chat_id}: {reason}")]
    NotificationDelivery { chat_id: i64, reason: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Tier errors
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Invalid expiry for user {user_id}: {value}")]
    ExpiryParse { user_id: i64, value: String },

    #[error("Restart inconsistency: {0}")]
    RestartInconsistency(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SpikeError {
    /// Whether a market request error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            SpikeError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.status().is_some(),
            SpikeError::MarketFetch(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for SpikeError
pub type Result<T> = std::result::Result<T, SpikeError>;
