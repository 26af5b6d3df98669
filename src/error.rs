use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum TradewindError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Upstream brokerage errors (already classified by the gateway)
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    // Signal computation errors
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Strategy not found: {0}")]
    StrategyNotFound(uuid::Uuid),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TradewindError
pub type Result<T> = std::result::Result<T, TradewindError>;

/// Classified upstream brokerage failures.
///
/// Every error coming back from the broker boundary is normalized into one of
/// these variants so callers can decide between retrying, backing off and
/// giving up without inspecting HTTP details.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Transient failures are eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::RateLimited(_)
                | BrokerError::Server { .. }
                | BrokerError::Timeout(_)
                | BrokerError::Transport(_)
        )
    }

    /// Auth and forbidden failures are never retried; they move the affected
    /// strategy toward ERROR instead.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, BrokerError::Auth(_) | BrokerError::Forbidden(_))
    }

    /// Classify an HTTP status code into a broker error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => BrokerError::Auth(message),
            403 => BrokerError::Forbidden(message),
            429 => BrokerError::RateLimited(message),
            s if s >= 500 => BrokerError::Server { status: s, message },
            s => BrokerError::Validation { status: s, message },
        }
    }
}

/// Specific error types for signal computation
#[derive(Error, Debug, Clone)]
pub enum MonitorError {
    #[error("Insufficient history for {symbol}: need {required} bars, have {available}")]
    InsufficientHistory {
        symbol: String,
        required: usize,
        available: usize,
    },

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}
