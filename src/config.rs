use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// REST API endpoint for account/order access
    pub rest_url: String,
    /// WebSocket endpoint for market data
    pub ws_url: String,
    /// API key (also read from TRADEWIND_BROKER__API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
    /// API secret
    #[serde(default)]
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Upstream calls allowed per rolling minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
    /// How long a caller may wait for a free rate-budget slot
    #[serde(default = "default_budget_wait_ms")]
    pub budget_wait_ms: u64,
    /// Deadline for any single upstream request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cache TTLs per resource kind
    #[serde(default)]
    pub ttl: TtlConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit(),
            budget_wait_ms: default_budget_wait_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
            ttl: TtlConfig::default(),
        }
    }
}

fn default_rate_limit() -> usize {
    180
}

fn default_budget_wait_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction (0.25 = up to ±25% of the delay)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

/// Cache TTLs, tuned to data volatility: quotes and positions go stale in
/// seconds, historical bars in minutes.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_quote_ttl_ms")]
    pub quote_ttl_ms: u64,
    #[serde(default = "default_positions_ttl_ms")]
    pub positions_ttl_ms: u64,
    #[serde(default = "default_account_ttl_ms")]
    pub account_ttl_ms: u64,
    #[serde(default = "default_orders_ttl_ms")]
    pub open_orders_ttl_ms: u64,
    #[serde(default = "default_bars_ttl_secs")]
    pub bars_ttl_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            quote_ttl_ms: default_quote_ttl_ms(),
            positions_ttl_ms: default_positions_ttl_ms(),
            account_ttl_ms: default_account_ttl_ms(),
            open_orders_ttl_ms: default_orders_ttl_ms(),
            bars_ttl_secs: default_bars_ttl_secs(),
        }
    }
}

fn default_quote_ttl_ms() -> u64 {
    1_500
}

fn default_positions_ttl_ms() -> u64 {
    2_000
}

fn default_account_ttl_ms() -> u64 {
    5_000
}

fn default_orders_ttl_ms() -> u64 {
    2_000
}

fn default_bars_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler wakeups
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Ceiling on simultaneous in-flight strategy evaluations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_evaluations: usize,
    /// Consecutive evaluation failures before a strategy moves to ERROR
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Default order quantity when a strategy has no position-size fraction
    #[serde(default = "default_order_qty")]
    pub default_order_qty: Decimal,
    /// Seconds between open-order reconciliation polls
    #[serde(default = "default_order_poll_secs")]
    pub order_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_concurrent_evaluations: default_max_concurrent(),
            max_consecutive_failures: default_max_failures(),
            default_order_qty: default_order_qty(),
            order_poll_secs: default_order_poll_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_failures() -> u32 {
    3
}

fn default_order_qty() -> Decimal {
    Decimal::ONE
}

fn default_order_poll_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Bind address for the viewer WebSocket endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Outbound queue depth per downstream client
    #[serde(default = "default_client_queue")]
    pub client_queue_size: usize,
    /// Upstream reconnect attempts before the stream reports degraded
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,
    /// Base reconnect delay
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Keepalive ping interval on the upstream session
    #[serde(default = "default_ping_secs")]
    pub ping_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            client_queue_size: default_client_queue(),
            reconnect_max_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_delay_ms(),
            ping_interval_secs: default_ping_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_client_queue() -> usize {
    256
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_ping_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Enable dry run mode (paper broker, no real orders)
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    pub fn budget_wait(&self) -> Duration {
        Duration::from_millis(self.budget_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
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
            .set_default("dry_run.enabled", true)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEWIND_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            .add_source(
                Environment::with_prefix("TRADEWIND")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(dry_run: bool) -> Self {
        Self {
            broker: BrokerConfig {
                rest_url: "https://paper-api.example-broker.com".to_string(),
                ws_url: "wss://stream.example-broker.com/v2/iex".to_string(),
                api_key: None,
                api_secret: None,
            },
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            stream: StreamConfig::default(),
            dry_run: DryRunConfig { enabled: dry_run },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.gateway.rate_limit_per_minute == 0 {
            errors.push("gateway.rate_limit_per_minute must be positive".to_string());
        }

        if self.gateway.retry.max_attempts == 0 {
            errors.push("gateway.retry.max_attempts must be at least 1".to_string());
        }

        if self.gateway.retry.multiplier < 1.0 {
            errors.push("gateway.retry.multiplier must be >= 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.gateway.retry.jitter) {
            errors.push("gateway.retry.jitter must be within [0, 1]".to_string());
        }

        if self.scheduler.tick_secs == 0 {
            errors.push("scheduler.tick_secs must be positive".to_string());
        }

        if self.scheduler.max_concurrent_evaluations == 0 {
            errors.push("scheduler.max_concurrent_evaluations must be positive".to_string());
        }

        if self.scheduler.default_order_qty <= Decimal::ZERO {
            errors.push("scheduler.default_order_qty must be positive".to_string());
        }

        if self.scheduler.order_poll_secs == 0 {
            errors.push("scheduler.order_poll_secs must be positive".to_string());
        }

        if self.stream.client_queue_size == 0 {
            errors.push("stream.client_queue_size must be positive".to_string());
        }

        if !self.dry_run.enabled && (self.broker.api_key.is_none() || self.broker.api_secret.is_none()) {
            errors.push("broker.api_key and broker.api_secret are required outside dry run".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
