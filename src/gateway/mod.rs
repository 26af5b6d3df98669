//! Rate-limited cache gateway.
//!
//! The sole path to the upstream brokerage API. Reads go through a per-key
//! TTL cache; misses take a slot from the shared rate budget before touching
//! the network. Writes consume budget, retry transient failures with
//! exponential backoff and invalidate the account-shaped cache keys on
//! success. No lock is ever held across an upstream await.

pub mod cache;
pub mod rate_limit;
pub mod retry;

pub use cache::{CachedValue, ResourceKey, TtlCache};
pub use rate_limit::RateBudget;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::adapters::BrokerApi;
use crate::config::GatewayConfig;
use crate::domain::{
    AccountSnapshot, Bar, OrderIntent, OrderSnapshot, Portfolio, Position, Quote, Timeframe,
};
use crate::error::BrokerError;

enum ReadOp {
    Account,
    Positions,
    OpenOrders,
    Quote(String),
    Bars(String, Timeframe, usize),
}

pub struct Gateway {
    broker: Arc<dyn BrokerApi>,
    cache: TtlCache,
    budget: RateBudget,
    retry: RetryPolicy,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(broker: Arc<dyn BrokerApi>, config: GatewayConfig) -> Self {
        Self {
            broker,
            cache: TtlCache::new(),
            budget: RateBudget::per_minute(config.rate_limit_per_minute),
            retry: RetryPolicy::from_config(&config.retry),
            config,
        }
    }

    /// Requests currently counted against the rolling window.
    pub fn budget_in_window(&self) -> usize {
        self.budget.in_window()
    }

    // ==================== Reads ====================

    pub async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        match self
            .read_through(
                ResourceKey::Account,
                Duration::from_millis(self.config.ttl.account_ttl_ms),
                ReadOp::Account,
            )
            .await?
        {
            CachedValue::Account(account) => Ok(account),
            _ => unreachable!("account key holds account value"),
        }
    }

    pub async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        match self
            .read_through(
                ResourceKey::Positions,
                Duration::from_millis(self.config.ttl.positions_ttl_ms),
                ReadOp::Positions,
            )
            .await?
        {
            CachedValue::Positions(positions) => Ok(positions),
            _ => unreachable!("positions key holds positions value"),
        }
    }

    pub async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        match self
            .read_through(
                ResourceKey::OpenOrders,
                Duration::from_millis(self.config.ttl.open_orders_ttl_ms),
                ReadOp::OpenOrders,
            )
            .await?
        {
            CachedValue::OpenOrders(orders) => Ok(orders),
            _ => unreachable!("orders key holds orders value"),
        }
    }

    pub async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        match self
            .read_through(
                ResourceKey::Quote(symbol.to_string()),
                Duration::from_millis(self.config.ttl.quote_ttl_ms),
                ReadOp::Quote(symbol.to_string()),
            )
            .await?
        {
            CachedValue::Quote(quote) => Ok(quote),
            _ => unreachable!("quote key holds quote value"),
        }
    }

    pub async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        match self
            .read_through(
                ResourceKey::Bars(symbol.to_string(), timeframe),
                Duration::from_secs(self.config.ttl.bars_ttl_secs),
                ReadOp::Bars(symbol.to_string(), timeframe, limit),
            )
            .await?
        {
            CachedValue::Bars(bars) => Ok(bars),
            _ => unreachable!("bars key holds bars value"),
        }
    }

    /// Account plus positions, the view risk evaluation works from.
    pub async fn portfolio(&self) -> Result<Portfolio, BrokerError> {
        let account = self.account().await?;
        let positions = self.positions().await?;
        Ok(Portfolio { account, positions })
    }

    /// Order status for reconciliation. Never cached: stale order state
    /// would defeat idempotent reconciliation. Still budgeted and retried.
    pub async fn get_order(&self, upstream_order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let broker = self.broker.clone();
        let id = upstream_order_id.to_string();
        self.call_upstream("get_order", move || {
            let broker = broker.clone();
            let id = id.clone();
            async move { broker.get_order(&id).await }
        })
        .await
    }

    // ==================== Writes ====================

    pub async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderSnapshot, BrokerError> {
        let broker = self.broker.clone();
        let intent = intent.clone();
        let snapshot = self
            .call_upstream("submit_order", move || {
                let broker = broker.clone();
                let intent = intent.clone();
                async move { broker.submit_order(&intent).await }
            })
            .await?;
        self.invalidate_account_state();
        Ok(snapshot)
    }

    pub async fn cancel_order(&self, upstream_order_id: &str) -> Result<(), BrokerError> {
        let broker = self.broker.clone();
        let id = upstream_order_id.to_string();
        self.call_upstream("cancel_order", move || {
            let broker = broker.clone();
            let id = id.clone();
            async move { broker.cancel_order(&id).await }
        })
        .await?;
        self.invalidate_account_state();
        Ok(())
    }

    pub async fn replace_order(
        &self,
        upstream_order_id: &str,
        qty: Option<Decimal>,
        limit_price: Option<Decimal>,
    ) -> Result<OrderSnapshot, BrokerError> {
        let broker = self.broker.clone();
        let id = upstream_order_id.to_string();
        let snapshot = self
            .call_upstream("replace_order", move || {
                let broker = broker.clone();
                let id = id.clone();
                async move { broker.replace_order(&id, qty, limit_price).await }
            })
            .await?;
        self.invalidate_account_state();
        Ok(snapshot)
    }

    // ==================== Internals ====================

    /// A successful write makes account-shaped reads stale; quote and bar
    /// caches are left alone, their short TTLs already bound staleness.
    fn invalidate_account_state(&self) {
        self.cache.invalidate(&ResourceKey::Positions);
        self.cache.invalidate(&ResourceKey::OpenOrders);
        self.cache.invalidate(&ResourceKey::Account);
    }

    async fn read_through(
        &self,
        key: ResourceKey,
        ttl: Duration,
        op: ReadOp,
    ) -> Result<CachedValue, BrokerError> {
        loop {
            if let Some(value) = self.cache.get(&key) {
                debug!(key = %key, "cache hit");
                return Ok(value);
            }
            if self.cache.begin_fetch(&key) {
                break;
            }
            // Another task is fetching this key; wait and re-check.
            self.cache.wait_for_fetch(&key).await;
        }

        let result = self.fetch(&op).await;
        if let Ok(value) = &result {
            self.cache.insert(key.clone(), value.clone(), ttl);
        }
        self.cache.end_fetch(&key);
        result
    }

    async fn fetch(&self, op: &ReadOp) -> Result<CachedValue, BrokerError> {
        let broker = self.broker.clone();
        match op {
            ReadOp::Account => {
                self.call_upstream("account", move || {
                    let broker = broker.clone();
                    async move { broker.account().await.map(CachedValue::Account) }
                })
                .await
            }
            ReadOp::Positions => {
                self.call_upstream("positions", move || {
                    let broker = broker.clone();
                    async move { broker.positions().await.map(CachedValue::Positions) }
                })
                .await
            }
            ReadOp::OpenOrders => {
                self.call_upstream("open_orders", move || {
                    let broker = broker.clone();
                    async move { broker.open_orders().await.map(CachedValue::OpenOrders) }
                })
                .await
            }
            ReadOp::Quote(symbol) => {
                let symbol = symbol.clone();
                self.call_upstream("quote", move || {
                    let broker = broker.clone();
                    let symbol = symbol.clone();
                    async move { broker.quote(&symbol).await.map(CachedValue::Quote) }
                })
                .await
            }
            ReadOp::Bars(symbol, timeframe, limit) => {
                let symbol = symbol.clone();
                let timeframe = *timeframe;
                let limit = *limit;
                self.call_upstream("bars", move || {
                    let broker = broker.clone();
                    let symbol = symbol.clone();
                    async move {
                        broker
                            .bars(&symbol, timeframe, limit)
                            .await
                            .map(CachedValue::Bars)
                    }
                })
                .await
            }
        }
    }

    /// One budgeted, deadline-bounded upstream call with bounded retry.
    /// Transient failures back off and try again; auth, forbidden and
    /// validation failures return immediately.
    async fn call_upstream<T, F, Fut>(&self, op: &str, f: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.budget.acquire(self.config.budget_wait()).await?;

            let result = match tokio::time::timeout(self.config.request_timeout(), f()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(format!(
                    "{} exceeded {:?}",
                    op,
                    self.config.request_timeout()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.retry.has_more_attempts(attempt) => {
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(op, attempt, error = %err, ?delay, "transient upstream failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(op, attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
