//! Deterministic in-process broker.
//!
//! Backs dry-run mode and the integration tests: market orders fill
//! immediately at the scripted quote, limit/stop orders rest until a test
//! forces a fill, and every upstream-shaped call is counted so tests can
//! assert on cache and rate-budget behavior.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    AccountSnapshot, Bar, OrderIntent, OrderSnapshot, OrderStatus, OrderType, Position, Quote,
    Timeframe,
};
use crate::error::BrokerError;

use super::broker::BrokerApi;

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    daily_realized_pnl: Decimal,
    positions: HashMap<String, Position>,
    /// upstream id -> snapshot
    orders: HashMap<String, OrderSnapshot>,
    /// client id -> upstream id, for broker-side idempotency
    client_index: HashMap<String, String>,
    bars: HashMap<String, Vec<Bar>>,
    quotes: HashMap<String, Quote>,
    /// scripted failures consumed one per call
    pending_failures: Vec<BrokerError>,
    /// artificial latency applied to every call
    call_delay: Option<std::time::Duration>,
}

pub struct PaperBroker {
    state: Mutex<PaperState>,
    calls: AtomicU64,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        let state = PaperState {
            cash: Decimal::from(100_000),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            calls: AtomicU64::new(0),
        }
    }

    /// Total upstream-shaped calls issued so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Script the bars returned for a symbol.
    pub async fn set_bars(&self, symbol: &str, closes: &[Decimal]) {
        let now = Utc::now();
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, close)| Bar {
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: Decimal::from(1_000),
                timestamp: now - Duration::minutes((closes.len() - i) as i64),
            })
            .collect();
        self.state.lock().await.bars.insert(symbol.to_string(), bars);
    }

    /// Script the quote returned for a symbol.
    pub async fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let quote = Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: (bid + ask) / Decimal::TWO,
            timestamp: Utc::now(),
        };
        self.state.lock().await.quotes.insert(symbol.to_string(), quote);
    }

    pub async fn set_daily_realized_pnl(&self, pnl: Decimal) {
        self.state.lock().await.daily_realized_pnl = pnl;
    }

    pub async fn set_position(&self, symbol: &str, qty: Decimal, avg_entry: Decimal) {
        let position = Position {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price: avg_entry,
            market_value: qty * avg_entry,
            unrealized_pnl: Decimal::ZERO,
        };
        self.state
            .lock()
            .await
            .positions
            .insert(symbol.to_string(), position);
    }

    /// Stretch every call by the given latency, for tests that need an
    /// operation to span a scheduling pass.
    pub async fn set_call_delay(&self, delay: std::time::Duration) {
        self.state.lock().await.call_delay = Some(delay);
    }

    /// Queue failures; each subsequent call consumes one before succeeding.
    pub async fn inject_failures(&self, error: BrokerError, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.pending_failures.push(error.clone());
        }
    }

    /// Force a resting order to fill, as if the market moved through it.
    pub async fn fill_order(&self, upstream_order_id: &str, price: Decimal, qty: Decimal) {
        let mut state = self.state.lock().await;
        if let Some(snapshot) = state.orders.get_mut(upstream_order_id) {
            snapshot.status = OrderStatus::Filled;
            snapshot.filled_qty = qty;
            snapshot.avg_fill_price = Some(price);
            snapshot.updated_at = Utc::now();
        }
    }

    async fn record_call(&self) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let mut state = self.state.lock().await;
            (state.call_delay, state.pending_failures.pop())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn default_quote(symbol: &str) -> Quote {
        // Stable synthetic price derived from the symbol so repeated runs
        // see identical data.
        let seed: u32 = symbol.bytes().map(u32::from).sum();
        let last = Decimal::from(50 + (seed % 400));
        Quote {
            symbol: symbol.to_string(),
            bid: last - Decimal::new(5, 2),
            ask: last + Decimal::new(5, 2),
            last,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl BrokerApi for PaperBroker {
    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        let position_value: Decimal = state.positions.values().map(|p| p.market_value).sum();
        Ok(AccountSnapshot {
            cash: state.cash,
            buying_power: state.cash * Decimal::TWO,
            equity: state.cash + position_value,
            daily_realized_pnl: state.daily_realized_pnl,
            timestamp: Utc::now(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        Ok(state.positions.values().cloned().collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        Ok(state
            .quotes
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Self::default_quote(symbol)))
    }

    async fn bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderSnapshot, BrokerError> {
        self.record_call().await?;
        let mut state = self.state.lock().await;

        // Broker-side idempotency on the client order id: a resubmission
        // returns the original order instead of creating a second one.
        if let Some(upstream_id) = state.client_index.get(&intent.client_order_id) {
            let existing = state.orders.get(upstream_id).cloned();
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }

        let fill_price = state
            .quotes
            .get(&intent.symbol)
            .map(|q| q.last)
            .unwrap_or_else(|| Self::default_quote(&intent.symbol).last);

        let qty = intent
            .qty
            .or_else(|| intent.notional.map(|n| n / fill_price))
            .unwrap_or(Decimal::ZERO);

        let upstream_id = Uuid::new_v4().to_string();
        let filled = intent.order_type == OrderType::Market;
        let snapshot = OrderSnapshot {
            upstream_order_id: upstream_id.clone(),
            client_order_id: intent.client_order_id.clone(),
            status: if filled {
                OrderStatus::Filled
            } else {
                OrderStatus::New
            },
            filled_qty: if filled { qty } else { Decimal::ZERO },
            avg_fill_price: if filled { Some(fill_price) } else { None },
            updated_at: Utc::now(),
        };

        if filled {
            let signed_qty = match intent.side {
                crate::domain::OrderSide::Buy => qty,
                crate::domain::OrderSide::Sell => -qty,
            };
            state.cash -= signed_qty * fill_price;
            let entry = state
                .positions
                .entry(intent.symbol.clone())
                .or_insert_with(|| Position {
                    symbol: intent.symbol.clone(),
                    qty: Decimal::ZERO,
                    avg_entry_price: fill_price,
                    market_value: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                });
            entry.qty += signed_qty;
            entry.market_value = entry.qty * fill_price;
            if entry.qty.is_zero() {
                state.positions.remove(&intent.symbol);
            }
        }

        state
            .client_index
            .insert(intent.client_order_id.clone(), upstream_id.clone());
        state.orders.insert(upstream_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn cancel_order(&self, upstream_order_id: &str) -> Result<(), BrokerError> {
        self.record_call().await?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(upstream_order_id) {
            Some(snapshot) if snapshot.status.is_active() => {
                snapshot.status = OrderStatus::Canceled;
                snapshot.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(BrokerError::Validation {
                status: 404,
                message: format!("order {} not found", upstream_order_id),
            }),
        }
    }

    async fn replace_order(
        &self,
        upstream_order_id: &str,
        qty: Option<Decimal>,
        _limit_price: Option<Decimal>,
    ) -> Result<OrderSnapshot, BrokerError> {
        self.record_call().await?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(upstream_order_id) {
            Some(snapshot) if snapshot.status.is_active() => {
                if let Some(qty) = qty {
                    if snapshot.filled_qty > qty {
                        return Err(BrokerError::Validation {
                            status: 422,
                            message: "cannot replace below filled qty".to_string(),
                        });
                    }
                }
                snapshot.updated_at = Utc::now();
                Ok(snapshot.clone())
            }
            Some(_) => Err(BrokerError::Validation {
                status: 422,
                message: "order is not open".to_string(),
            }),
            None => Err(BrokerError::Validation {
                status: 404,
                message: format!("order {} not found", upstream_order_id),
            }),
        }
    }

    async fn get_order(&self, upstream_order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        state
            .orders
            .get(upstream_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Validation {
                status: 404,
                message: format!("order {} not found", upstream_order_id),
            })
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        self.record_call().await?;
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_orders_fill_immediately() {
        let broker = PaperBroker::new();
        broker.set_quote("AAPL", dec!(189.95), dec!(190.05)).await;

        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));
        let snapshot = broker.submit_order(&intent).await.unwrap();

        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.filled_qty, dec!(10));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, dec!(10));
    }

    #[tokio::test]
    async fn duplicate_client_order_id_returns_existing() {
        let broker = PaperBroker::new();
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));

        let first = broker.submit_order(&intent).await.unwrap();
        let second = broker.submit_order(&intent).await.unwrap();

        assert_eq!(first.upstream_order_id, second.upstream_order_id);
        // Only one position entry of qty 5, not 10
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].qty, dec!(5));
    }

    #[tokio::test]
    async fn injected_failures_consumed_in_order() {
        let broker = PaperBroker::new();
        broker
            .inject_failures(BrokerError::from_status(503, "unavailable"), 2)
            .await;

        assert!(broker.account().await.is_err());
        assert!(broker.account().await.is_err());
        assert!(broker.account().await.is_ok());
    }

    #[tokio::test]
    async fn limit_orders_rest_until_filled() {
        let broker = PaperBroker::new();
        let intent = OrderIntent::limit("MSFT", OrderSide::Buy, dec!(3), dec!(400));
        let snapshot = broker.submit_order(&intent).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::New);

        broker
            .fill_order(&snapshot.upstream_order_id, dec!(399.50), dec!(3))
            .await;
        let after = broker.get_order(&snapshot.upstream_order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Filled);
    }
}
