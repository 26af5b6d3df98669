use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TradewindError};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Good for the trading day
    Day,
    /// Good Till Cancelled
    Gtc,
    /// Immediate Or Cancel
    Ioc,
    /// Fill Or Kill
    Fok,
}

/// Order status mirroring the upstream broker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted upstream, not yet filled
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// What the engine wants to do, before the broker has seen it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Client-assigned id; retried submissions reuse it so the broker never
    /// sees the same intent twice.
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub strategy_id: Option<Uuid>,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty: Some(qty),
            notional: None,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            strategy_id: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        qty: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            qty: Some(qty),
            notional: None,
            limit_price: Some(limit_price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            strategy_id: None,
        }
    }

    pub fn stop(
        symbol: impl Into<String>,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Stop,
            qty: Some(qty),
            notional: None,
            limit_price: None,
            stop_price: Some(stop_price),
            time_in_force: TimeInForce::Gtc,
            strategy_id: None,
        }
    }

    pub fn with_strategy(mut self, strategy_id: Uuid) -> Self {
        self.strategy_id = Some(strategy_id);
        self
    }

    /// Validate required fields before the intent goes anywhere near the
    /// broker. Validation failures are never retried.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(TradewindError::Validation("symbol is required".into()));
        }

        match (self.qty, self.notional) {
            (None, None) => {
                return Err(TradewindError::Validation(
                    "either qty or notional is required".into(),
                ))
            }
            (Some(qty), _) if qty <= Decimal::ZERO => {
                return Err(TradewindError::Validation("qty must be positive".into()))
            }
            (_, Some(notional)) if notional <= Decimal::ZERO => {
                return Err(TradewindError::Validation(
                    "notional must be positive".into(),
                ))
            }
            _ => {}
        }

        match self.order_type {
            OrderType::Limit if self.limit_price.is_none() => {
                return Err(TradewindError::Validation(
                    "limit order requires limit_price".into(),
                ))
            }
            OrderType::Stop if self.stop_price.is_none() => {
                return Err(TradewindError::Validation(
                    "stop order requires stop_price".into(),
                ))
            }
            OrderType::StopLimit if self.limit_price.is_none() || self.stop_price.is_none() => {
                return Err(TradewindError::Validation(
                    "stop-limit order requires limit_price and stop_price".into(),
                ))
            }
            _ => {}
        }

        if let Some(price) = self.limit_price {
            if price <= Decimal::ZERO {
                return Err(TradewindError::Validation(
                    "limit_price must be positive".into(),
                ));
            }
        }
        if let Some(price) = self.stop_price {
            if price <= Decimal::ZERO {
                return Err(TradewindError::Validation(
                    "stop_price must be positive".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Upstream view of an order, as returned by status polls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub upstream_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Order tracked locally; created on submission, reconciled from upstream
/// snapshots, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub upstream_order_id: Option<String>,
    pub strategy_id: Option<Uuid>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn from_intent(intent: &OrderIntent, snapshot: &OrderSnapshot) -> Self {
        let now = Utc::now();
        let mut order = Self {
            client_order_id: intent.client_order_id.clone(),
            upstream_order_id: Some(snapshot.upstream_order_id.clone()),
            strategy_id: intent.strategy_id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            qty: intent.qty,
            notional: intent.notional,
            limit_price: intent.limit_price,
            stop_price: intent.stop_price,
            status: snapshot.status,
            filled_qty: snapshot.filled_qty,
            avg_fill_price: snapshot.avg_fill_price,
            submitted_at: now,
            updated_at: now,
            filled_at: None,
        };
        if snapshot.status == OrderStatus::Filled {
            order.filled_at = Some(now);
        }
        order
    }

    /// Apply an upstream snapshot. Idempotent: applying the same snapshot
    /// twice returns false the second time and changes nothing.
    pub fn apply_snapshot(&mut self, snapshot: &OrderSnapshot) -> bool {
        let changed = self.status != snapshot.status
            || self.filled_qty != snapshot.filled_qty
            || self.avg_fill_price != snapshot.avg_fill_price
            || self.upstream_order_id.as_deref() != Some(snapshot.upstream_order_id.as_str());

        if !changed {
            return false;
        }

        self.upstream_order_id = Some(snapshot.upstream_order_id.clone());
        self.status = snapshot.status;
        self.filled_qty = snapshot.filled_qty;
        self.avg_fill_price = snapshot.avg_fill_price;
        self.updated_at = Utc::now();
        if snapshot.status == OrderStatus::Filled && self.filled_at.is_none() {
            self.filled_at = Some(self.updated_at);
        }
        true
    }
}

/// Bracket submission: entry plus linked take-profit and stop-loss
#[derive(Debug, Clone)]
pub struct BracketIntent {
    pub entry: OrderIntent,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
}

/// Tracks the three legs of a bracket for one-cancels-other bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketState {
    pub entry_id: String,
    pub take_profit_id: String,
    pub stop_loss_id: String,
}

impl BracketState {
    /// Given a filled exit leg, the one that must be canceled.
    pub fn other_exit(&self, filled_client_id: &str) -> Option<&str> {
        if filled_client_id == self.take_profit_id {
            Some(self.stop_loss_id.as_str())
        } else if filled_client_id == self.stop_loss_id {
            Some(self.take_profit_id.as_str())
        } else {
            None
        }
    }

    pub fn is_exit(&self, client_id: &str) -> bool {
        client_id == self.take_profit_id || client_id == self.stop_loss_id
    }
}
