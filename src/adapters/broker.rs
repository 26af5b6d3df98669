use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{
    AccountSnapshot, Bar, OrderIntent, OrderSnapshot, Position, Quote, Timeframe,
};
use crate::error::BrokerError;

/// The upstream brokerage REST boundary.
///
/// Everything the engine knows about the broker goes through this trait; the
/// rate-limited gateway owns the only instance and no other component holds a
/// direct reference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError>;

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderSnapshot, BrokerError>;

    async fn cancel_order(&self, upstream_order_id: &str) -> Result<(), BrokerError>;

    async fn replace_order(
        &self,
        upstream_order_id: &str,
        qty: Option<Decimal>,
        limit_price: Option<Decimal>,
    ) -> Result<OrderSnapshot, BrokerError>;

    async fn get_order(&self, upstream_order_id: &str) -> Result<OrderSnapshot, BrokerError>;

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError>;
}
