//! Order Execution Gateway
//!
//! The only path from a signal to the broker. Tracks every order it has
//! submitted by client order id, reconciles upstream snapshots
//! idempotently, and keeps one-cancels-other bookkeeping for bracket
//! submissions.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::domain::{
    BracketIntent, BracketState, Order, OrderIntent, OrderSnapshot, OrderStatus, Signal,
    TimeInForce,
};
use crate::error::{Result, TradewindError};
use crate::gateway::Gateway;
use crate::store::StrategyStore;

pub struct OrderExecutor {
    gateway: Arc<Gateway>,
    store: Arc<dyn StrategyStore>,
    /// client order id -> local order
    orders: RwLock<HashMap<String, Order>>,
    /// upstream order id -> client order id
    upstream_index: RwLock<HashMap<String, String>>,
    brackets: RwLock<Vec<BracketState>>,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<Gateway>, store: Arc<dyn StrategyStore>) -> Self {
        Self {
            gateway,
            store,
            orders: RwLock::new(HashMap::new()),
            upstream_index: RwLock::new(HashMap::new()),
            brackets: RwLock::new(Vec::new()),
        }
    }

    /// Submit an intent. Validation failures return without touching the
    /// broker; a client order id already tracked returns the existing order
    /// instead of submitting again.
    pub async fn submit(&self, intent: OrderIntent) -> Result<Order> {
        intent.validate()?;

        if let Some(existing) = self.orders.read().await.get(&intent.client_order_id) {
            warn!(
                client_order_id = %intent.client_order_id,
                "duplicate submission suppressed"
            );
            return Ok(existing.clone());
        }

        let snapshot = self.gateway.submit_order(&intent).await?;
        let order = Order::from_intent(&intent, &snapshot);

        self.orders
            .write()
            .await
            .insert(order.client_order_id.clone(), order.clone());
        self.upstream_index
            .write()
            .await
            .insert(snapshot.upstream_order_id.clone(), order.client_order_id.clone());
        self.store.record_order(&order).await?;

        info!(
            client_order_id = %order.client_order_id,
            upstream_order_id = %snapshot.upstream_order_id,
            symbol = %order.symbol,
            side = %order.side,
            status = ?order.status,
            "order submitted"
        );
        Ok(order)
    }

    /// Submit the order produced by a signal, marking the signal executed
    /// first. A signal already marked executed is refused so one signal can
    /// never produce two orders.
    pub async fn submit_for_signal(&self, intent: OrderIntent, signal: &mut Signal) -> Result<Order> {
        if !signal.mark_executed() {
            return Err(TradewindError::Validation(format!(
                "signal {} already executed",
                signal.id
            )));
        }
        self.store.update_signal(signal).await?;
        self.submit(intent).await
    }

    /// Cancel by client order id and reconcile the resulting state.
    pub async fn cancel(&self, client_order_id: &str) -> Result<Order> {
        let upstream_id = self.upstream_id_for(client_order_id).await?;
        self.gateway.cancel_order(&upstream_id).await?;

        let snapshot = self.gateway.get_order(&upstream_id).await?;
        self.reconcile(&snapshot).await?;
        self.order(client_order_id)
            .await
            .ok_or_else(|| TradewindError::OrderNotFound(client_order_id.to_string()))
    }

    /// Replace quantity or limit price of a working order.
    pub async fn replace(
        &self,
        client_order_id: &str,
        qty: Option<Decimal>,
        limit_price: Option<Decimal>,
    ) -> Result<Order> {
        let upstream_id = self.upstream_id_for(client_order_id).await?;
        let snapshot = self.gateway.replace_order(&upstream_id, qty, limit_price).await?;

        // The broker may assign a new upstream id on replace
        self.upstream_index
            .write()
            .await
            .insert(snapshot.upstream_order_id.clone(), client_order_id.to_string());

        {
            let mut orders = self.orders.write().await;
            if let Some(order) = orders.get_mut(client_order_id) {
                if let Some(qty) = qty {
                    order.qty = Some(qty);
                }
                if let Some(price) = limit_price {
                    order.limit_price = Some(price);
                }
                order.apply_snapshot(&snapshot);
            }
        }
        let order = self
            .order(client_order_id)
            .await
            .ok_or_else(|| TradewindError::OrderNotFound(client_order_id.to_string()))?;
        self.store.update_order(&order).await?;
        Ok(order)
    }

    /// Cancel every tracked active order. Failures are logged and skipped so
    /// one stuck order cannot leave the rest working. Returns the number of
    /// successful cancels.
    pub async fn cancel_all(&self) -> usize {
        let active: Vec<String> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.status.is_active())
            .map(|o| o.client_order_id.clone())
            .collect();

        let mut canceled = 0;
        for client_id in active {
            match self.cancel(&client_id).await {
                Ok(_) => canceled += 1,
                Err(err) => warn!(client_order_id = %client_id, error = %err, "cancel failed"),
            }
        }
        canceled
    }

    /// Flatten part or all of one position with a market order. `pct` of
    /// None closes the whole position; returns None when there is nothing
    /// to close.
    pub async fn close_position(
        &self,
        symbol: &str,
        pct: Option<Decimal>,
    ) -> Result<Option<Order>> {
        let positions = self.gateway.positions().await?;
        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            return Ok(None);
        };

        let fraction = pct.unwrap_or(Decimal::ONE);
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(TradewindError::Validation(
                "close fraction must be in (0, 1]".into(),
            ));
        }

        let qty = (position.qty.abs() * fraction).round_dp(4);
        if qty.is_zero() {
            return Ok(None);
        }

        let side = if position.qty > Decimal::ZERO {
            crate::domain::OrderSide::Sell
        } else {
            crate::domain::OrderSide::Buy
        };
        let intent = OrderIntent::market(symbol, side, qty);
        let order = self.submit(intent).await?;
        Ok(Some(order))
    }

    /// Flatten everything. Per-symbol failures are logged and skipped.
    pub async fn close_all_positions(&self) -> Result<Vec<Order>> {
        let positions = self.gateway.positions().await?;
        let mut orders = Vec::new();
        for position in positions {
            match self.close_position(&position.symbol, None).await {
                Ok(Some(order)) => orders.push(order),
                Ok(None) => {}
                Err(err) => {
                    warn!(symbol = %position.symbol, error = %err, "close failed")
                }
            }
        }
        Ok(orders)
    }

    /// Submit a bracket: entry first, then the two exit legs with the same
    /// quantity on the opposite side. If an exit leg fails to submit, the
    /// already-placed legs are canceled best effort before the error is
    /// returned.
    pub async fn submit_bracket(&self, bracket: BracketIntent) -> Result<BracketState> {
        bracket.entry.validate()?;
        if bracket.take_profit_price <= Decimal::ZERO || bracket.stop_loss_price <= Decimal::ZERO {
            return Err(TradewindError::Validation(
                "bracket exit prices must be positive".into(),
            ));
        }
        let qty = bracket.entry.qty.ok_or_else(|| {
            TradewindError::Validation("bracket entry requires an explicit qty".into())
        })?;

        let entry = self.submit(bracket.entry.clone()).await?;
        let exit_side = bracket.entry.side.opposite();

        let mut take_profit = OrderIntent::limit(
            bracket.entry.symbol.clone(),
            exit_side,
            qty,
            bracket.take_profit_price,
        );
        take_profit.time_in_force = TimeInForce::Gtc;
        take_profit.strategy_id = bracket.entry.strategy_id;

        let tp_order = match self.submit(take_profit).await {
            Ok(order) => order,
            Err(err) => {
                self.cancel_best_effort(&entry.client_order_id).await;
                return Err(err);
            }
        };

        let mut stop_loss = OrderIntent::stop(
            bracket.entry.symbol.clone(),
            exit_side,
            qty,
            bracket.stop_loss_price,
        );
        stop_loss.time_in_force = TimeInForce::Gtc;
        stop_loss.strategy_id = bracket.entry.strategy_id;

        let sl_order = match self.submit(stop_loss).await {
            Ok(order) => order,
            Err(err) => {
                self.cancel_best_effort(&tp_order.client_order_id).await;
                self.cancel_best_effort(&entry.client_order_id).await;
                return Err(err);
            }
        };

        let state = BracketState {
            entry_id: entry.client_order_id,
            take_profit_id: tp_order.client_order_id,
            stop_loss_id: sl_order.client_order_id,
        };
        self.brackets.write().await.push(state.clone());
        info!(
            entry = %state.entry_id,
            take_profit = %state.take_profit_id,
            stop_loss = %state.stop_loss_id,
            "bracket placed"
        );
        Ok(state)
    }

    /// Apply an upstream snapshot to the tracked order. Returns true when
    /// anything changed; re-applying the same snapshot is a no-op. Fills and
    /// cancels trigger the bracket one-cancels-other rules.
    pub async fn reconcile(&self, snapshot: &OrderSnapshot) -> Result<bool> {
        let client_id = if !snapshot.client_order_id.is_empty() {
            snapshot.client_order_id.clone()
        } else {
            self.upstream_index
                .read()
                .await
                .get(&snapshot.upstream_order_id)
                .cloned()
                .ok_or_else(|| {
                    TradewindError::OrderNotFound(snapshot.upstream_order_id.clone())
                })?
        };

        let (changed, order) = {
            let mut orders = self.orders.write().await;
            let order = orders
                .get_mut(&client_id)
                .ok_or_else(|| TradewindError::OrderNotFound(client_id.clone()))?;
            (order.apply_snapshot(snapshot), order.clone())
        };

        if !changed {
            return Ok(false);
        }

        self.store.update_order(&order).await?;
        info!(
            client_order_id = %client_id,
            status = ?order.status,
            filled_qty = %order.filled_qty,
            "order reconciled"
        );

        match order.status {
            OrderStatus::Filled => self.on_fill(&client_id).await,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                self.on_dead_entry(&client_id).await
            }
            _ => {}
        }
        Ok(true)
    }

    /// Poll every tracked active order and reconcile what came back.
    /// Returns the number of orders whose state changed.
    pub async fn poll_open_orders(&self) -> Result<usize> {
        let active: Vec<(String, String)> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.status.is_active())
            .filter_map(|o| {
                o.upstream_order_id
                    .clone()
                    .map(|up| (o.client_order_id.clone(), up))
            })
            .collect();

        let mut changed = 0;
        for (client_id, upstream_id) in active {
            match self.gateway.get_order(&upstream_id).await {
                Ok(snapshot) => {
                    if self.reconcile(&snapshot).await? {
                        changed += 1;
                    }
                }
                Err(err) => {
                    warn!(client_order_id = %client_id, error = %err, "status poll failed")
                }
            }
        }
        Ok(changed)
    }

    /// Interval loop around `poll_open_orders`. Resting limit and bracket
    /// orders only reach terminal state through this poll, so the engine
    /// keeps it running for its whole lifetime.
    pub async fn run_poll_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(?period, "order reconciliation poll started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_open_orders().await {
                        Ok(0) => {}
                        Ok(changed) => debug!(changed, "open orders reconciled"),
                        Err(err) => warn!(error = %err, "open order poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("order reconciliation poll stopped");
    }

    pub async fn order(&self, client_order_id: &str) -> Option<Order> {
        self.orders.read().await.get(client_order_id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }

    pub async fn brackets(&self) -> Vec<BracketState> {
        self.brackets.read().await.clone()
    }

    // ==================== Internals ====================

    async fn upstream_id_for(&self, client_order_id: &str) -> Result<String> {
        self.orders
            .read()
            .await
            .get(client_order_id)
            .and_then(|o| o.upstream_order_id.clone())
            .ok_or_else(|| TradewindError::OrderNotFound(client_order_id.to_string()))
    }

    /// Cancel one bracket leg without re-entering the bracket rules. Used
    /// from reconciliation so sibling cancels cannot cascade.
    async fn cancel_leg(&self, client_order_id: &str) -> Result<()> {
        let upstream_id = self.upstream_id_for(client_order_id).await?;
        self.gateway.cancel_order(&upstream_id).await?;
        let snapshot = self.gateway.get_order(&upstream_id).await?;

        let order = {
            let mut orders = self.orders.write().await;
            let order = orders
                .get_mut(client_order_id)
                .ok_or_else(|| TradewindError::OrderNotFound(client_order_id.to_string()))?;
            order.apply_snapshot(&snapshot);
            order.clone()
        };
        self.store.update_order(&order).await?;
        Ok(())
    }

    async fn cancel_best_effort(&self, client_order_id: &str) {
        if let Err(err) = self.cancel_leg(client_order_id).await {
            warn!(client_order_id = %client_order_id, error = %err, "leg cleanup failed");
        }
    }

    /// A filled exit leg cancels its sibling.
    async fn on_fill(&self, client_id: &str) {
        let sibling = {
            let brackets = self.brackets.read().await;
            brackets
                .iter()
                .find(|b| b.is_exit(client_id))
                .and_then(|b| b.other_exit(client_id).map(str::to_string))
        };
        if let Some(sibling) = sibling {
            let still_active = self
                .order(&sibling)
                .await
                .map(|o| o.status.is_active())
                .unwrap_or(false);
            if still_active {
                info!(filled = %client_id, canceling = %sibling, "bracket exit filled");
                self.cancel_best_effort(&sibling).await;
            }
        }
    }

    /// A dead entry leg (canceled, rejected, expired) takes both exits with it.
    async fn on_dead_entry(&self, client_id: &str) {
        let exits = {
            let brackets = self.brackets.read().await;
            brackets
                .iter()
                .find(|b| b.entry_id == client_id)
                .map(|b| (b.take_profit_id.clone(), b.stop_loss_id.clone()))
        };
        if let Some((tp, sl)) = exits {
            info!(entry = %client_id, "bracket entry dead, canceling exits");
            for exit in [tp, sl] {
                let still_active = self
                    .order(&exit)
                    .await
                    .map(|o| o.status.is_active())
                    .unwrap_or(false);
                if still_active {
                    self.cancel_best_effort(&exit).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperBroker;
    use crate::config::GatewayConfig;
    use crate::domain::{OrderSide, SignalKind};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn executor() -> (Arc<OrderExecutor>, Arc<PaperBroker>, Arc<MemoryStore>) {
        let broker = Arc::new(PaperBroker::new());
        broker.set_quote("AAPL", dec!(189.98), dec!(190.02)).await;
        let gateway = Arc::new(Gateway::new(broker.clone(), GatewayConfig::default()));
        let store = Arc::new(MemoryStore::new());
        (
            Arc::new(OrderExecutor::new(gateway, store.clone())),
            broker,
            store,
        )
    }

    #[tokio::test]
    async fn submit_records_and_persists() {
        let (executor, _broker, store) = executor().await;
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));
        let client_id = intent.client_order_id.clone();

        let order = executor.submit(intent).await.unwrap();
        assert_eq!(order.client_order_id, client_id);
        assert!(order.upstream_order_id.is_some());
        assert!(store.get_order(&client_id).await.is_some());
    }

    #[tokio::test]
    async fn duplicate_client_id_submits_once() {
        let (executor, broker, _store) = executor().await;
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));

        let first = executor.submit(intent.clone()).await.unwrap();
        let calls_after_first = broker.call_count();
        let second = executor.submit(intent).await.unwrap();

        assert_eq!(first.client_order_id, second.client_order_id);
        assert_eq!(broker.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn invalid_intent_never_reaches_broker() {
        let (executor, broker, _store) = executor().await;
        let before = broker.call_count();
        let intent = OrderIntent::market("", OrderSide::Buy, dec!(10));
        assert!(executor.submit(intent).await.is_err());
        assert_eq!(broker.call_count(), before);
    }

    #[tokio::test]
    async fn signal_executed_exactly_once() {
        let (executor, _broker, store) = executor().await;
        let mut signal = Signal::new(
            Uuid::new_v4(),
            "AAPL",
            SignalKind::Buy,
            dec!(190),
            0.8,
            "test",
        );

        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));
        executor
            .submit_for_signal(intent, &mut signal)
            .await
            .unwrap();
        assert!(signal.executed);
        assert!(store.get_signal(signal.id).await.unwrap().executed);

        // Second attempt with the same signal is refused before validation
        let retry = OrderIntent::market("AAPL", OrderSide::Buy, dec!(5));
        assert!(executor.submit_for_signal(retry, &mut signal).await.is_err());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (executor, _broker, _store) = executor().await;
        let intent = OrderIntent::limit("AAPL", OrderSide::Buy, dec!(10), dec!(185));
        let order = executor.submit(intent).await.unwrap();

        let snapshot = OrderSnapshot {
            upstream_order_id: order.upstream_order_id.clone().unwrap(),
            client_order_id: order.client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_qty: dec!(10),
            avg_fill_price: Some(dec!(185)),
            updated_at: Utc::now(),
        };

        assert!(executor.reconcile(&snapshot).await.unwrap());
        assert!(!executor.reconcile(&snapshot).await.unwrap());
        let tracked = executor.order(&order.client_order_id).await.unwrap();
        assert_eq!(tracked.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn filled_exit_cancels_sibling() {
        let (executor, _broker, _store) = executor().await;
        let entry = OrderIntent::limit("AAPL", OrderSide::Buy, dec!(10), dec!(189));
        let bracket = executor
            .submit_bracket(BracketIntent {
                entry,
                take_profit_price: dec!(200),
                stop_loss_price: dec!(180),
            })
            .await
            .unwrap();

        let tp = executor.order(&bracket.take_profit_id).await.unwrap();
        let snapshot = OrderSnapshot {
            upstream_order_id: tp.upstream_order_id.unwrap(),
            client_order_id: bracket.take_profit_id.clone(),
            status: OrderStatus::Filled,
            filled_qty: dec!(10),
            avg_fill_price: Some(dec!(200)),
            updated_at: Utc::now(),
        };
        executor.reconcile(&snapshot).await.unwrap();

        let sl = executor.order(&bracket.stop_loss_id).await.unwrap();
        assert_eq!(sl.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn poll_loop_drives_bracket_reconciliation() {
        let (executor, broker, _store) = executor().await;
        let entry = OrderIntent::limit("AAPL", OrderSide::Buy, dec!(10), dec!(189));
        let bracket = executor
            .submit_bracket(BracketIntent {
                entry,
                take_profit_price: dec!(200),
                stop_loss_price: dec!(180),
            })
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = tokio::spawn(
            executor
                .clone()
                .run_poll_loop(Duration::from_millis(20), shutdown_rx),
        );

        // The take-profit fills broker-side; only the poll can observe it
        // and trigger the sibling cancel.
        let tp = executor.order(&bracket.take_profit_id).await.unwrap();
        broker
            .fill_order(&tp.upstream_order_id.unwrap(), dec!(200), dec!(10))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let sl = executor.order(&bracket.stop_loss_id).await.unwrap();
            if sl.status == OrderStatus::Canceled {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "poll never reconciled the fill"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let tp_after = executor.order(&bracket.take_profit_id).await.unwrap();
        assert_eq!(tp_after.status, OrderStatus::Filled);

        shutdown_tx.send(true).unwrap();
        poll.await.unwrap();
    }

    #[tokio::test]
    async fn close_position_flattens_long() {
        let (executor, broker, _store) = executor().await;
        broker.set_position("AAPL", dec!(20), dec!(180)).await;

        let order = executor
            .close_position("AAPL", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.qty, Some(dec!(20)));

        assert!(executor
            .close_position("MSFT", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn close_position_partial() {
        let (executor, broker, _store) = executor().await;
        broker.set_position("AAPL", dec!(20), dec!(180)).await;

        let order = executor
            .close_position("AAPL", Some(dec!(0.5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.qty, Some(dec!(10)));
    }
}
