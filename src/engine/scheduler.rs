//! Strategy Scheduler
//!
//! Drives the monitor -> risk -> execute pipeline. Wakes on a fixed tick,
//! selects strategies that are ACTIVE and past their check interval, and
//! evaluates each in its own task. A per-strategy in-flight guard keeps at
//! most one evaluation running per strategy; a semaphore bounds the total.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::domain::{
    LiveStrategy, OrderIntent, OrderSide, Signal, SignalKind, StrategyCommand, StrategyStatus,
    Verdict,
};
use crate::error::{MonitorError, Result, TradewindError};
use crate::gateway::Gateway;
use crate::store::StrategyStore;

use super::executor::OrderExecutor;
use super::monitor::SignalMonitor;
use super::risk::RiskManager;

/// Counters produced by one evaluation pass over a strategy.
#[derive(Debug, Default, Clone, Copy)]
struct EvalOutcome {
    signals: u64,
    executed: u64,
}

pub struct StrategyScheduler {
    store: Arc<dyn StrategyStore>,
    gateway: Arc<Gateway>,
    monitor: Arc<SignalMonitor>,
    risk: Arc<RiskManager>,
    executor: Arc<OrderExecutor>,
    config: SchedulerConfig,
    /// Strategies currently being evaluated
    in_flight: Mutex<HashSet<Uuid>>,
    limiter: Arc<Semaphore>,
}

impl StrategyScheduler {
    pub fn new(
        store: Arc<dyn StrategyStore>,
        gateway: Arc<Gateway>,
        monitor: Arc<SignalMonitor>,
        risk: Arc<RiskManager>,
        executor: Arc<OrderExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_evaluations));
        Self {
            store,
            gateway,
            monitor,
            risk,
            executor,
            config,
            in_flight: Mutex::new(HashSet::new()),
            limiter,
        }
    }

    /// Tick loop. Runs until the shutdown signal flips, then drains
    /// in-flight evaluations before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs.max(1)));
        info!(tick_secs = self.config.tick_secs, "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.clone().dispatch_due().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopping, draining in-flight evaluations");
        while !self.in_flight.lock().map(|g| g.is_empty()).unwrap_or(true) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        info!("scheduler stopped");
    }

    /// One scheduling pass: spawn an evaluation for every due strategy not
    /// already in flight. Returns the handles so callers that need
    /// determinism can await them; the tick loop drops them.
    pub async fn dispatch_due(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let now = Utc::now();
        let strategies = match self.store.list_strategies().await {
            Ok(strategies) => strategies,
            Err(err) => {
                error!(error = %err, "strategy listing failed");
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for strategy in strategies {
            if !strategy.is_due(now) {
                continue;
            }
            {
                let mut in_flight = match self.in_flight.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if !in_flight.insert(strategy.id) {
                    debug!(strategy_id = %strategy.id, "evaluation still in flight, skipping");
                    continue;
                }
            }

            let scheduler = self.clone();
            let strategy_id = strategy.id;
            handles.push(tokio::spawn(async move {
                // Closing the semaphore is not part of this design; treat
                // acquisition failure as a skipped tick.
                if let Ok(_permit) = scheduler.limiter.clone().acquire_owned().await {
                    scheduler.evaluate_one(strategy).await;
                }
                let mut in_flight = match scheduler.in_flight.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                in_flight.remove(&strategy_id);
            }));
        }
        handles
    }

    /// Evaluate one strategy and persist counters, last-check time and any
    /// status change. The strategy may have been paused or stopped while the
    /// evaluation ran, so the persisted record is re-read first and only the
    /// evaluation's own fields are merged onto it.
    async fn evaluate_one(self: &Arc<Self>, strategy: LiveStrategy) {
        let strategy_id = strategy.id;
        let result = self.evaluate_pipeline(&strategy).await;

        let mut current = match self.store.get_strategy(strategy_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(strategy_id = %strategy_id, "strategy deleted mid-evaluation");
                return;
            }
            Err(err) => {
                error!(strategy_id = %strategy_id, error = %err, "strategy reload failed");
                return;
            }
        };

        match result {
            Ok(outcome) => {
                current.consecutive_failures = 0;
                current.signals_generated += outcome.signals;
                current.executed_trades += outcome.executed;
                debug!(
                    strategy_id = %strategy_id,
                    signals = outcome.signals,
                    executed = outcome.executed,
                    "evaluation complete"
                );
            }
            Err(err) => {
                current.consecutive_failures += 1;
                let fatal = is_fatal(&err);
                error!(
                    strategy_id = %strategy_id,
                    error = %err,
                    failures = current.consecutive_failures,
                    fatal,
                    "evaluation failed"
                );
                if (fatal || current.consecutive_failures >= self.config.max_consecutive_failures)
                    && current.status == StrategyStatus::Active
                {
                    warn!(strategy_id = %strategy_id, "strategy moved to ERROR");
                    current.status = StrategyStatus::Error;
                }
            }
        }

        current.last_check = Some(Utc::now());
        current.updated_at = Utc::now();
        if let Err(err) = self.store.update_strategy(&current).await {
            error!(strategy_id = %strategy_id, error = %err, "strategy persist failed");
        }
    }

    /// The monitor -> risk -> execute pipeline over every symbol of one
    /// strategy. Broker failures abort the pass and count against the
    /// strategy; insufficient history degrades to a recorded HOLD.
    async fn evaluate_pipeline(&self, strategy: &LiveStrategy) -> Result<EvalOutcome> {
        let mut outcome = EvalOutcome::default();
        let mut rules = self.store.list_rules(strategy.user_id).await?;

        for symbol in &strategy.symbols {
            let mut signal = match self.monitor.evaluate(strategy, symbol).await {
                Ok(signal) => signal,
                Err(MonitorError::Broker(err)) => return Err(err.into()),
                Err(err) => {
                    warn!(strategy_id = %strategy.id, symbol, error = %err, "holding");
                    Signal::new(
                        strategy.id,
                        symbol.clone(),
                        SignalKind::Hold,
                        Decimal::ZERO,
                        0.0,
                        err.to_string(),
                    )
                }
            };
            self.store.record_signal(&signal).await?;

            if !signal.is_actionable() {
                continue;
            }
            outcome.signals += 1;
            info!(
                strategy_id = %strategy.id,
                symbol,
                kind = %signal.kind,
                strength = signal.strength,
                reason = %signal.reason,
                "signal generated"
            );

            let portfolio = self.gateway.portfolio().await?;
            let is_exit = signal.kind == SignalKind::Sell
                && portfolio
                    .position(symbol)
                    .map(|p| p.qty > Decimal::ZERO)
                    .unwrap_or(false);

            let Some(intent) = self.build_intent(strategy, &signal, &portfolio, is_exit) else {
                debug!(strategy_id = %strategy.id, symbol, "no sizable order for signal");
                continue;
            };

            let decision =
                self.risk
                    .evaluate_with(&portfolio, &intent, signal.price, &mut rules, is_exit);
            for rule_id in &decision.tripped {
                if let Some(rule) = rules.iter().find(|r| r.id == *rule_id) {
                    self.store.update_rule(rule).await?;
                }
            }

            match decision.verdict {
                Verdict::Block(reasons) => {
                    warn!(
                        strategy_id = %strategy.id,
                        symbol,
                        reasons = ?reasons,
                        "order blocked by risk"
                    );
                    continue;
                }
                Verdict::AllowWithWarnings(ref warnings) => {
                    info!(strategy_id = %strategy.id, symbol, ?warnings, "order allowed with warnings");
                }
                Verdict::Allow => {}
            }

            if !strategy.auto_execute {
                info!(
                    strategy_id = %strategy.id,
                    symbol,
                    "auto-execute off, signal left pending"
                );
                continue;
            }

            let order = self
                .executor
                .submit_for_signal(decision.intent, &mut signal)
                .await?;
            outcome.executed += 1;
            info!(
                strategy_id = %strategy.id,
                client_order_id = %order.client_order_id,
                "signal executed"
            );
        }

        Ok(outcome)
    }

    /// Turn a signal into an order intent. Entries are sized from the
    /// position-size fraction of buying power when set, falling back to the
    /// configured default quantity. Exits sell the whole position.
    fn build_intent(
        &self,
        strategy: &LiveStrategy,
        signal: &Signal,
        portfolio: &crate::domain::Portfolio,
        is_exit: bool,
    ) -> Option<OrderIntent> {
        let side = match signal.kind {
            SignalKind::Buy => OrderSide::Buy,
            SignalKind::Sell => OrderSide::Sell,
            SignalKind::Hold => return None,
        };

        let qty = if is_exit {
            portfolio.position(&signal.symbol)?.qty.abs()
        } else if signal.kind == SignalKind::Sell {
            // No position to exit and shorting is out of scope
            return None;
        } else if let Some(pct) = strategy.position_size_pct {
            if signal.price <= Decimal::ZERO {
                return None;
            }
            (portfolio.account.buying_power * pct / signal.price).round_dp(4)
        } else {
            self.config.default_order_qty
        };

        if qty <= Decimal::ZERO {
            return None;
        }
        Some(OrderIntent::market(signal.symbol.clone(), side, qty).with_strategy(strategy.id))
    }

    // ==================== Lifecycle API ====================

    /// Apply a lifecycle command to a strategy and persist the result.
    /// Pausing or stopping does not interrupt an in-flight evaluation; the
    /// merge in `evaluate_one` preserves the new status.
    pub async fn command(&self, id: Uuid, command: StrategyCommand) -> Result<LiveStrategy> {
        let mut strategy = self
            .store
            .get_strategy(id)
            .await?
            .ok_or(TradewindError::StrategyNotFound(id))?;
        let previous = strategy.status;
        strategy.apply(command)?;
        self.store.update_strategy(&strategy).await?;
        info!(strategy_id = %id, from = %previous, to = %strategy.status, "strategy transition");
        Ok(strategy)
    }

    pub async fn add_strategy(&self, strategy: &LiveStrategy) -> Result<()> {
        self.store.insert_strategy(strategy).await
    }

    /// Delete a strategy; refused unless it is STOPPED or ERROR.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let strategy = self
            .store
            .get_strategy(id)
            .await?
            .ok_or(TradewindError::StrategyNotFound(id))?;
        if !strategy.status.is_deletable() {
            return Err(TradewindError::Validation(format!(
                "strategy {} is {}; only STOPPED or ERROR strategies can be deleted",
                id, strategy.status
            )));
        }
        self.store.delete_strategy(id).await
    }
}

/// Auth failures flip a strategy to ERROR on the first occurrence.
fn is_fatal(err: &TradewindError) -> bool {
    match err {
        TradewindError::Broker(broker) => broker.is_fatal_auth(),
        TradewindError::Monitor(MonitorError::Broker(broker)) => broker.is_fatal_auth(),
        _ => false,
    }
}
