//! Risk Manager
//!
//! Every order intent passes through here before it can reach the broker.
//! Rules evaluate in (priority, id) order so ties break deterministically;
//! the first BLOCK wins and later rules are not consulted. ALERT rules
//! accumulate warnings, REDUCE_SIZE rules shrink the intent and keep going,
//! and breach counters increment whenever a rule trips regardless of action.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{
    BreachEvent, OrderIntent, OrderSide, Portfolio, RiskRule, RuleAction, RuleKind, Verdict,
};
use crate::error::BrokerError;
use crate::gateway::Gateway;

/// The answer for one intent: the (possibly resized) intent, the verdict,
/// and the ids of every rule that tripped.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub verdict: Verdict,
    pub intent: OrderIntent,
    pub tripped: Vec<uuid::Uuid>,
}

impl RiskDecision {
    pub fn is_blocked(&self) -> bool {
        self.verdict.is_blocked()
    }
}

pub struct RiskManager {
    gateway: Arc<Gateway>,
    breach_tx: mpsc::Sender<BreachEvent>,
}

impl RiskManager {
    pub fn new(gateway: Arc<Gateway>, breach_tx: mpsc::Sender<BreachEvent>) -> Self {
        Self { gateway, breach_tx }
    }

    /// Fetch the portfolio through the gateway and evaluate the intent
    /// against the given rules. `is_exit` marks intents that reduce an
    /// existing position; position-count and cash-buffer rules skip those.
    pub async fn evaluate(
        &self,
        intent: &OrderIntent,
        price: Decimal,
        rules: &mut [RiskRule],
        is_exit: bool,
    ) -> Result<RiskDecision, BrokerError> {
        let portfolio = self.gateway.portfolio().await?;
        let decision = self.evaluate_with(&portfolio, intent, price, rules, is_exit);
        Ok(decision)
    }

    /// Pure evaluation against an already-fetched portfolio.
    pub fn evaluate_with(
        &self,
        portfolio: &Portfolio,
        intent: &OrderIntent,
        price: Decimal,
        rules: &mut [RiskRule],
        is_exit: bool,
    ) -> RiskDecision {
        rules.sort_by_key(|r| (r.priority, r.id));

        let mut working = intent.clone();
        let mut warnings = Vec::new();
        let mut tripped = Vec::new();

        for rule in rules.iter_mut() {
            if !rule.active {
                continue;
            }

            let Some(breach) = check_rule(rule, portfolio, &working, price, is_exit) else {
                continue;
            };

            rule.breach_count += 1;
            tripped.push(rule.id);
            self.notify(rule, intent, &breach);

            match rule.action {
                RuleAction::Alert => {
                    debug!(rule_id = %rule.id, %breach, "risk alert");
                    warnings.push(breach);
                }
                RuleAction::Block => {
                    warn!(rule_id = %rule.id, %breach, "order blocked");
                    return RiskDecision {
                        verdict: Verdict::Block(vec![breach]),
                        intent: working,
                        tripped,
                    };
                }
                RuleAction::ReduceSize => {
                    match reduced_qty(rule, portfolio, &working, price) {
                        Some(qty) if qty > Decimal::ZERO => {
                            warnings.push(format!("{breach}; qty reduced to {qty}"));
                            working.qty = Some(qty);
                            working.notional = None;
                        }
                        _ => {
                            warn!(rule_id = %rule.id, %breach, "cannot reduce below threshold");
                            return RiskDecision {
                                verdict: Verdict::Block(vec![format!(
                                    "{breach}; no size fits under threshold"
                                )]),
                                intent: working,
                                tripped,
                            };
                        }
                    }
                }
                RuleAction::ClosePosition => {
                    // Only meaningful for exits: widen the order to flatten
                    // the whole position.
                    if is_exit {
                        if let Some(position) = portfolio.position(&working.symbol) {
                            let full = position.qty.abs();
                            warnings.push(format!("{breach}; closing full position of {full}"));
                            working.qty = Some(full);
                            working.notional = None;
                        }
                    } else {
                        warnings.push(breach);
                    }
                }
            }
        }

        let verdict = if warnings.is_empty() {
            Verdict::Allow
        } else {
            Verdict::AllowWithWarnings(warnings)
        };
        RiskDecision {
            verdict,
            intent: working,
            tripped,
        }
    }

    fn notify(&self, rule: &RiskRule, intent: &OrderIntent, message: &str) {
        let event = BreachEvent {
            rule_id: rule.id,
            strategy_id: intent.strategy_id,
            message: message.to_string(),
            action: rule.action,
        };
        // Notification delivery must never stall order flow
        if let Err(err) = self.breach_tx.try_send(event) {
            warn!(error = %err, "breach notification dropped");
        }
    }
}

/// Notional value of the working intent at the evaluation price.
fn intent_notional(intent: &OrderIntent, price: Decimal) -> Decimal {
    match (intent.notional, intent.qty) {
        (Some(notional), _) => notional,
        (None, Some(qty)) => qty * price,
        (None, None) => Decimal::ZERO,
    }
}

/// Returns the breach message when the rule trips, None otherwise.
fn check_rule(
    rule: &RiskRule,
    portfolio: &Portfolio,
    intent: &OrderIntent,
    price: Decimal,
    is_exit: bool,
) -> Option<String> {
    match rule.kind {
        RuleKind::MaxPositionSize => {
            let notional = intent_notional(intent, price);
            (notional > rule.threshold).then(|| {
                format!(
                    "order notional {} exceeds max position size {}",
                    notional, rule.threshold
                )
            })
        }
        RuleKind::MaxOpenPositions => {
            if is_exit {
                return None;
            }
            let open = Decimal::from(portfolio.open_positions() as u64);
            (open >= rule.threshold).then(|| {
                format!(
                    "{} open positions at limit {}",
                    portfolio.open_positions(),
                    rule.threshold
                )
            })
        }
        RuleKind::MaxDailyLoss => {
            let pnl = portfolio.account.daily_realized_pnl;
            (pnl <= -rule.threshold).then(|| {
                format!("daily realized P&L {} breaches loss limit {}", pnl, rule.threshold)
            })
        }
        RuleKind::MinCashBuffer => {
            if is_exit || intent.side != OrderSide::Buy {
                return None;
            }
            let remaining = portfolio.account.cash - intent_notional(intent, price);
            (remaining < rule.threshold).then(|| {
                format!(
                    "cash after order {} below required buffer {}",
                    remaining, rule.threshold
                )
            })
        }
        RuleKind::MaxSymbolExposure => {
            if is_exit {
                return None;
            }
            let existing = portfolio
                .position(&intent.symbol)
                .map(|p| p.market_value.abs())
                .unwrap_or(Decimal::ZERO);
            let total = existing + intent_notional(intent, price);
            (total > rule.threshold).then(|| {
                format!(
                    "{} exposure {} exceeds symbol limit {}",
                    intent.symbol, total, rule.threshold
                )
            })
        }
    }
}

/// Largest quantity that fits under the tripped rule's threshold.
fn reduced_qty(
    rule: &RiskRule,
    portfolio: &Portfolio,
    intent: &OrderIntent,
    price: Decimal,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let headroom = match rule.kind {
        RuleKind::MaxPositionSize => rule.threshold,
        RuleKind::MinCashBuffer => portfolio.account.cash - rule.threshold,
        RuleKind::MaxSymbolExposure => {
            let existing = portfolio
                .position(&intent.symbol)
                .map(|p| p.market_value.abs())
                .unwrap_or(Decimal::ZERO);
            rule.threshold - existing
        }
        // Count and loss limits have no meaningful partial size
        RuleKind::MaxOpenPositions | RuleKind::MaxDailyLoss => return None,
    };
    if headroom <= Decimal::ZERO {
        return None;
    }
    Some((headroom / price).round_dp(4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperBroker;
    use crate::config::GatewayConfig;
    use crate::domain::{AccountSnapshot, Position};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn manager() -> (RiskManager, mpsc::Receiver<BreachEvent>) {
        let gateway = Arc::new(Gateway::new(
            Arc::new(PaperBroker::new()),
            GatewayConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(16);
        (RiskManager::new(gateway, tx), rx)
    }

    fn portfolio(cash: Decimal, daily_pnl: Decimal, positions: Vec<Position>) -> Portfolio {
        Portfolio {
            account: AccountSnapshot {
                cash,
                buying_power: cash * dec!(2),
                equity: cash,
                daily_realized_pnl: daily_pnl,
                timestamp: Utc::now(),
            },
            positions,
        }
    }

    fn position(symbol: &str, qty: Decimal, market_value: Decimal) -> Position {
        Position {
            symbol: symbol.into(),
            qty,
            avg_entry_price: dec!(100),
            market_value,
            unrealized_pnl: dec!(0),
        }
    }

    #[tokio::test]
    async fn clean_intent_is_allowed() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(50000), dec!(0), vec![]);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));
        let mut rules = vec![RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxPositionSize,
            dec!(10000),
            RuleAction::Block,
        )];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert_eq!(decision.verdict, Verdict::Allow);
        assert!(decision.tripped.is_empty());
        assert_eq!(rules[0].breach_count, 0);
    }

    #[tokio::test]
    async fn daily_loss_blocks_and_counts() {
        let (manager, mut rx) = manager();
        let portfolio = portfolio(dec!(50000), dec!(-520), vec![]);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));
        let mut rules = vec![RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxDailyLoss,
            dec!(500),
            RuleAction::Block,
        )];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert!(decision.is_blocked());
        assert_eq!(rules[0].breach_count, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.rule_id, rules[0].id);
        assert_eq!(event.action, RuleAction::Block);
    }

    #[tokio::test]
    async fn first_block_wins_in_priority_order() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(100), dec!(-999), vec![]);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(100));

        let loss = RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxDailyLoss,
            dec!(500),
            RuleAction::Block,
        )
        .with_priority(10);
        let size = RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxPositionSize,
            dec!(1000),
            RuleAction::Block,
        )
        .with_priority(20);
        let mut rules = vec![size.clone(), loss.clone()];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert!(decision.is_blocked());
        // Only the higher-priority loss rule trips; the size rule is never
        // consulted after the block.
        assert_eq!(decision.tripped, vec![loss.id]);
    }

    #[tokio::test]
    async fn alert_warns_without_blocking() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(50000), dec!(0), vec![position("AAPL", dec!(50), dec!(9500))]);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(10));
        let mut rules = vec![RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxSymbolExposure,
            dec!(10000),
            RuleAction::Alert,
        )];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert!(matches!(decision.verdict, Verdict::AllowWithWarnings(_)));
        assert_eq!(rules[0].breach_count, 1);
    }

    #[tokio::test]
    async fn reduce_size_shrinks_the_order() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(50000), dec!(0), vec![]);
        // 100 * 190 = 19000 notional against a 9500 cap
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(100));
        let mut rules = vec![RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxPositionSize,
            dec!(9500),
            RuleAction::ReduceSize,
        )];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert!(!decision.is_blocked());
        assert_eq!(decision.intent.qty, Some(dec!(50)));
    }

    #[tokio::test]
    async fn exits_skip_position_count_and_cash_rules() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(10), dec!(0), vec![position("AAPL", dec!(10), dec!(1900))]);
        let intent = OrderIntent::market("AAPL", OrderSide::Sell, dec!(10));
        let mut rules = vec![
            RiskRule::new(
                Uuid::new_v4(),
                RuleKind::MaxOpenPositions,
                dec!(1),
                RuleAction::Block,
            ),
            RiskRule::new(
                Uuid::new_v4(),
                RuleKind::MinCashBuffer,
                dec!(5000),
                RuleAction::Block,
            ),
        ];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, true);
        assert_eq!(decision.verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn inactive_rules_are_skipped() {
        let (manager, _rx) = manager();
        let portfolio = portfolio(dec!(50000), dec!(-9999), vec![]);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, dec!(1));
        let mut rule = RiskRule::new(
            Uuid::new_v4(),
            RuleKind::MaxDailyLoss,
            dec!(500),
            RuleAction::Block,
        );
        rule.active = false;
        let mut rules = vec![rule];

        let decision = manager.evaluate_with(&portfolio, &intent, dec!(190), &mut rules, false);
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(rules[0].breach_count, 0);
    }
}
