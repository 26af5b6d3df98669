use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a risk rule measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Notional value of a single order
    MaxPositionSize,
    /// Count of open positions
    MaxOpenPositions,
    /// Realized daily loss
    MaxDailyLoss,
    /// Cash that must remain after the order
    MinCashBuffer,
    /// Total exposure to one symbol (existing position + new order)
    MaxSymbolExposure,
}

/// What happens when a rule trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Record a warning, do not block
    Alert,
    /// Refuse the order
    Block,
    /// Shrink the order to fit under the threshold
    ReduceSize,
    /// Convert an exit intent into a full close
    ClosePosition,
}

/// One configured risk constraint. Read-only to the risk manager except for
/// the breach counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: RuleKind,
    pub threshold: Decimal,
    /// Lower numbers evaluate first
    pub priority: i32,
    pub action: RuleAction,
    pub active: bool,
    pub breach_count: u64,
}

impl RiskRule {
    pub fn new(user_id: Uuid, kind: RuleKind, threshold: Decimal, action: RuleAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            threshold,
            priority: 100,
            action,
            active: true,
            breach_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a risk evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    AllowWithWarnings(Vec<String>),
    Block(Vec<String>),
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Block(_))
    }
}

/// Emitted to the notification collaborator whenever a rule trips
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreachEvent {
    pub rule_id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub message: String,
    pub action: RuleAction,
}
