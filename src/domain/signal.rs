use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signal classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
            SignalKind::Hold => "HOLD",
        };
        write!(f, "{}", s)
    }
}

/// One timestamped classification produced for a symbol.
///
/// Immutable once created; only the `executed` flag changes, exactly once,
/// when the execution gateway submits the resulting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub strategy_id: Uuid,
    pub symbol: String,
    pub kind: SignalKind,
    pub price: Decimal,
    /// Confidence in [0, 1]
    pub strength: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub executed: bool,
}

impl Signal {
    pub fn new(
        strategy_id: Uuid,
        symbol: impl Into<String>,
        kind: SignalKind,
        price: Decimal,
        strength: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id,
            symbol: symbol.into(),
            kind,
            price,
            strength: strength.clamp(0.0, 1.0),
            reason: reason.into(),
            created_at: Utc::now(),
            executed: false,
        }
    }

    /// Set the executed flag; returns false if it was already set.
    pub fn mark_executed(&mut self) -> bool {
        if self.executed {
            return false;
        }
        self.executed = true;
        true
    }

    pub fn is_actionable(&self) -> bool {
        self.kind != SignalKind::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn strength_clamped_to_unit_interval() {
        let s = Signal::new(
            Uuid::new_v4(),
            "AAPL",
            SignalKind::Buy,
            dec!(190),
            1.7,
            "test",
        );
        assert_eq!(s.strength, 1.0);

        let s = Signal::new(
            Uuid::new_v4(),
            "AAPL",
            SignalKind::Sell,
            dec!(190),
            -0.2,
            "test",
        );
        assert_eq!(s.strength, 0.0);
    }

    #[test]
    fn executed_set_exactly_once() {
        let mut s = Signal::new(
            Uuid::new_v4(),
            "AAPL",
            SignalKind::Buy,
            dec!(190),
            0.8,
            "test",
        );
        assert!(!s.executed);
        assert!(s.mark_executed());
        assert!(!s.mark_executed());
        assert!(s.executed);
    }

    #[test]
    fn hold_is_not_actionable() {
        let s = Signal::new(
            Uuid::new_v4(),
            "AAPL",
            SignalKind::Hold,
            dec!(190),
            0.0,
            "flat",
        );
        assert!(!s.is_actionable());
    }
}
