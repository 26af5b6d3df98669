use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TradewindError};

/// Lifecycle state of a live strategy.
///
/// Modeled as a closed enum with explicit transition checks so invalid
/// transitions are rejected at the API boundary instead of by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyStatus {
    Stopped,
    Active,
    Paused,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyStatus::Stopped => "STOPPED",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Paused => "PAUSED",
            StrategyStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// User lifecycle command against a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyCommand {
    Start,
    Stop,
    Pause,
    Resume,
}

impl StrategyStatus {
    /// Apply a lifecycle command, rejecting invalid transitions.
    pub fn transition(self, command: StrategyCommand) -> Result<StrategyStatus> {
        use StrategyCommand::*;
        use StrategyStatus::*;

        let next = match (self, command) {
            (Stopped, Start) | (Error, Start) => Active,
            (Active, Pause) => Paused,
            (Paused, Resume) => Active,
            (Active, Stop) | (Paused, Stop) => Stopped,
            (from, _) => {
                return Err(TradewindError::InvalidStateTransition {
                    from: from.to_string(),
                    to: format!("{:?}", command),
                })
            }
        };
        Ok(next)
    }

    /// Deletion is only permitted when a strategy cannot be scheduled.
    pub fn is_deletable(&self) -> bool {
        matches!(self, StrategyStatus::Stopped | StrategyStatus::Error)
    }
}

/// Indicator configuration driving signal generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorConfig {
    /// Fast/slow simple moving average crossover
    MaCrossover { fast: usize, slow: usize },
    /// Relative strength index thresholds
    Rsi {
        period: usize,
        oversold: Decimal,
        overbought: Decimal,
    },
    /// Percent move over a lookback window
    Momentum {
        lookback: usize,
        threshold_pct: Decimal,
    },
}

impl IndicatorConfig {
    /// Minimal number of bars required to evaluate this indicator.
    pub fn required_history(&self) -> usize {
        match self {
            IndicatorConfig::MaCrossover { slow, .. } => slow + 1,
            IndicatorConfig::Rsi { period, .. } => period + 1,
            IndicatorConfig::Momentum { lookback, .. } => lookback + 1,
        }
    }
}

/// A user-owned strategy being monitored against a set of symbols
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStrategy {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub symbols: Vec<String>,
    pub indicator: IndicatorConfig,
    pub timeframe: super::Timeframe,
    /// Seconds between evaluations
    pub check_interval_secs: u64,
    pub auto_execute: bool,
    pub max_positions: u32,
    pub daily_loss_limit: Decimal,
    /// Fraction of buying power committed per entry, e.g. 0.05
    pub position_size_pct: Option<Decimal>,
    pub status: StrategyStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub signals_generated: u64,
    pub executed_trades: u64,
    pub daily_pnl: Decimal,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveStrategy {
    pub fn new(
        user_id: Uuid,
        name: impl Into<String>,
        symbols: Vec<String>,
        indicator: IndicatorConfig,
        check_interval_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            symbols,
            indicator,
            timeframe: super::Timeframe::Min5,
            check_interval_secs,
            auto_execute: false,
            max_positions: 5,
            daily_loss_limit: Decimal::from(500),
            position_size_pct: None,
            status: StrategyStatus::Stopped,
            last_check: None,
            signals_generated: 0,
            executed_trades: 0,
            daily_pnl: Decimal::ZERO,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this strategy should be evaluated on the current tick.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != StrategyStatus::Active {
            return false;
        }
        match self.last_check {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.check_interval_secs as i64,
        }
    }

    /// Apply a lifecycle command in place.
    pub fn apply(&mut self, command: StrategyCommand) -> Result<()> {
        self.status = self.status.transition(command)?;
        if command == StrategyCommand::Start {
            self.consecutive_failures = 0;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn strategy() -> LiveStrategy {
        LiveStrategy::new(
            Uuid::new_v4(),
            "ma-cross",
            vec!["AAPL".into()],
            IndicatorConfig::MaCrossover { fast: 10, slow: 30 },
            60,
        )
    }

    #[test]
    fn valid_lifecycle_transitions() {
        let mut s = strategy();
        assert_eq!(s.status, StrategyStatus::Stopped);

        s.apply(StrategyCommand::Start).unwrap();
        assert_eq!(s.status, StrategyStatus::Active);

        s.apply(StrategyCommand::Pause).unwrap();
        assert_eq!(s.status, StrategyStatus::Paused);

        s.apply(StrategyCommand::Resume).unwrap();
        assert_eq!(s.status, StrategyStatus::Active);

        s.apply(StrategyCommand::Stop).unwrap();
        assert_eq!(s.status, StrategyStatus::Stopped);
    }

    #[test]
    fn error_restarts_and_clears_failures() {
        let mut s = strategy();
        s.status = StrategyStatus::Error;
        s.consecutive_failures = 3;

        s.apply(StrategyCommand::Start).unwrap();
        assert_eq!(s.status, StrategyStatus::Active);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut s = strategy();
        assert!(s.apply(StrategyCommand::Pause).is_err());
        assert!(s.apply(StrategyCommand::Resume).is_err());

        s.apply(StrategyCommand::Start).unwrap();
        assert!(s.apply(StrategyCommand::Start).is_err());
        assert!(s.apply(StrategyCommand::Resume).is_err());
    }

    #[test]
    fn deletion_only_from_stopped_or_error() {
        assert!(StrategyStatus::Stopped.is_deletable());
        assert!(StrategyStatus::Error.is_deletable());
        assert!(!StrategyStatus::Active.is_deletable());
        assert!(!StrategyStatus::Paused.is_deletable());
    }

    #[test]
    fn due_only_when_active_and_interval_elapsed() {
        let mut s = strategy();
        let now = Utc::now();

        // Stopped strategies are never due
        assert!(!s.is_due(now));

        s.apply(StrategyCommand::Start).unwrap();
        // Never checked: due immediately
        assert!(s.is_due(now));

        s.last_check = Some(now - chrono::Duration::seconds(30));
        assert!(!s.is_due(now));

        s.last_check = Some(now - chrono::Duration::seconds(61));
        assert!(s.is_due(now));
    }

    #[test]
    fn required_history_per_indicator() {
        assert_eq!(
            IndicatorConfig::MaCrossover { fast: 10, slow: 30 }.required_history(),
            31
        );
        assert_eq!(
            IndicatorConfig::Rsi {
                period: 14,
                oversold: dec!(30),
                overbought: dec!(70)
            }
            .required_history(),
            15
        );
    }
}
