//! Signal Monitor
//!
//! Pure transformation from recent market data to a trading signal. All
//! price history comes through the rate-limited gateway; the classification
//! itself is deterministic given identical bars.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{IndicatorConfig, LiveStrategy, Signal, SignalKind};
use crate::error::MonitorError;
use crate::gateway::Gateway;

use super::indicators;

/// Fetch a little beyond the minimum so smoothed indicators settle.
const HISTORY_MARGIN: usize = 20;

pub struct SignalMonitor {
    gateway: Arc<Gateway>,
}

impl SignalMonitor {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Evaluate one symbol for a strategy and classify it.
    pub async fn evaluate(
        &self,
        strategy: &LiveStrategy,
        symbol: &str,
    ) -> Result<Signal, MonitorError> {
        let required = strategy.indicator.required_history();
        let bars = self
            .gateway
            .bars(symbol, strategy.timeframe, required + HISTORY_MARGIN)
            .await?;

        if bars.is_empty() {
            return Err(MonitorError::MarketDataUnavailable(format!(
                "no bars for {}",
                symbol
            )));
        }
        if bars.len() < required {
            return Err(MonitorError::InsufficientHistory {
                symbol: symbol.to_string(),
                required,
                available: bars.len(),
            });
        }

        let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();
        let price = closes.last().copied().unwrap_or(Decimal::ZERO);

        let (kind, strength, reason) = classify(&strategy.indicator, &closes);
        debug!(
            strategy_id = %strategy.id,
            symbol,
            %kind,
            strength,
            reason,
            "signal evaluated"
        );

        Ok(Signal::new(strategy.id, symbol, kind, price, strength, reason))
    }
}

/// Classify a close series against an indicator configuration.
///
/// Strength mapping: 0.5 at the decision boundary, approaching 1.0 as the
/// move behind the signal gets larger.
pub fn classify(indicator: &IndicatorConfig, closes: &[Decimal]) -> (SignalKind, f64, String) {
    match indicator {
        IndicatorConfig::MaCrossover { fast, slow } => classify_ma_crossover(closes, *fast, *slow),
        IndicatorConfig::Rsi {
            period,
            oversold,
            overbought,
        } => classify_rsi(closes, *period, *oversold, *overbought),
        IndicatorConfig::Momentum {
            lookback,
            threshold_pct,
        } => classify_momentum(closes, *lookback, *threshold_pct),
    }
}

fn classify_ma_crossover(closes: &[Decimal], fast: usize, slow: usize) -> (SignalKind, f64, String) {
    let prev = &closes[..closes.len() - 1];
    let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) = (
        indicators::sma(closes, fast),
        indicators::sma(closes, slow),
        indicators::sma(prev, fast),
        indicators::sma(prev, slow),
    ) else {
        return (SignalKind::Hold, 0.0, "insufficient data for SMA".to_string());
    };

    let gap_pct = if slow_now.is_zero() {
        0.0
    } else {
        ((fast_now - slow_now).abs() / slow_now)
            .to_f64()
            .unwrap_or(0.0)
    };
    // A 1% gap between the averages saturates strength at 1.0
    let strength = 0.5 + (gap_pct * 50.0).min(0.5);

    if fast_prev <= slow_prev && fast_now > slow_now {
        (
            SignalKind::Buy,
            strength,
            format!("SMA({}) crossed above SMA({})", fast, slow),
        )
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        (
            SignalKind::Sell,
            strength,
            format!("SMA({}) crossed below SMA({})", fast, slow),
        )
    } else {
        (
            SignalKind::Hold,
            0.0,
            format!("no SMA({}/{}) crossover", fast, slow),
        )
    }
}

fn classify_rsi(
    closes: &[Decimal],
    period: usize,
    oversold: Decimal,
    overbought: Decimal,
) -> (SignalKind, f64, String) {
    let Some(rsi) = indicators::rsi(closes, period) else {
        return (SignalKind::Hold, 0.0, "insufficient data for RSI".to_string());
    };

    if rsi < oversold {
        let depth = ((oversold - rsi) / oversold).to_f64().unwrap_or(0.0);
        (
            SignalKind::Buy,
            0.5 + 0.5 * depth.min(1.0),
            format!("RSI({})={:.1} below oversold {}", period, rsi, oversold),
        )
    } else if rsi > overbought {
        let depth = ((rsi - overbought) / (Decimal::ONE_HUNDRED - overbought))
            .to_f64()
            .unwrap_or(0.0);
        (
            SignalKind::Sell,
            0.5 + 0.5 * depth.min(1.0),
            format!("RSI({})={:.1} above overbought {}", period, rsi, overbought),
        )
    } else {
        (
            SignalKind::Hold,
            0.0,
            format!(
                "RSI({})={:.1} within [{}, {}]",
                period, rsi, oversold, overbought
            ),
        )
    }
}

fn classify_momentum(
    closes: &[Decimal],
    lookback: usize,
    threshold_pct: Decimal,
) -> (SignalKind, f64, String) {
    let Some(pct) = indicators::momentum(closes, lookback) else {
        return (
            SignalKind::Hold,
            0.0,
            "insufficient data for momentum".to_string(),
        );
    };

    if threshold_pct <= Decimal::ZERO {
        return (SignalKind::Hold, 0.0, "momentum threshold not positive".to_string());
    }

    let ratio = (pct.abs() / threshold_pct).to_f64().unwrap_or(0.0);
    // At the threshold strength is 0.5; twice the threshold saturates it
    let strength = 0.5 + 0.5 * (ratio - 1.0).clamp(0.0, 1.0);

    if pct >= threshold_pct {
        (
            SignalKind::Buy,
            strength,
            format!("momentum {:.4} over {} bars above {}", pct, lookback, threshold_pct),
        )
    } else if pct <= -threshold_pct {
        (
            SignalKind::Sell,
            strength,
            format!("momentum {:.4} over {} bars below -{}", pct, lookback, threshold_pct),
        )
    } else {
        (
            SignalKind::Hold,
            0.0,
            format!("momentum {:.4} within ±{}", pct, threshold_pct),
        )
    }
}
