//! Pure indicator math over close-price series. Deterministic by
//! construction: identical inputs always produce identical outputs.

use rust_decimal::Decimal;

/// Simple moving average of the last `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().copied().sum();
    Some(sum / Decimal::from(period as u64))
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = Decimal::TWO / Decimal::from(period as u64 + 1);
    let mut current = sma(&values[..period], period)?;
    for value in &values[period..] {
        current = (*value - current) * alpha + current;
    }
    Some(current)
}

/// Wilder-smoothed relative strength index over `period` intervals.
/// Needs `period + 1` values. Returns a value in [0, 100].
pub fn rsi(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;
    for window in values[..period + 1].windows(2) {
        let delta = window[1] - window[0];
        if delta > Decimal::ZERO {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    let period_dec = Decimal::from(period as u64);
    avg_gain /= period_dec;
    avg_loss /= period_dec;

    for window in values[period + 1..].windows(2) {
        let delta = window[1] - window[0];
        let (gain, loss) = if delta > Decimal::ZERO {
            (delta, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -delta)
        };
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
    }

    if avg_loss.is_zero() {
        return Some(Decimal::ONE_HUNDRED);
    }
    let rs = avg_gain / avg_loss;
    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
}

/// Percent change from `lookback` intervals ago to the latest value.
pub fn momentum(values: &[Decimal], lookback: usize) -> Option<Decimal> {
    if lookback == 0 || values.len() < lookback + 1 {
        return None;
    }
    let past = values[values.len() - 1 - lookback];
    if past.is_zero() {
        return None;
    }
    let current = values[values.len() - 1];
    Some((current - past) / past)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn series(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn sma_basics() {
        let values = series(&[1, 2, 3, 4, 5]);
        assert_eq!(sma(&values, 5), Some(dec!(3)));
        assert_eq!(sma(&values, 2), Some(dec!(4.5)));
        assert_eq!(sma(&values, 6), None);
        assert_eq!(sma(&values, 0), None);
    }

    #[test]
    fn ema_converges_toward_latest() {
        let values = series(&[10, 10, 10, 10, 20]);
        let ema = ema(&values, 4).unwrap();
        assert!(ema > dec!(10) && ema < dec!(20));
    }

    #[test]
    fn rsi_extremes() {
        // Monotone rise: no losses, RSI pegged at 100
        let rising = series(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(rsi(&rising, 14), Some(dec!(100)));

        // Monotone fall: no gains, RSI at 0
        let falling: Vec<Decimal> = rising.iter().rev().copied().collect();
        assert_eq!(rsi(&falling, 14), Some(dec!(0)));
    }

    #[test]
    fn rsi_needs_period_plus_one() {
        let values = series(&[1, 2, 3]);
        assert_eq!(rsi(&values, 3), None);
        assert!(rsi(&values, 2).is_some());
    }

    #[test]
    fn momentum_percent_move() {
        let values = series(&[100, 101, 110]);
        assert_eq!(momentum(&values, 2), Some(dec!(0.1)));
        assert_eq!(momentum(&values, 3), None);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let values = series(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9, 3]);
        assert_eq!(rsi(&values, 14), rsi(&values, 14));
        assert_eq!(ema(&values, 5), ema(&values, 5));
    }
}
