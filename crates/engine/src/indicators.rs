//! Indicator library
//!
//! Pure functions over ordered price/volume sequences. Every function only
//! looks at the values it is handed, so callers control lookahead by slicing
//! history up to the current bar.
//!
//! Moving averages, deviation and Bollinger Bands run on `ta`. RSI and ATR are
//! computed here because `ta` smooths both with an EMA rather than Wilder's
//! recurrence.

use serde::{Deserialize, Serialize};
use ta::indicators::{BollingerBands, ExponentialMovingAverage, SimpleMovingAverage, StandardDeviation};
use ta::Next;

use crate::types::Bar;

/// RSI reported when there is not enough history to compute one
pub const NEUTRAL_RSI: f64 = 50.0;

fn window(values: &[f64], period: usize) -> Option<&[f64]> {
    (period > 0 && period <= values.len()).then(|| &values[values.len() - period..])
}

// ============================================================================
// Moving averages
// ============================================================================

/// Full EMA series seeded with the first value: `ema[i] = v[i]*k + ema[i-1]*(1-k)`
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let Ok(mut ema) = ExponentialMovingAverage::new(period) else {
        return Vec::new();
    };
    values.iter().map(|&v| ema.next(v)).collect()
}

/// Trailing EMA value
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Mean of the last `period` values. Falls back to the last value when the
/// window exceeds history, and 0 for empty input.
pub fn sma(values: &[f64], period: usize) -> f64 {
    let fallback = values.last().copied().unwrap_or(0.0);
    let (Some(window), Ok(mut sma)) = (window(values, period), SimpleMovingAverage::new(period)) else {
        return fallback;
    };
    window.iter().fold(fallback, |_, &v| sma.next(v))
}

/// Population standard deviation of the last `period` values; 0 when the
/// window exceeds history.
pub fn std_dev(values: &[f64], period: usize) -> f64 {
    let (Some(window), Ok(mut sd)) = (window(values, period), StandardDeviation::new(period)) else {
        return 0.0;
    };
    window.iter().fold(0.0, |_, &v| sd.next(v))
}

// ============================================================================
// RSI (Wilder)
// ============================================================================

fn wilder_rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// RSI series aligned with `values`; `None` until `period` deltas exist.
pub fn rsi_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;

    let mut avg_gain = deltas[..period].iter().map(|d| d.max(0.0)).sum::<f64>() / p;
    let mut avg_loss = deltas[..period].iter().map(|d| (-d).max(0.0)).sum::<f64>() / p;
    out[period] = Some(wilder_rsi_value(avg_gain, avg_loss));

    for (i, d) in deltas.iter().enumerate().skip(period) {
        avg_gain = (avg_gain * (p - 1.0) + d.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-d).max(0.0)) / p;
        out[i + 1] = Some(wilder_rsi_value(avg_gain, avg_loss));
    }

    out
}

/// Trailing Wilder RSI; [`NEUTRAL_RSI`] with fewer than `period + 1` values.
pub fn rsi(values: &[f64], period: usize) -> f64 {
    rsi_series(values, period)
        .last()
        .copied()
        .flatten()
        .unwrap_or(NEUTRAL_RSI)
}

// ============================================================================
// ATR (Wilder)
// ============================================================================

/// `max(high-low, |high-prevClose|, |low-prevClose|)`; plain range without a previous close
pub fn true_range(bar: &Bar, prev_close: Option<f64>) -> f64 {
    let hl = bar.high - bar.low;
    match prev_close {
        Some(pc) => hl.max((bar.high - pc).abs()).max((bar.low - pc).abs()),
        None => hl,
    }
}

/// ATR series aligned with `bars`; seeded with the mean of the first `period`
/// true ranges, then `atr = (prev*(period-1) + tr) / period`.
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }

    let tr: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, b)| true_range(b, i.checked_sub(1).map(|j| bars[j].close)))
        .collect();

    let p = period as f64;
    let mut current = tr[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(current);
    for i in period..bars.len() {
        current = (current * (p - 1.0) + tr[i]) / p;
        out[i] = Some(current);
    }
    out
}

/// Trailing Wilder ATR; `None` with fewer than `period` bars
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    atr_series(bars, period).last().copied().flatten()
}

// ============================================================================
// VWAP
// ============================================================================

/// Volume-weighted typical price. `None` when cumulative volume is zero so
/// callers can skip VWAP-dependent checks instead of using a stand-in price.
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let (pv, vol) = bars.iter().fold((0.0, 0.0), |(pv, vol), b| {
        (pv + b.typical_price() * b.volume, vol + b.volume)
    });
    (vol > 0.0).then(|| pv / vol)
}

// ============================================================================
// Bollinger Bands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerStats {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle × 100
    pub bandwidth_pct: f64,
    /// Position of the last value inside the bands (0 = lower, 1 = upper)
    pub percent_b: f64,
}

/// Bands over the last `period` values (population deviation); `None` when
/// history is shorter.
pub fn bollinger(values: &[f64], period: usize, multiplier: f64) -> Option<BollingerStats> {
    let window = window(values, period)?;
    let mut bands = BollingerBands::new(period, multiplier).ok()?;
    let mut out = None;
    for &v in window {
        out = Some(bands.next(v));
    }
    let out = out?;
    let (upper, middle, lower) = (out.upper, out.average, out.lower);
    let width = upper - lower;
    let last = *window.last()?;

    Some(BollingerStats {
        upper,
        middle,
        lower,
        bandwidth_pct: if middle != 0.0 { width / middle * 100.0 } else { 0.0 },
        percent_b: if width > 0.0 { (last - lower) / width } else { 0.5 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(price: f64, n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(i as i64 * 60_000, price, price, price, price, 100.0))
            .collect()
    }

    #[test]
    fn test_constant_series_properties() {
        let values = vec![42.5; 300];
        let e = ema(&values, 200).unwrap();
        assert!((e - 42.5).abs() < 1e-9);
        assert_eq!(rsi(&values, 14), 100.0);
        assert_eq!(atr(&flat_bars(42.5, 50), 14), Some(0.0));
        assert_eq!(std_dev(&values, 20), 0.0);
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let k = 2.0 / 10.0;
        let mut expected = values[0];
        let series = ema_series(&values, 9);
        assert_eq!(series.len(), values.len());
        assert!((series[0] - values[0]).abs() < 1e-12);
        for (i, &v) in values.iter().enumerate().skip(1) {
            expected = v * k + expected * (1.0 - k);
            assert!((series[i] - expected).abs() < 1e-9, "{} vs {expected}", series[i]);
        }
        assert!(ema_series(&values, 0).is_empty());
        assert_eq!(ema(&[], 9), None);
    }

    #[test]
    fn test_sma_over_trailing_window() {
        let values: Vec<f64> = (0..40).map(|i| 50.0 + i as f64 * 0.3).collect();
        let expected = values[30..].iter().sum::<f64>() / 10.0;
        assert!((sma(&values, 10) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sma_and_stddev_short_history() {
        assert_eq!(sma(&[1.0, 2.0], 5), 2.0);
        assert_eq!(sma(&[], 5), 0.0);
        assert_eq!(std_dev(&[1.0, 2.0], 5), 0.0);
        // population: values 2,4,4,4,5,5,7,9 -> sd 2
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&v, 8) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_wilder_reference() {
        // Wilder's original worksheet closes
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let series = rsi_series(&closes, 14);
        assert!(series[13].is_none());
        let first = series[14].unwrap();
        assert!((first - 70.46).abs() < 0.05, "first RSI {first}");
        let last = series[19].unwrap();
        assert!((last - 57.92).abs() < 0.1, "last RSI {last}");
    }

    #[test]
    fn test_rsi_neutral_when_short() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0], 14), NEUTRAL_RSI);
        let values: Vec<f64> = (0..15).map(|i| 100.0 - i as f64).collect();
        assert_eq!(rsi(&values, 14), 0.0);
    }

    #[test]
    fn test_atr_wilder_recurrence() {
        let bars = vec![
            Bar::new(0, 10.0, 11.0, 9.0, 10.0, 1.0),  // tr 2
            Bar::new(1, 10.0, 12.0, 10.0, 11.0, 1.0), // tr 2
            Bar::new(2, 11.0, 11.0, 8.0, 9.0, 1.0),   // tr 3
            Bar::new(3, 9.0, 13.0, 9.0, 12.0, 1.0),   // tr max(4, 4, 0) = 4
        ];
        let series = atr_series(&bars, 3);
        assert_eq!(series[1], None);
        let seed = (2.0 + 2.0 + 3.0) / 3.0;
        assert!((series[2].unwrap() - seed).abs() < 1e-12);
        assert!((series[3].unwrap() - (seed * 2.0 + 4.0) / 3.0).abs() < 1e-12);
        assert_eq!(atr(&bars[..2], 3), None);
    }

    #[test]
    fn test_true_range_gap() {
        let bar = Bar::new(0, 15.0, 16.0, 14.0, 15.0, 1.0);
        assert_eq!(true_range(&bar, Some(10.0)), 6.0);
        assert_eq!(true_range(&bar, None), 2.0);
    }

    #[test]
    fn test_vwap_weighting_and_zero_volume() {
        let mut bars = vec![
            Bar::new(0, 10.0, 12.0, 9.0, 9.0, 100.0),  // typical 10
            Bar::new(1, 19.0, 21.0, 19.0, 20.0, 300.0), // typical 20
        ];
        assert!((vwap(&bars).unwrap() - 17.5).abs() < 1e-12);
        for b in &mut bars {
            b.volume = 0.0;
        }
        assert_eq!(vwap(&bars), None);
        assert_eq!(vwap(&[]), None);
    }

    #[test]
    fn test_bollinger() {
        assert!(bollinger(&[1.0; 5], 20, 2.0).is_none());
        let flat = bollinger(&[10.0; 20], 20, 2.0).unwrap();
        assert_eq!(flat.upper, 10.0);
        assert_eq!(flat.percent_b, 0.5);

        let values: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let bb = bollinger(&values, 20, 2.0).unwrap();
        assert!((bb.middle - 10.5).abs() < 1e-12);
        // population sd of 1..=20 is sqrt(399/12)
        let sd = (399.0f64 / 12.0).sqrt();
        assert!((bb.upper - (10.5 + 2.0 * sd)).abs() < 1e-9);
        assert!(bb.percent_b > 0.85 && bb.percent_b < 0.95);
    }
}
