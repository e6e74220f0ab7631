//! Feature snapshots
//!
//! A snapshot is what a detector would have seen at the close of one bar:
//! indicators over the trailing window, session patterns, recent flow and the
//! same indicator block for every higher timeframe that has a closed bar.
//! Fields that cannot be computed from the available history are left
//! `None` (or absent from their map) rather than approximated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::indicators::{self, BollingerStats};
use crate::types::{Bar, Direction, FlowEvent, FlowKind, FlowSide, Timeframe, MINUTE_MS};

pub const EMA_PERIODS: [usize; 4] = [9, 21, 50, 200];
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_MULTIPLIER: f64 = 2.0;
pub const BREAKOUT_LOOKBACK: usize = 20;
pub const DIVERGENCE_LOOKBACK: usize = 20;
pub const VOLUME_LOOKBACK: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session open as minutes after 00:00 UTC
    pub open_minute_utc: u32,
    /// Length of the opening range
    pub orb_minutes: u32,
    /// Trailing window for the flow summary
    pub flow_lookback_minutes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_minute_utc: 13 * 60 + 30,
            orb_minutes: 15,
            flow_lookback_minutes: 60,
        }
    }
}

// ============================================================================
// Snapshot types
// ============================================================================

/// Indicator block, identical in shape for the base and higher timeframes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeFeatures {
    pub timeframe: Timeframe,
    pub close: f64,
    pub prev_close: Option<f64>,
    pub volume: f64,
    /// period → value; a period is absent when history is shorter than it
    pub ema: BTreeMap<usize, f64>,
    /// period → value; absent below `period + 1` closes
    pub rsi: BTreeMap<usize, f64>,
    pub atr: Option<f64>,
    pub bollinger: Option<BollingerStats>,
}

impl TimeframeFeatures {
    /// `None` for an empty window
    pub fn compute(timeframe: Timeframe, bars: &[Bar]) -> Option<Self> {
        let last = bars.last()?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let ema = EMA_PERIODS
            .iter()
            .filter(|&&p| closes.len() >= p)
            .filter_map(|&p| indicators::ema(&closes, p).map(|v| (p, v)))
            .collect();

        let mut rsi = BTreeMap::new();
        if closes.len() > RSI_PERIOD {
            rsi.insert(RSI_PERIOD, indicators::rsi(&closes, RSI_PERIOD));
        }

        Some(Self {
            timeframe,
            close: last.close,
            prev_close: bars.len().checked_sub(2).map(|i| bars[i].close),
            volume: last.volume,
            ema,
            rsi,
            atr: indicators::atr(bars, ATR_PERIOD),
            bollinger: indicators::bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_MULTIPLIER),
        })
    }

    pub fn ema(&self, period: usize) -> Option<f64> {
        self.ema.get(&period).copied()
    }

    pub fn rsi(&self, period: usize) -> Option<f64> {
        self.rsi.get(&period).copied()
    }
}

/// Close relative to the prior range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakout {
    /// Direction of the break, `None` while inside the range
    pub direction: Option<Direction>,
    pub range_high: f64,
    pub range_low: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrbLevels {
    pub high: f64,
    pub low: f64,
    pub window_start: i64,
    pub window_end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorDayLevels {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Divergence {
    Bullish,
    Bearish,
    Neutral,
}

/// `None` means not computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternFlags {
    pub breakout: Option<Breakout>,
    pub orb: Option<OrbLevels>,
    pub prior_day: Option<PriorDayLevels>,
    pub divergence: Option<Divergence>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub events: usize,
    pub bullish_premium: f64,
    pub bearish_premium: f64,
    pub sweeps: usize,
    pub blocks: usize,
}

impl FlowSummary {
    /// Bullish minus bearish premium
    pub fn net_premium(&self) -> f64 {
        self.bullish_premium - self.bearish_premium
    }
}

/// Everything known at the close of one base bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub symbol: String,
    pub timestamp: i64,
    pub price: f64,
    pub prev_close: Option<f64>,
    pub base: TimeframeFeatures,
    /// Current volume over the mean of the previous bars' volume
    pub relative_volume: Option<f64>,
    /// Session VWAP over the current UTC day; `None` when history starts after midnight
    pub vwap: Option<f64>,
    pub vwap_distance_pct: Option<f64>,
    pub patterns: PatternFlags,
    pub flow: FlowSummary,
    /// Higher timeframes with at least one closed bar
    pub timeframes: BTreeMap<Timeframe, TimeframeFeatures>,
}

impl FeatureSnapshot {
    /// Features for `timeframe`, base included
    pub fn timeframe(&self, timeframe: Timeframe) -> Option<&TimeframeFeatures> {
        if timeframe == self.base.timeframe {
            Some(&self.base)
        } else {
            self.timeframes.get(&timeframe)
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// A loaded higher-timeframe series
#[derive(Debug, Clone, Copy)]
pub struct HigherTimeframe<'a> {
    pub timeframe: Timeframe,
    pub bars: &'a [Bar],
}

impl<'a> HigherTimeframe<'a> {
    /// Bars whose close is at or before `as_of` (exclusive end of the current base bar)
    pub fn closed_at(&self, as_of: i64) -> &'a [Bar] {
        let tf = self.timeframe.millis();
        let n = self.bars.partition_point(|b| b.timestamp + tf <= as_of);
        &self.bars[..n]
    }
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    base: Timeframe,
    session: SessionConfig,
    lookback: usize,
}

impl FeatureBuilder {
    pub fn new(base: Timeframe, session: SessionConfig, lookback: usize) -> Self {
        Self {
            base,
            session,
            lookback: lookback.max(1),
        }
    }

    pub fn base(&self) -> Timeframe {
        self.base
    }

    /// Build the snapshot for `current`, the last bar of `history`.
    ///
    /// Rolling indicators see the last `lookback` bars. Session features
    /// (VWAP, opening range, prior-day levels) read back to their day boundary
    /// and stay uncomputed when `history` does not reach it.
    pub fn build(
        &self,
        symbol: &str,
        current: &Bar,
        history: &[Bar],
        higher: &[HigherTimeframe<'_>],
        flow: &[FlowEvent],
    ) -> FeatureSnapshot {
        debug_assert_eq!(history.last().map(|b| b.timestamp), Some(current.timestamp));

        let as_of = current.timestamp + self.base.millis();
        let day_start = Timeframe::D1.bucket_start(current.timestamp);
        let prev_start = day_start - Timeframe::D1.millis();
        let trailing = &history[history.len().saturating_sub(self.lookback)..];
        let since = |ts: i64| history.partition_point(|b| b.timestamp < ts);
        let reaches = |ts: i64| history.first().is_some_and(|b| b.timestamp <= ts);

        let base = TimeframeFeatures::compute(self.base, trailing).unwrap_or_else(|| {
            TimeframeFeatures {
                timeframe: self.base,
                close: current.close,
                prev_close: None,
                volume: current.volume,
                ema: BTreeMap::new(),
                rsi: BTreeMap::new(),
                atr: None,
                bollinger: None,
            }
        });

        let mut timeframes = BTreeMap::new();
        let mut daily: Option<&Bar> = None;
        for htf in higher.iter().filter(|h| h.timeframe > self.base) {
            let closed = htf.closed_at(as_of);
            if htf.timeframe == Timeframe::D1 {
                daily = closed.last();
            }
            let window = &closed[closed.len().saturating_sub(self.lookback)..];
            if let Some(features) = TimeframeFeatures::compute(htf.timeframe, window) {
                timeframes.insert(htf.timeframe, features);
            }
        }

        let vwap = if reaches(day_start) {
            indicators::vwap(&history[since(day_start)..])
        } else {
            None
        };
        let vwap_distance_pct = vwap
            .filter(|v| *v > 0.0)
            .map(|v| (current.close - v) / v * 100.0);

        let patterns = PatternFlags {
            breakout: breakout(trailing),
            orb: self.opening_range(history, day_start, as_of),
            prior_day: match daily {
                Some(d) if d.timestamp < day_start => Some(PriorDayLevels {
                    high: d.high,
                    low: d.low,
                    close: d.close,
                }),
                _ if reaches(prev_start) => {
                    prior_day_levels(&history[since(prev_start)..since(day_start)])
                }
                _ => None,
            },
            divergence: divergence(trailing),
        };

        FeatureSnapshot {
            symbol: symbol.to_string(),
            timestamp: current.timestamp,
            price: current.close,
            prev_close: base.prev_close,
            base,
            relative_volume: relative_volume(trailing),
            vwap,
            vwap_distance_pct,
            patterns,
            flow: self.flow_summary(flow, as_of),
            timeframes,
        }
    }

    /// High/low of the opening window, once the window has fully elapsed and
    /// `history` reaches back to its start
    fn opening_range(&self, history: &[Bar], day_start: i64, as_of: i64) -> Option<OrbLevels> {
        let window_start = day_start + self.session.open_minute_utc as i64 * MINUTE_MS;
        let window_end = window_start + self.session.orb_minutes as i64 * MINUTE_MS;
        if self.session.orb_minutes == 0 || as_of < window_end {
            return None;
        }
        if history.first().map_or(true, |b| b.timestamp > window_start) {
            return None;
        }
        let base_ms = self.base.millis();
        let from = history.partition_point(|b| b.timestamp < window_start);
        history[from..]
            .iter()
            .take_while(|b| b.timestamp + base_ms <= window_end)
            .fold(None, |acc: Option<OrbLevels>, b| {
                Some(match acc {
                    Some(o) => OrbLevels {
                        high: o.high.max(b.high),
                        low: o.low.min(b.low),
                        ..o
                    },
                    None => OrbLevels {
                        high: b.high,
                        low: b.low,
                        window_start,
                        window_end,
                    },
                })
            })
    }

    fn flow_summary(&self, flow: &[FlowEvent], as_of: i64) -> FlowSummary {
        let from = as_of - self.session.flow_lookback_minutes as i64 * MINUTE_MS;
        flow.iter()
            .filter(|e| e.timestamp > from && e.timestamp <= as_of)
            .fold(FlowSummary::default(), |mut s, e| {
                s.events += 1;
                match e.side {
                    FlowSide::Bullish => s.bullish_premium += e.premium,
                    FlowSide::Bearish => s.bearish_premium += e.premium,
                }
                match e.kind {
                    FlowKind::Sweep => s.sweeps += 1,
                    FlowKind::Block => s.blocks += 1,
                }
                s
            })
    }
}

fn relative_volume(trailing: &[Bar]) -> Option<f64> {
    let (current, prior) = trailing.split_last()?;
    if prior.len() < VOLUME_LOOKBACK {
        return None;
    }
    let window = &prior[prior.len() - VOLUME_LOOKBACK..];
    let mean = window.iter().map(|b| b.volume).sum::<f64>() / VOLUME_LOOKBACK as f64;
    (mean > 0.0).then(|| current.volume / mean)
}

fn breakout(trailing: &[Bar]) -> Option<Breakout> {
    let (current, prior) = trailing.split_last()?;
    if prior.len() < BREAKOUT_LOOKBACK {
        return None;
    }
    let window = &prior[prior.len() - BREAKOUT_LOOKBACK..];
    let range_high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let range_low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let direction = if current.close > range_high {
        Some(Direction::Long)
    } else if current.close < range_low {
        Some(Direction::Short)
    } else {
        None
    };
    Some(Breakout {
        direction,
        range_high,
        range_low,
    })
}

/// Levels over one complete day of base bars
fn prior_day_levels(day: &[Bar]) -> Option<PriorDayLevels> {
    let (first, rest) = day.split_first()?;
    Some(rest.iter().fold(
        PriorDayLevels {
            high: first.high,
            low: first.low,
            close: first.close,
        },
        |acc, b| PriorDayLevels {
            high: acc.high.max(b.high),
            low: acc.low.min(b.low),
            close: b.close,
        },
    ))
}

/// Compares the two halves of the last `DIVERGENCE_LOOKBACK` bars: a lower
/// price low with a higher RSI low is bullish, a higher price high with a
/// lower RSI high is bearish.
fn divergence(trailing: &[Bar]) -> Option<Divergence> {
    if trailing.len() < DIVERGENCE_LOOKBACK {
        return None;
    }
    let closes: Vec<f64> = trailing.iter().map(|b| b.close).collect();
    let start = trailing.len() - DIVERGENCE_LOOKBACK;
    let rsi: Vec<f64> = indicators::rsi_series(&closes, RSI_PERIOD)[start..]
        .iter()
        .copied()
        .collect::<Option<Vec<f64>>>()?;
    let window = &trailing[start..];
    let half = DIVERGENCE_LOOKBACK / 2;

    let extreme = |range: std::ops::Range<usize>, pick_low: bool| -> usize {
        range
            .reduce(|best, i| {
                let better = if pick_low {
                    window[i].low < window[best].low
                } else {
                    window[i].high > window[best].high
                };
                if better {
                    i
                } else {
                    best
                }
            })
            .unwrap_or(0)
    };

    let (low_a, low_b) = (extreme(0..half, true), extreme(half..DIVERGENCE_LOOKBACK, true));
    if window[low_b].low < window[low_a].low && rsi[low_b] > rsi[low_a] {
        return Some(Divergence::Bullish);
    }
    let (high_a, high_b) = (extreme(0..half, false), extreme(half..DIVERGENCE_LOOKBACK, false));
    if window[high_b].high > window[high_a].high && rsi[high_b] < rsi[high_a] {
        return Some(Divergence::Bearish);
    }
    Some(Divergence::Neutral)
}
