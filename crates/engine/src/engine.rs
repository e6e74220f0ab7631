//! Event-driven backtesting engine
//!
//! Walks each symbol's base bars in order. A detection at the close of bar
//! `i` enters at bar `i + 1`'s open; open trades are then managed on every
//! base bar (entry bar included) until a stop, target, max-hold or
//! end-of-data exit moves them into the completed list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::detectors::{Detection, Detector};
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureBuilder, HigherTimeframe, SessionConfig, ATR_PERIOD};
use crate::indicators;
use crate::loader::SymbolData;
use crate::stats::BacktestStats;
use crate::types::*;

// ============================================================================
// Configuration
// ============================================================================

/// The risk parameters the optimizer searches over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    /// Target distance in multiples of the initial risk
    pub target_multiple: f64,
    /// Stop distance in multiples of ATR, when the detector gives no stop
    pub stop_multiple: f64,
    /// Detections scoring below this are ignored
    pub min_score: f64,
    /// Unrealized R at which half the position is booked
    pub trim_at_r: f64,
    /// Cap in bars of the strategy's own timeframe. A trade still open once
    /// this many bars have elapsed after its entry bar closes at that bar's close.
    pub max_hold_bars: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            target_multiple: 2.0,
            stop_multiple: 1.5,
            min_score: 50.0,
            trim_at_r: 1.5,
            max_hold_bars: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    /// Fraction of the entry price per share
    FixedFraction(f64),
    /// Half the entry bar's bid/ask spread, or `fallback × entry` without a quote
    HalfSpread { fallback: f64 },
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::FixedFraction(0.0005)
    }
}

impl SlippageModel {
    /// Per-share cost charged against a trade entered on `entry_bar`
    pub fn per_share(&self, entry_price: f64, entry_bar: &Bar) -> f64 {
        match *self {
            Self::FixedFraction(f) => entry_price * f,
            Self::HalfSpread { fallback } => entry_bar
                .quote
                .and_then(|q| q.half_spread())
                .unwrap_or(entry_price * fallback),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Signals are only taken on bars opening inside [start, end)
    pub start: i64,
    pub end: i64,
    pub base_timeframe: Timeframe,
    /// Leading base bars consumed before any detection
    pub warmup_bars: usize,
    /// Bars of history the rolling indicators see
    pub lookback_bars: usize,
    pub params: StrategyParams,
    pub one_trade_per_symbol: bool,
    /// Unrealized R that moves the stop to entry; 0 disables
    pub breakeven_at_r: f64,
    pub trailing_atr_multiple: Option<f64>,
    pub slippage: SlippageModel,
    pub session: SessionConfig,
    /// Also flatten at the last bar of each UTC day
    pub close_at_session_end: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: i64::MAX,
            base_timeframe: Timeframe::M1,
            warmup_bars: 200,
            lookback_bars: 400,
            params: StrategyParams::default(),
            one_trade_per_symbol: true,
            breakeven_at_r: 1.0,
            trailing_atr_multiple: None,
            slippage: SlippageModel::default(),
            session: SessionConfig::default(),
            close_at_session_end: false,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.start > self.end {
            return Err(EngineError::InvalidConfig(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if self.lookback_bars == 0 {
            return Err(EngineError::InvalidConfig("lookback_bars must be positive".into()));
        }
        let p = &self.params;
        if !(p.target_multiple.is_finite() && p.target_multiple > 0.0) {
            return Err(EngineError::InvalidConfig("target_multiple must be positive".into()));
        }
        if !(p.stop_multiple.is_finite() && p.stop_multiple > 0.0) {
            return Err(EngineError::InvalidConfig("stop_multiple must be positive".into()));
        }
        if p.max_hold_bars == 0 {
            return Err(EngineError::InvalidConfig("max_hold_bars must be positive".into()));
        }
        if let Some(m) = self.trailing_atr_multiple {
            if !(m.is_finite() && m > 0.0) {
                return Err(EngineError::InvalidConfig(
                    "trailing_atr_multiple must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    fn in_window(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// Series a run needs: the base clock, the strategy's own timeframe and the
/// hourly/daily context, coarser than or equal to the base only.
pub fn required_timeframes(base: Timeframe, strategy: Timeframe) -> Vec<Timeframe> {
    let mut tfs: Vec<Timeframe> = [base, strategy, Timeframe::H1, Timeframe::D1]
        .into_iter()
        .filter(|tf| *tf >= base)
        .collect();
    tfs.sort();
    tfs.dedup();
    tfs
}

// ============================================================================
// Signal tape
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSignal {
    /// Base bar whose close produced the detection
    pub index: usize,
    pub detection: Detection,
    /// Strategy-timeframe ATR at the signal, for ATR-based stops
    pub atr: Option<f64>,
}

/// Detections at every eligible bar of one symbol.
///
/// Snapshots depend on the data, warm-up, lookback, session and trading
/// window but not on [`StrategyParams`], so one tape can be replayed under
/// any number of parameter sets.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTape {
    pub strategy: String,
    pub timeframe: Timeframe,
    pub signals: Vec<RecordedSignal>,
}

impl SignalTape {
    pub fn record(detector: &dyn Detector, data: &SymbolData, config: &BacktestConfig) -> Self {
        let timeframe = detector.timeframe();
        let mut tape = Self {
            strategy: detector.id().to_string(),
            timeframe,
            signals: Vec::new(),
        };

        let bars = data.base_bars();
        if !data.is_sufficient(config.warmup_bars) {
            return tape;
        }

        let builder = FeatureBuilder::new(data.base, config.session.clone(), config.lookback_bars);
        let higher: Vec<HigherTimeframe<'_>> = data
            .higher_timeframes()
            .map(|(timeframe, bars)| HigherTimeframe { timeframe, bars })
            .collect();

        for (i, bar) in bars.iter().enumerate().skip(config.warmup_bars) {
            if !timeframe.closes_bucket(data.base, bar.timestamp) || !config.in_window(bar.timestamp) {
                continue;
            }
            let snapshot = builder.build(&data.symbol, bar, &bars[..=i], &higher, &data.flow);
            if let Some(detection) = detector.detect(&snapshot) {
                let atr = snapshot.timeframe(timeframe).and_then(|f| f.atr);
                tape.signals.push(RecordedSignal {
                    index: i,
                    detection,
                    atr,
                });
            }
        }

        debug!(
            symbol = %data.symbol,
            strategy = %tape.strategy,
            signals = tape.signals.len(),
            "Signal tape recorded"
        );
        tape
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub trades: Vec<CompletedTrade>,
    pub stats: BacktestStats,
    pub per_symbol: BTreeMap<String, BacktestStats>,
    /// Symbols with too little data to get past warm-up
    pub skipped_symbols: Vec<String>,
}

/// Stateless entry points; all run state lives on the stack of one call
pub struct BacktestEngine;

impl BacktestEngine {
    /// Record signals with `detector` and simulate every symbol.
    pub fn run(
        config: &BacktestConfig,
        detector: &dyn Detector,
        data: &[SymbolData],
    ) -> EngineResult<BacktestReport> {
        config.validate()?;
        if data.is_empty() {
            return Err(EngineError::NoSymbols);
        }
        let runs: Vec<(SymbolData, SignalTape)> = data
            .iter()
            .map(|d| (d.clone(), SignalTape::record(detector, d, config)))
            .collect();
        Self::replay(config, &runs)
    }

    /// Simulate pre-recorded signal tapes. Same output as [`Self::run`] for the
    /// tapes `run` would have recorded.
    pub fn replay(
        config: &BacktestConfig,
        runs: &[(SymbolData, SignalTape)],
    ) -> EngineResult<BacktestReport> {
        config.validate()?;
        if runs.is_empty() {
            return Err(EngineError::NoSymbols);
        }

        let mut trades = Vec::new();
        let mut per_symbol = BTreeMap::new();
        let mut skipped_symbols = Vec::new();

        for (data, tape) in runs {
            if !data.is_sufficient(config.warmup_bars) {
                warn!(
                    symbol = %data.symbol,
                    bars = data.base_bars().len(),
                    warmup = config.warmup_bars,
                    "Insufficient data, skipping symbol"
                );
                skipped_symbols.push(data.symbol.clone());
                continue;
            }

            let symbol_trades = simulate(config, data, tape);
            let stats = BacktestStats::from_trades(&symbol_trades);
            info!(
                symbol = %data.symbol,
                strategy = %tape.strategy,
                trades = stats.total_trades,
                win_rate = %format!("{:.1}%", stats.win_rate * 100.0),
                expectancy = %format!("{:.3}R", stats.expectancy),
                "Symbol backtest complete"
            );
            per_symbol.insert(data.symbol.clone(), stats);
            trades.extend(symbol_trades);
        }

        Ok(BacktestReport {
            stats: BacktestStats::from_trades(&trades),
            trades,
            per_symbol,
            skipped_symbols,
        })
    }
}

/// Turn a signal into a trade entered at `bar`'s open, or `None` when its
/// levels are unusable.
fn open_trade(
    config: &BacktestConfig,
    strategy: &str,
    symbol: &str,
    signal: &RecordedSignal,
    signal_timestamp: i64,
    bar: &Bar,
    index: usize,
) -> Option<ActiveTrade> {
    let d = &signal.detection;
    let sign = d.direction.sign();
    let entry = bar.open;

    let stop = match d.stop {
        Some(stop) => stop,
        None => entry - sign * config.params.stop_multiple * signal.atr?,
    };
    let risk = sign * (entry - stop);
    if !(risk > 0.0) {
        debug!(symbol, entry, stop, "Stop not beyond entry, signal discarded");
        return None;
    }
    let target = d
        .target
        .unwrap_or(entry + sign * config.params.target_multiple * risk);
    if !(sign * (target - entry) > 0.0) {
        debug!(symbol, entry, target, "Target not beyond entry, signal discarded");
        return None;
    }

    Some(ActiveTrade {
        symbol: symbol.to_string(),
        strategy: strategy.to_string(),
        kind: d.kind.clone(),
        direction: d.direction,
        score: d.score,
        signal_timestamp,
        entry_timestamp: bar.timestamp,
        entry_index: index,
        entry_price: entry,
        target,
        initial_stop: stop,
        stop,
        breakeven_moved: false,
        trimmed: false,
        slippage: config.slippage.per_share(entry, bar),
    })
}

/// One bar of trade management. Returns the exit fill when the trade closes.
fn manage(
    trade: &mut ActiveTrade,
    bar: &Bar,
    index: usize,
    atr: Option<f64>,
    config: &BacktestConfig,
    max_hold: usize,
) -> Option<(f64, ExitReason)> {
    let long = trade.direction == Direction::Long;

    // stop, then target; a gap through either fills at the open
    let (stop_gapped, stop_touched) = if long {
        (bar.open <= trade.stop, bar.low <= trade.stop)
    } else {
        (bar.open >= trade.stop, bar.high >= trade.stop)
    };
    if stop_gapped {
        return Some((bar.open, ExitReason::StopHit));
    }
    if stop_touched {
        return Some((trade.stop, ExitReason::StopHit));
    }

    let (target_gapped, target_touched) = if long {
        (bar.open >= trade.target, bar.high >= trade.target)
    } else {
        (bar.open <= trade.target, bar.low <= trade.target)
    };
    if target_gapped {
        return Some((bar.open, ExitReason::TargetHit));
    }
    if target_touched {
        return Some((trade.target, ExitReason::TargetHit));
    }

    if index - trade.entry_index >= max_hold {
        return Some((bar.close, ExitReason::MaxHold));
    }

    let best = trade.r_at(if long { bar.high } else { bar.low });
    let sign = trade.direction.sign();

    if !trade.breakeven_moved && config.breakeven_at_r > 0.0 && best >= config.breakeven_at_r {
        if sign * (trade.entry_price - trade.stop) > 0.0 {
            trade.stop = trade.entry_price;
        }
        trade.breakeven_moved = true;
    }

    let trim_at = config.params.trim_at_r;
    if !trade.trimmed && trim_at > 0.0 && best >= trim_at {
        trade.trimmed = true;
    }

    if let (Some(multiple), Some(atr)) = (config.trailing_atr_multiple, atr) {
        let candidate = bar.close - sign * multiple * atr;
        if sign * (candidate - trade.stop) > 0.0 {
            trade.stop = candidate;
        }
    }

    None
}

fn close_trade(
    trade: ActiveTrade,
    price: f64,
    bar: &Bar,
    index: usize,
    reason: ExitReason,
    trim_at_r: f64,
) -> CompletedTrade {
    let done = trade.close(price, bar.timestamp, index, reason, trim_at_r);
    debug!(
        symbol = %done.symbol,
        direction = %done.direction,
        entry = done.entry_price,
        exit = done.exit_price,
        reason = %done.exit_reason,
        r = done.r_multiple,
        "Closed trade"
    );
    done
}

/// The per-symbol event loop
fn simulate(config: &BacktestConfig, data: &SymbolData, tape: &SignalTape) -> Vec<CompletedTrade> {
    let bars = data.base_bars();
    let scale = (tape.timeframe.minutes() / data.base.minutes()).max(1) as usize;
    let max_hold = config.params.max_hold_bars.saturating_mul(scale).max(1);
    let trim_at_r = config.params.trim_at_r;
    let atr = indicators::atr_series(bars, ATR_PERIOD);

    let mut signals = tape.signals.iter().peekable();
    let mut pending: Option<&RecordedSignal> = None;
    let mut active: Vec<ActiveTrade> = Vec::new();
    let mut completed: Vec<CompletedTrade> = Vec::new();

    for (i, bar) in bars.iter().enumerate() {
        if let Some(signal) = pending.take() {
            let signal_ts = bars[signal.index].timestamp;
            if let Some(trade) = open_trade(config, &tape.strategy, &data.symbol, signal, signal_ts, bar, i) {
                debug!(
                    symbol = %trade.symbol,
                    direction = %trade.direction,
                    entry = trade.entry_price,
                    stop = trade.stop,
                    target = trade.target,
                    "Opened trade"
                );
                active.push(trade);
            }
        }

        let mut still_open = Vec::with_capacity(active.len());
        for mut trade in active.drain(..) {
            match manage(&mut trade, bar, i, atr[i], config, max_hold) {
                Some((price, reason)) => {
                    completed.push(close_trade(trade, price, bar, i, reason, trim_at_r))
                }
                None => still_open.push(trade),
            }
        }
        active = still_open;

        let last = i + 1 == bars.len();
        let session_end = config.close_at_session_end
            && bars.get(i + 1).is_some_and(|next| {
                Timeframe::D1.bucket_start(next.timestamp) != Timeframe::D1.bucket_start(bar.timestamp)
            });
        if last || session_end {
            for trade in active.drain(..) {
                completed.push(close_trade(trade, bar.close, bar, i, ExitReason::Eod, trim_at_r));
            }
        }

        while signals.peek().is_some_and(|s| s.index < i) {
            signals.next();
        }
        let Some(signal) = signals.next_if(|s| s.index == i) else {
            continue;
        };
        if signal.detection.score < config.params.min_score {
            continue;
        }
        if config.one_trade_per_symbol && !active.is_empty() {
            continue;
        }
        if last {
            debug!(symbol = %data.symbol, "Signal on final bar discarded");
            continue;
        }
        pending = Some(signal);
    }

    completed
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000 - 1_700_000_000_000 % 86_400_000;

    /// Fires the given detections at the given base-bar timestamps
    struct Scripted {
        timeframe: Timeframe,
        fires: Vec<(i64, Detection)>,
    }

    impl Detector for Scripted {
        fn id(&self) -> &'static str {
            "scripted"
        }

        fn timeframe(&self) -> Timeframe {
            self.timeframe
        }

        fn detect(&self, snapshot: &FeatureSnapshot) -> Option<Detection> {
            self.fires
                .iter()
                .find(|(ts, _)| *ts == snapshot.timestamp)
                .map(|(_, d)| d.clone())
        }
    }

    use crate::features::FeatureSnapshot;

    fn make_bars(n: usize, price: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(T0 + i as i64 * MINUTE_MS, price, price, price, price, 100.0))
            .collect()
    }

    fn set(bars: &mut [Bar], i: usize, open: f64, high: f64, low: f64, close: f64) {
        bars[i] = Bar::new(bars[i].timestamp, open, high, low, close, 100.0);
    }

    fn data(bars: Vec<Bar>) -> SymbolData {
        SymbolData::new("SPY", BTreeMap::from([(Timeframe::M1, bars)]))
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            warmup_bars: 5,
            lookback_bars: 50,
            slippage: SlippageModel::FixedFraction(0.0),
            breakeven_at_r: 0.0,
            params: StrategyParams {
                trim_at_r: 0.0,
                min_score: 0.0,
                max_hold_bars: 1_000,
                ..StrategyParams::default()
            },
            ..BacktestConfig::default()
        }
    }

    fn long(stop: f64, target: f64) -> Detection {
        Detection::new(Direction::Long, "test", 80.0)
            .with_stop(stop)
            .with_target(target)
    }

    fn fire_at(bars: &[Bar], i: usize, d: Detection) -> Scripted {
        Scripted {
            timeframe: Timeframe::M1,
            fires: vec![(bars[i].timestamp, d)],
        }
    }

    fn run(config: &BacktestConfig, detector: &Scripted, bars: Vec<Bar>) -> BacktestReport {
        BacktestEngine::run(config, detector, &[data(bars)]).unwrap()
    }

    #[test]
    fn test_entry_at_next_bar_open() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 10, 100.0, 100.6, 99.9, 100.5);
        set(&mut bars, 11, 100.8, 100.9, 100.7, 100.8);
        let detector = fire_at(&bars, 10, long(99.0, 110.0));

        let report = run(&config(), &detector, bars.clone());
        let trade = &report.trades[0];
        assert_eq!(trade.signal_timestamp, bars[10].timestamp);
        assert_eq!(trade.entry_timestamp, bars[10].timestamp + MINUTE_MS);
        assert_eq!(trade.entry_price, 100.8);
        assert_eq!(trade.exit_reason, ExitReason::Eod);
    }

    #[test]
    fn test_default_warmup_long_stopped_out() {
        let mut bars = make_bars(330, 101.5);
        set(&mut bars, 301, 101.8, 103.0, 101.0, 102.0);
        set(&mut bars, 305, 101.0, 101.2, 100.0, 100.2);
        let detector = fire_at(&bars, 300, long(100.0, 105.0));
        let config = BacktestConfig {
            slippage: SlippageModel::FixedFraction(0.0),
            ..BacktestConfig::default()
        };

        let report = run(&config, &detector, bars.clone());
        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.direction, Direction::Long);
        assert_eq!(trade.entry_price, 101.8);
        assert_eq!(trade.entry_timestamp, bars[300].timestamp + MINUTE_MS);
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
        assert_eq!(trade.exit_price, 100.0);
        assert_eq!(trade.exit_timestamp, bars[305].timestamp);
        assert!((trade.r_multiple + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_fills_at_stop_price() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 15, 100.0, 100.2, 98.0, 98.5);
        let detector = fire_at(&bars, 10, long(99.0, 110.0));

        let trade = &run(&config(), &detector, bars).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
        assert_eq!(trade.exit_price, 99.0);
        assert_eq!(trade.r_multiple, -1.0);
        assert_eq!(trade.bars_held, 5);
    }

    #[test]
    fn test_gap_through_stop_fills_at_open() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 15, 97.5, 98.0, 97.0, 97.8);
        let detector = fire_at(&bars, 10, long(99.0, 110.0));

        let trade = &run(&config(), &detector, bars).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
        assert_eq!(trade.exit_price, 97.5);
    }

    #[test]
    fn test_target_and_gap_through_target() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 13, 100.0, 102.5, 100.0, 101.0);
        let detector = fire_at(&bars, 10, long(99.0, 102.0));
        let trade = &run(&config(), &detector, bars).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::TargetHit);
        assert_eq!(trade.exit_price, 102.0);
        assert_eq!(trade.r_multiple, 2.0);

        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 13, 103.0, 103.5, 102.8, 103.2);
        let detector = fire_at(&bars, 10, long(99.0, 102.0));
        let trade = &run(&config(), &detector, bars).trades[0];
        assert_eq!(trade.exit_price, 103.0);
    }

    #[test]
    fn test_stop_checked_before_target() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 13, 100.0, 103.0, 98.0, 100.0);
        let detector = fire_at(&bars, 10, long(99.0, 102.0));
        let trade = &run(&config(), &detector, bars).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
    }

    #[test]
    fn test_no_detection_during_warmup() {
        let bars = make_bars(40, 100.0);
        let detector = Scripted {
            timeframe: Timeframe::M1,
            fires: bars.iter().map(|b| (b.timestamp, long(99.0, 110.0))).collect(),
        };
        let mut cfg = config();
        cfg.warmup_bars = 20;
        cfg.params.max_hold_bars = 1;

        let report = run(&cfg, &detector, bars.clone());
        assert!(!report.trades.is_empty());
        for trade in &report.trades {
            assert!(trade.signal_timestamp >= bars[20].timestamp);
        }
        assert_eq!(report.trades[0].signal_timestamp, bars[20].timestamp);
    }

    #[test]
    fn test_signal_on_last_bar_is_discarded() {
        let bars = make_bars(30, 100.0);
        let detector = fire_at(&bars, 29, long(99.0, 110.0));
        assert!(run(&config(), &detector, bars).trades.is_empty());
    }

    #[test]
    fn test_signals_only_at_strategy_bucket_close() {
        let bars = make_bars(60, 100.0);
        let detector = Scripted {
            timeframe: Timeframe::M5,
            fires: bars.iter().map(|b| (b.timestamp, long(99.0, 110.0))).collect(),
        };
        let mut cfg = config();
        cfg.params.max_hold_bars = 1;

        let tape = SignalTape::record(&detector, &data(bars.clone()), &cfg);
        assert!(!tape.is_empty());
        for signal in &tape.signals {
            assert_eq!((bars[signal.index].timestamp + MINUTE_MS) % Timeframe::M5.millis(), 0);
        }
        // max hold of one 5m bar is five base bars after the entry bar
        let report = run(&cfg, &detector, bars);
        assert_eq!(report.trades[0].exit_reason, ExitReason::MaxHold);
        assert_eq!(report.trades[0].bars_held, 6);
    }

    #[test]
    fn test_max_hold_counts_bars_elapsed_after_entry() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 14, 100.0, 100.4, 99.8, 100.3);
        let detector = fire_at(&bars, 10, long(99.0, 110.0));
        let mut cfg = config();
        cfg.params.max_hold_bars = 3;

        let trade = &run(&cfg, &detector, bars.clone()).trades[0];
        assert_eq!(trade.entry_timestamp, bars[11].timestamp);
        assert_eq!(trade.exit_reason, ExitReason::MaxHold);
        assert_eq!(trade.exit_timestamp, bars[14].timestamp);
        assert_eq!(trade.exit_price, 100.3);
    }

    #[test]
    fn test_breakeven_moves_stop_once() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 12, 100.0, 101.2, 100.0, 101.0);
        let detector = fire_at(&bars, 10, long(99.0, 105.0));
        let mut cfg = config();
        cfg.breakeven_at_r = 1.0;

        // the flat bar after the 1R excursion trades at the moved stop
        let trade = &run(&cfg, &detector, bars.clone()).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
        assert_eq!(trade.exit_timestamp, bars[13].timestamp);
        assert_eq!(trade.exit_price, 100.0);
        assert_eq!(trade.final_stop, 100.0);
        assert_eq!(trade.initial_stop, 99.0);
        assert_eq!(trade.r_multiple, 0.0);
    }

    #[test]
    fn test_trim_books_half_at_trim_level() {
        let mut bars = make_bars(30, 100.0);
        set(&mut bars, 12, 100.0, 101.6, 100.0, 101.5);
        set(&mut bars, 16, 101.0, 101.0, 98.5, 98.6);
        let detector = fire_at(&bars, 10, long(99.0, 105.0));
        let mut cfg = config();
        cfg.params.trim_at_r = 1.5;

        let trade = &run(&cfg, &detector, bars).trades[0];
        assert!(trade.trimmed);
        assert_eq!(trade.exit_price, 99.0);
        // 0.5 × 1.5R + 0.5 × -1R
        assert!((trade.r_multiple - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_trailing_stop_only_tightens() {
        let mut bars = make_bars(40, 100.0);
        // widen ranges so ATR is non-zero
        for i in 0..40 {
            let p = 100.0 + if i >= 12 && i < 20 { (i - 11) as f64 } else { 0.0 };
            set(&mut bars, i, p, p + 0.5, p - 0.5, p);
        }
        // pull back after the run-up
        for i in 20..40 {
            set(&mut bars, i, 104.0, 104.5, 103.5, 104.0);
        }
        let detector = fire_at(&bars, 10, long(95.0, 150.0));
        let mut cfg = config();
        cfg.trailing_atr_multiple = Some(2.0);

        let trade = &run(&cfg, &detector, bars).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopHit);
        assert!(trade.final_stop > 95.0);
        assert!(trade.exit_price > 100.0);
    }

    #[test]
    fn test_one_trade_policy_is_configurable() {
        let bars = make_bars(30, 100.0);
        let detector = Scripted {
            timeframe: Timeframe::M1,
            fires: vec![
                (bars[10].timestamp, long(99.0, 110.0)),
                (bars[12].timestamp, long(99.0, 110.0)),
            ],
        };
        assert_eq!(run(&config(), &detector, bars.clone()).trades.len(), 1);

        let mut cfg = config();
        cfg.one_trade_per_symbol = false;
        let report = run(&cfg, &detector, bars);
        assert_eq!(report.trades.len(), 2);
        assert!(report.trades.iter().all(|t| t.exit_reason == ExitReason::Eod));
    }

    #[test]
    fn test_min_score_filters_signals() {
        let bars = make_bars(30, 100.0);
        let detector = fire_at(&bars, 10, long(99.0, 110.0));
        let mut cfg = config();
        cfg.params.min_score = 90.0;
        assert!(run(&cfg, &detector, bars).trades.is_empty());
    }

    #[test]
    fn test_atr_stop_and_r_multiple_target() {
        let mut bars = make_bars(30, 100.0);
        for i in 0..30 {
            set(&mut bars, i, 100.0, 100.5, 99.5, 100.0);
        }
        let detector = fire_at(&bars, 20, Detection::new(Direction::Short, "test", 80.0));
        let mut cfg = config();
        cfg.params.stop_multiple = 2.0;
        cfg.params.target_multiple = 3.0;

        let trade = &run(&cfg, &detector, bars).trades[0];
        // ATR of a constant 1.0 range
        assert_eq!(trade.initial_stop, 102.0);
        assert_eq!(trade.target_price, 94.0);
        assert_eq!(trade.direction, Direction::Short);
    }

    #[test]
    fn test_signal_without_atr_is_discarded() {
        let bars = make_bars(30, 100.0);
        let detector = Scripted {
            timeframe: Timeframe::M5,
            fires: vec![(bars[9].timestamp, Detection::new(Direction::Long, "test", 80.0))],
        };
        // 5m series not loaded, so no strategy-timeframe ATR
        assert!(run(&config(), &detector, bars).trades.is_empty());
    }

    #[test]
    fn test_half_spread_slippage() {
        let mut bars = make_bars(30, 100.0);
        bars[11].quote = Some(Quote { bid: 99.9, ask: 100.1 });
        let detector = fire_at(&bars, 10, long(99.0, 110.0));
        let mut cfg = config();
        cfg.slippage = SlippageModel::HalfSpread { fallback: 0.01 };

        let trade = &run(&cfg, &detector, bars).trades[0];
        assert!((trade.slippage - 0.1).abs() < 1e-9);
        assert!((trade.r_multiple + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_session_end_close() {
        let mut bars = make_bars(30, 100.0);
        // second half belongs to the next UTC day
        for (j, bar) in bars.iter_mut().enumerate().skip(15) {
            bar.timestamp = T0 + 86_400_000 + j as i64 * MINUTE_MS;
        }
        let detector = fire_at(&bars, 10, long(99.0, 110.0));
        let mut cfg = config();
        cfg.close_at_session_end = true;

        let trade = &run(&cfg, &detector, bars.clone()).trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Eod);
        assert_eq!(trade.exit_timestamp, bars[14].timestamp);
    }

    #[test]
    fn test_insufficient_symbol_is_skipped() {
        let detector = fire_at(&make_bars(30, 100.0), 10, long(99.0, 110.0));
        let report = BacktestEngine::run(
            &config(),
            &detector,
            &[data(make_bars(30, 100.0)), SymbolData::new("THIN", BTreeMap::from([(Timeframe::M1, make_bars(3, 10.0))]))],
        )
        .unwrap();
        assert_eq!(report.skipped_symbols, vec!["THIN".to_string()]);
        assert_eq!(report.per_symbol.len(), 1);
    }

    #[test]
    fn test_fails_fast_without_symbols() {
        let detector = fire_at(&make_bars(30, 100.0), 10, long(99.0, 110.0));
        assert_eq!(
            BacktestEngine::run(&config(), &detector, &[]).err(),
            Some(EngineError::NoSymbols)
        );
    }

    #[test]
    fn test_required_timeframes() {
        assert_eq!(
            required_timeframes(Timeframe::M1, Timeframe::M5),
            vec![Timeframe::M1, Timeframe::M5, Timeframe::H1, Timeframe::D1]
        );
        assert_eq!(
            required_timeframes(Timeframe::H1, Timeframe::M15),
            vec![Timeframe::H1, Timeframe::D1]
        );
    }

    #[test]
    fn test_replay_matches_run() {
        let mut bars = make_bars(60, 100.0);
        set(&mut bars, 20, 100.0, 101.0, 99.5, 100.5);
        set(&mut bars, 30, 100.0, 100.2, 97.0, 97.5);
        let detector = Scripted {
            timeframe: Timeframe::M1,
            fires: vec![
                (bars[12].timestamp, long(99.0, 101.0)),
                (bars[25].timestamp, long(98.0, 104.0)),
            ],
        };
        let cfg = config();
        let d = data(bars);

        let direct = BacktestEngine::run(&cfg, &detector, &[d.clone()]).unwrap();
        let tape = SignalTape::record(&detector, &d, &cfg);
        let replayed = BacktestEngine::replay(&cfg, &[(d, tape)]).unwrap();
        assert_eq!(direct, replayed);
        assert_eq!(direct.trades.len(), 2);
    }
}
