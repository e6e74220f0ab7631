//! Core value types shared by the loader, features builder and engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub const MINUTE_MS: i64 = 60_000;

/// Bar resolution. Ordered finest → coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn all() -> &'static [Timeframe] {
        &[
            Self::M1,
            Self::M5,
            Self::M15,
            Self::M30,
            Self::H1,
            Self::H4,
            Self::D1,
        ]
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
        }
    }

    pub fn millis(&self) -> i64 {
        self.minutes() * MINUTE_MS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Open time of the bucket containing `timestamp`
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.millis())
    }

    /// Whether a bar of `base` resolution opening at `timestamp` is the last
    /// one of a bucket of this timeframe (its close lands on the boundary).
    pub fn closes_bucket(&self, base: Timeframe, timestamp: i64) -> bool {
        (timestamp + base.millis()).rem_euclid(self.millis()) == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::all()
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown timeframe '{s}'")))
    }
}

/// Last bid/ask seen during a bar, when the provider supplies it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn half_spread(&self) -> Option<f64> {
        let spread = self.ask - self.bid;
        (spread.is_finite() && spread >= 0.0).then_some(spread / 2.0)
    }
}

/// A single OHLCV sample. `timestamp` is the bar open time in epoch ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
}

impl Bar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            quote: None,
        }
    }

    /// `high ≥ max(open, close) ≥ min(open, close) ≥ low`, all finite, volume non-negative
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.volume >= 0.0
            && self.high >= self.open.max(self.close)
            && self.open.min(self.close) >= self.low
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Sort by timestamp, drop invalid bars and duplicate timestamps (first wins).
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.retain(Bar::is_valid);
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    bars
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Sweep,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSide {
    Bullish,
    Bearish,
}

/// A discrete order-flow print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub symbol: String,
    pub timestamp: i64,
    pub kind: FlowKind,
    pub side: FlowSide,
    pub premium: f64,
    pub size: f64,
}

/// Why a simulated trade closed. Serialized names are consumed by reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TargetHit,
    StopHit,
    MaxHold,
    Eod,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TargetHit => "TARGET_HIT",
            Self::StopHit => "STOP_HIT",
            Self::MaxHold => "MAX_HOLD",
            Self::Eod => "EOD",
        };
        f.write_str(s)
    }
}

/// A trade while it is open. Owned by the engine's active list only.
#[derive(Debug, Clone)]
pub struct ActiveTrade {
    pub symbol: String,
    pub strategy: String,
    pub kind: String,
    pub direction: Direction,
    pub score: f64,
    pub signal_timestamp: i64,
    pub entry_timestamp: i64,
    pub entry_index: usize,
    pub entry_price: f64,
    pub target: f64,
    pub initial_stop: f64,
    pub stop: f64,
    pub breakeven_moved: bool,
    pub trimmed: bool,
    /// Per-share slippage charged on close
    pub slippage: f64,
}

impl ActiveTrade {
    /// Entry-to-initial-stop distance; fixed for the life of the trade
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Unrealized R at `price`
    pub fn r_at(&self, price: f64) -> f64 {
        let risk = self.initial_risk();
        if risk <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / risk
    }

    /// Consume the open trade into its immutable record.
    ///
    /// A trimmed trade books half its size at `trim_at_r` and half at `exit_price`.
    pub fn close(
        self,
        exit_price: f64,
        exit_timestamp: i64,
        exit_index: usize,
        reason: ExitReason,
        trim_at_r: f64,
    ) -> CompletedTrade {
        let risk = self.initial_risk();
        let sign = self.direction.sign();
        let final_move = sign * (exit_price - self.entry_price);
        let gross = if self.trimmed {
            0.5 * (trim_at_r * risk) + 0.5 * final_move
        } else {
            final_move
        };
        let pnl = gross - self.slippage;
        let pnl_pct = if self.entry_price > 0.0 {
            pnl / self.entry_price * 100.0
        } else {
            0.0
        };
        let r_multiple = if risk > 0.0 { pnl / risk } else { 0.0 };

        CompletedTrade {
            symbol: self.symbol,
            strategy: self.strategy,
            kind: self.kind,
            direction: self.direction,
            score: self.score,
            signal_timestamp: self.signal_timestamp,
            entry_timestamp: self.entry_timestamp,
            entry_price: self.entry_price,
            target_price: self.target,
            initial_stop: self.initial_stop,
            final_stop: self.stop,
            exit_timestamp,
            exit_price,
            exit_reason: reason,
            trimmed: self.trimmed,
            slippage: self.slippage,
            pnl,
            pnl_pct,
            r_multiple,
            bars_held: exit_index.saturating_sub(self.entry_index) + 1,
        }
    }
}

/// A closed trade. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub symbol: String,
    pub strategy: String,
    pub kind: String,
    pub direction: Direction,
    pub score: f64,
    pub signal_timestamp: i64,
    pub entry_timestamp: i64,
    pub entry_price: f64,
    pub target_price: f64,
    pub initial_stop: f64,
    pub final_stop: f64,
    pub exit_timestamp: i64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub trimmed: bool,
    pub slippage: f64,
    /// Per-share PnL after slippage
    pub pnl: f64,
    pub pnl_pct: f64,
    pub r_multiple: f64,
    /// Base-resolution bars from entry through exit, inclusive
    pub bars_held: usize,
}

impl CompletedTrade {
    pub fn is_win(&self) -> bool {
        self.r_multiple > 0.0
    }
}
