//! Strategy detectors
//!
//! A detector looks at one [`FeatureSnapshot`] and either stays quiet or
//! returns a scored [`Detection`]. Detectors are pure: the engine may call
//! them in any order and memoise their output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureSnapshot, RSI_PERIOD};
use crate::types::{Direction, Timeframe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub direction: Direction,
    /// Setup type reported on the trade
    pub kind: String,
    /// 0..=100
    pub score: f64,
    /// Detector-supplied levels override the ATR/R-multiple defaults
    pub stop: Option<f64>,
    pub target: Option<f64>,
    /// Named components behind the score
    pub why: BTreeMap<String, f64>,
}

impl Detection {
    pub fn new(direction: Direction, kind: impl Into<String>, score: f64) -> Self {
        Self {
            direction,
            kind: kind.into(),
            score: score.clamp(0.0, 100.0),
            stop: None,
            target: None,
            why: BTreeMap::new(),
        }
    }

    pub fn with_stop(mut self, stop: f64) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }

    pub fn because(mut self, reason: &str, value: f64) -> Self {
        self.why.insert(reason.to_string(), value);
        self
    }
}

pub trait Detector: Send + Sync {
    fn id(&self) -> &'static str;

    /// The detector's own bar resolution; signals are only taken when a bar of it closes
    fn timeframe(&self) -> Timeframe;

    fn detect(&self, snapshot: &FeatureSnapshot) -> Option<Detection>;
}

// ============================================================================
// Registry
// ============================================================================

type Constructor = fn() -> Arc<dyn Detector>;

fn ema_trend() -> Arc<dyn Detector> {
    Arc::new(EmaTrend)
}

fn orb_breakout() -> Arc<dyn Detector> {
    Arc::new(OrbBreakout::default())
}

fn rsi_reversion() -> Arc<dyn Detector> {
    Arc::new(RsiReversion::default())
}

static REGISTRY: &[(&str, Constructor)] = &[
    ("ema_trend", ema_trend),
    ("orb_breakout", orb_breakout),
    ("rsi_reversion", rsi_reversion),
];

/// Static table of known strategy ids
pub struct DetectorRegistry;

impl DetectorRegistry {
    pub fn resolve(id: &str) -> EngineResult<Arc<dyn Detector>> {
        REGISTRY
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, build)| build())
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))
    }

    pub fn ids() -> Vec<&'static str> {
        REGISTRY.iter().map(|(name, _)| *name).collect()
    }
}

// ============================================================================
// Reference detectors
// ============================================================================

/// EMA 9/21 alignment on 5m bars, confirmed by price versus session VWAP
pub struct EmaTrend;

impl Detector for EmaTrend {
    fn id(&self) -> &'static str {
        "ema_trend"
    }

    fn timeframe(&self) -> Timeframe {
        Timeframe::M5
    }

    fn detect(&self, snapshot: &FeatureSnapshot) -> Option<Detection> {
        let tf = snapshot.timeframe(self.timeframe())?;
        let (fast, slow) = (tf.ema(9)?, tf.ema(21)?);
        let vwap = snapshot.vwap?;

        let direction = if fast > slow && tf.close > fast && snapshot.price > vwap {
            Direction::Long
        } else if fast < slow && tf.close < fast && snapshot.price < vwap {
            Direction::Short
        } else {
            return None;
        };

        let spread_pct = if slow != 0.0 { (fast - slow).abs() / slow * 100.0 } else { 0.0 };
        let spread_score = (spread_pct * 50.0).min(25.0);
        let momentum = match (direction, tf.rsi(RSI_PERIOD)) {
            (Direction::Long, Some(r)) if (50.0..70.0).contains(&r) => 15.0,
            (Direction::Short, Some(r)) if r > 30.0 && r <= 50.0 => 15.0,
            _ => 0.0,
        };

        Some(
            Detection::new(direction, "ema_trend", 50.0 + spread_score + momentum)
                .because("ema_spread_pct", spread_pct)
                .because("momentum", momentum),
        )
    }
}

/// Close beyond the opening range on expanding volume; stop at the far side of the range
pub struct OrbBreakout {
    pub min_relative_volume: f64,
}

impl Default for OrbBreakout {
    fn default() -> Self {
        Self {
            min_relative_volume: 1.5,
        }
    }
}

impl Detector for OrbBreakout {
    fn id(&self) -> &'static str {
        "orb_breakout"
    }

    fn timeframe(&self) -> Timeframe {
        Timeframe::M5
    }

    fn detect(&self, snapshot: &FeatureSnapshot) -> Option<Detection> {
        let orb = snapshot.patterns.orb?;
        let tf = snapshot.timeframe(self.timeframe())?;
        let prev = tf.prev_close?;
        let rvol = snapshot.relative_volume?;
        if rvol < self.min_relative_volume {
            return None;
        }

        let (direction, stop) = if tf.close > orb.high && prev <= orb.high {
            (Direction::Long, orb.low)
        } else if tf.close < orb.low && prev >= orb.low {
            (Direction::Short, orb.high)
        } else {
            return None;
        };

        let volume_score = ((rvol - self.min_relative_volume) * 10.0).min(30.0);
        Some(
            Detection::new(direction, "orb_breakout", 60.0 + volume_score)
                .with_stop(stop)
                .because("relative_volume", rvol)
                .because("orb_width", orb.high - orb.low),
        )
    }
}

/// RSI extremes pressed against the Bollinger bands, targeting the middle band
pub struct RsiReversion {
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiReversion {
    fn default() -> Self {
        Self {
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl Detector for RsiReversion {
    fn id(&self) -> &'static str {
        "rsi_reversion"
    }

    fn timeframe(&self) -> Timeframe {
        Timeframe::M15
    }

    fn detect(&self, snapshot: &FeatureSnapshot) -> Option<Detection> {
        let tf = snapshot.timeframe(self.timeframe())?;
        let rsi = tf.rsi(RSI_PERIOD)?;
        let bands = tf.bollinger?;

        let (direction, stretch) = if rsi < self.oversold && bands.percent_b < 0.1 {
            (Direction::Long, self.oversold - rsi)
        } else if rsi > self.overbought && bands.percent_b > 0.9 {
            (Direction::Short, rsi - self.overbought)
        } else {
            return None;
        };

        Some(
            Detection::new(direction, "rsi_reversion", 50.0 + stretch * 2.0)
                .with_target(bands.middle)
                .because("rsi", rsi)
                .because("percent_b", bands.percent_b),
        )
    }
}
