//! Statistics over closed trades
//!
//! `BacktestStats::from_trades` is a pure reduction. Floating-point sums are
//! taken over sorted values and the drawdown walk uses a canonical trade
//! order, so any permutation of the same trades gives bit-identical output.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::{CompletedTrade, ExitReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// wins / total, 0 when there are no trades
    pub win_rate: f64,
    pub gross_profit_pct: f64,
    pub gross_loss_pct: f64,
    /// +∞ with profit and no loss, 0 with neither. Serialized as `"inf"`
    /// when infinite so exported stats read back unchanged.
    #[serde(with = "profit_factor_repr")]
    pub profit_factor: f64,
    /// Mean R-multiple
    pub expectancy: f64,
    pub avg_win_r: f64,
    pub avg_loss_r: f64,
    pub total_r: f64,
    pub max_drawdown_r: f64,
    pub avg_bars_winners: f64,
    pub avg_bars_losers: f64,
    pub exit_reasons: BTreeMap<ExitReason, usize>,
}

impl Default for BacktestStats {
    fn default() -> Self {
        Self::from_trades(&[])
    }
}

fn sorted_sum(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().fold(0.0, |acc, v| acc + v)
}

fn mean(values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    sorted_sum(values) / n
}

mod profit_factor_repr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    const INFINITE: &str = "inf";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if *value == f64::INFINITY {
            serializer.serialize_str(INFINITE)
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(t) if t == INFINITE => Ok(f64::INFINITY),
            Repr::Text(t) => Err(de::Error::custom(format!("invalid profit factor {t:?}"))),
        }
    }
}

fn canonical_order(a: &CompletedTrade, b: &CompletedTrade) -> Ordering {
    a.exit_timestamp
        .cmp(&b.exit_timestamp)
        .then(a.entry_timestamp.cmp(&b.entry_timestamp))
        .then_with(|| a.symbol.cmp(&b.symbol))
        .then_with(|| a.r_multiple.total_cmp(&b.r_multiple))
}

impl BacktestStats {
    pub fn from_trades(trades: &[CompletedTrade]) -> Self {
        let total = trades.len();
        let (winners, losers): (Vec<&CompletedTrade>, Vec<&CompletedTrade>) =
            trades.iter().partition(|t| t.is_win());

        let gross_profit_pct = sorted_sum(winners.iter().map(|t| t.pnl_pct).collect());
        let gross_loss_pct = sorted_sum(
            trades
                .iter()
                .filter(|t| t.pnl_pct < 0.0)
                .map(|t| -t.pnl_pct)
                .collect(),
        );
        let profit_factor = if gross_loss_pct > 0.0 {
            gross_profit_pct / gross_loss_pct
        } else if gross_profit_pct > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let total_r = sorted_sum(trades.iter().map(|t| t.r_multiple).collect());

        let mut ordered: Vec<&CompletedTrade> = trades.iter().collect();
        ordered.sort_by(|a, b| canonical_order(a, b));
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown_r = 0.0_f64;
        for t in ordered {
            equity += t.r_multiple;
            peak = peak.max(equity);
            max_drawdown_r = max_drawdown_r.max(peak - equity);
        }

        let mut exit_reasons = BTreeMap::new();
        for t in trades {
            *exit_reasons.entry(t.exit_reason).or_insert(0) += 1;
        }

        Self {
            total_trades: total,
            wins: winners.len(),
            losses: losers.len(),
            win_rate: if total > 0 {
                winners.len() as f64 / total as f64
            } else {
                0.0
            },
            gross_profit_pct,
            gross_loss_pct,
            profit_factor,
            expectancy: if total > 0 { total_r / total as f64 } else { 0.0 },
            avg_win_r: mean(winners.iter().map(|t| t.r_multiple).collect()),
            avg_loss_r: mean(losers.iter().map(|t| t.r_multiple).collect()),
            total_r,
            max_drawdown_r,
            avg_bars_winners: mean(winners.iter().map(|t| t.bars_held as f64).collect()),
            avg_bars_losers: mean(losers.iter().map(|t| t.bars_held as f64).collect()),
            exit_reasons,
        }
    }
}
