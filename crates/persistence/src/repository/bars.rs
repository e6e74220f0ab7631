//! Historical bar repository: the primary store queried by the data loader

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One stored OHLCV row. Prices are decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BarRecord {
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub bid: Option<String>,
    pub ask: Option<String>,
    pub source: Option<String>,
}

/// First/last timestamp and row count stored for a (symbol, timeframe)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarCoverage {
    pub first: i64,
    pub last: i64,
    pub count: i64,
}

pub struct BarRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BarRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch of bars in one transaction. Returns rows written.
    pub async fn insert_bars(&self, bars: &[BarRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO bars (
                    symbol, timeframe, timestamp, open, high, low, close, volume, bid, ask, source
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&bar.symbol)
            .bind(&bar.timeframe)
            .bind(bar.timestamp)
            .bind(&bar.open)
            .bind(&bar.high)
            .bind(&bar.low)
            .bind(&bar.close)
            .bind(&bar.volume)
            .bind(&bar.bid)
            .bind(&bar.ask)
            .bind(&bar.source)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Bars for `[start, end]` ordered by timestamp
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start: i64,
        end: i64,
    ) -> DbResult<Vec<BarRecord>> {
        let records = sqlx::query_as::<_, BarRecord>(
            r#"
            SELECT symbol, timeframe, timestamp, open, high, low, close, volume, bid, ask, source
            FROM bars
            WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
            ORDER BY timestamp ASC
            "#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Stored range for a (symbol, timeframe), `None` when nothing is stored
    pub async fn coverage(&self, symbol: &str, timeframe: &str) -> DbResult<Option<BarCoverage>> {
        let row: (Option<i64>, Option<i64>, i64) = sqlx::query_as(
            "SELECT MIN(timestamp), MAX(timestamp), COUNT(*) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe)
        .fetch_one(self.pool)
        .await?;

        Ok(match row {
            (Some(first), Some(last), count) if count > 0 => Some(BarCoverage { first, last, count }),
            _ => None,
        })
    }
}
