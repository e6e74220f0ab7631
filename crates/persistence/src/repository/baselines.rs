//! Strategy baselines: expectancy recorded for the parameters currently live

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BaselineRecord {
    pub id: Option<i64>,
    pub strategy: String,
    pub expectancy: String,
    pub total_trades: i64,
    pub win_rate: String,
    pub profit_factor: String,
    pub recorded_at: Option<i64>,
}

pub struct BaselineRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BaselineRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, record: &BaselineRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO strategy_baselines (strategy, expectancy, total_trades, win_rate, profit_factor)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.strategy)
        .bind(&record.expectancy)
        .bind(record.total_trades)
        .bind(&record.win_rate)
        .bind(&record.profit_factor)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recently recorded baseline for a strategy
    pub async fn latest(&self, strategy: &str) -> DbResult<Option<BaselineRecord>> {
        let record = sqlx::query_as::<_, BaselineRecord>(
            r#"SELECT id, strategy, expectancy, total_trades, win_rate, profit_factor, recorded_at
               FROM strategy_baselines
               WHERE strategy = ?1
               ORDER BY recorded_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(strategy)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }
}
