//! Order-flow event repository (sweeps and block prints)

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowEventRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub timestamp: i64,
    /// "sweep" or "block"
    pub kind: String,
    /// "bullish" or "bearish"
    pub side: String,
    pub premium: String,
    pub size: String,
}

pub struct FlowRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FlowRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_events(&self, events: &[FlowEventRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for event in events {
            let result = sqlx::query(
                "INSERT INTO flow_events (symbol, timestamp, kind, side, premium, size) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.symbol)
            .bind(event.timestamp)
            .bind(&event.kind)
            .bind(&event.side)
            .bind(&event.premium)
            .bind(&event.size)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// All events for a symbol in `[start, end]`, oldest first. No filtering by kind.
    pub async fn get_events(&self, symbol: &str, start: i64, end: i64) -> DbResult<Vec<FlowEventRecord>> {
        let records = sqlx::query_as::<_, FlowEventRecord>(
            r#"SELECT id, symbol, timestamp, kind, side, premium, size
               FROM flow_events
               WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3
               ORDER BY timestamp ASC, id ASC"#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_events_roundtrip_in_range() {
        let db = Database::in_memory().await.unwrap();
        let repo = FlowRepository::new(db.pool());

        let make = |ts: i64, kind: &str| FlowEventRecord {
            id: None,
            symbol: "AAPL".to_string(),
            timestamp: ts,
            kind: kind.to_string(),
            side: "bullish".to_string(),
            premium: "250000".to_string(),
            size: "100".to_string(),
        };

        repo.insert_events(&[make(300, "block"), make(100, "sweep"), make(900, "sweep")])
            .await
            .unwrap();

        let events = repo.get_events("AAPL", 0, 500).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "sweep");
        assert_eq!(events[1].timestamp, 300);
        assert!(repo.get_events("MSFT", 0, 1000).await.unwrap().is_empty());
    }
}
