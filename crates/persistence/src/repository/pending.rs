//! Optimizer results stored as pending parameters awaiting approval

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingParamsRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub strategy: String,
    /// JSON-encoded parameter vector
    pub params: String,
    pub baseline_expectancy: Option<String>,
    pub new_expectancy: String,
    pub improvement_pct: Option<String>,
    /// JSON-encoded statistics of the winning run
    pub stats: String,
    pub status: String,
    pub generations_run: Option<i64>,
    pub created_at: Option<i64>,
}

pub struct PendingParamsRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PendingParamsRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a result (INSERT OR IGNORE, skips if params_hash already exists).
    /// Returns true when a new row was written.
    pub async fn save(&self, record: &PendingParamsRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_parameters (
                params_hash, strategy, params, baseline_expectancy, new_expectancy,
                improvement_pct, stats, status, generations_run
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.strategy)
        .bind(&record.params)
        .bind(&record.baseline_expectancy)
        .bind(&record.new_expectancy)
        .bind(&record.improvement_pct)
        .bind(&record.stats)
        .bind(&record.status)
        .bind(record.generations_run)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_pending(&self, strategy: Option<&str>) -> DbResult<Vec<PendingParamsRecord>> {
        let mut sql = String::from(
            r#"SELECT id, params_hash, strategy, params, baseline_expectancy, new_expectancy,
                      improvement_pct, stats, status, generations_run, created_at
               FROM pending_parameters
               WHERE status = 'pending'"#,
        );
        if strategy.is_some() {
            sql.push_str(" AND strategy = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut query = sqlx::query_as::<_, PendingParamsRecord>(&sql);
        if let Some(s) = strategy {
            query = query.bind(s);
        }

        Ok(query.fetch_all(self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn pending(hash: &str, strategy: &str) -> PendingParamsRecord {
        PendingParamsRecord {
            id: None,
            params_hash: hash.to_string(),
            strategy: strategy.to_string(),
            params: r#"{"target_multiple":2.0}"#.to_string(),
            baseline_expectancy: Some("0.1".to_string()),
            new_expectancy: "0.3".to_string(),
            improvement_pct: Some("200".to_string()),
            stats: "{}".to_string(),
            status: "pending".to_string(),
            generations_run: Some(10),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_skips_duplicate_hash() {
        let db = Database::in_memory().await.unwrap();
        let repo = PendingParamsRepository::new(db.pool());

        assert!(repo.save(&pending("abc", "ema_trend")).await.unwrap());
        assert!(!repo.save(&pending("abc", "ema_trend")).await.unwrap());
        repo.save(&pending("def", "orb_breakout")).await.unwrap();

        assert_eq!(repo.list_pending(None).await.unwrap().len(), 2);
        let ema = repo.list_pending(Some("ema_trend")).await.unwrap();
        assert_eq!(ema.len(), 1);
        assert_eq!(ema[0].generations_run, Some(10));
    }
}
