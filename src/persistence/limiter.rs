use std::path::Path;

use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};

use crate::{
    error::PolygateError,
    persistence::{
        conn::{ensure_table, open_sqlite},
        entities::EntityRequestLimit,
    },
};

/// Atomic per-day request counters keyed by (api_key, model, day).
/// Backs daily request limits that must survive process restarts.
pub struct DailyLimiter {
    db: DatabaseConnection,
}

impl DailyLimiter {
    pub async fn new(path: &Path) -> Result<Self, PolygateError> {
        let db = open_sqlite(path).await?;
        Self::with_conn(db).await
    }

    pub async fn with_conn(db: DatabaseConnection) -> Result<Self, PolygateError> {
        ensure_table(&db, EntityRequestLimit).await?;
        Ok(Self { db })
    }

    /// Increments the counter for (api_key, model, day) by one unless doing
    /// so would exceed `limit`. Returns the resulting count and whether the
    /// increment was allowed. The increment and the limit check are one
    /// statement, so concurrent callers cannot push the row past the limit.
    pub async fn consume(
        &self,
        api_key: &str,
        model: &str,
        day: &str,
        limit: i64,
    ) -> Result<(i64, bool), PolygateError> {
        let api_key = api_key.trim();
        let model = model.trim().to_lowercase();
        let day = day.trim();
        if api_key.is_empty() || model.is_empty() || day.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "limiter: api key, model and day are required".to_string(),
            });
        }
        if limit <= 0 {
            return Ok((0, false));
        }

        let now = Utc::now().timestamp();
        let stmt = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            r#"
            INSERT INTO api_model_daily_usage (api_key, model, day, count, updated_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(api_key, model, day)
            DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
            WHERE api_model_daily_usage.count < ?
            RETURNING count
            "#,
            [
                api_key.into(),
                model.into(),
                day.into(),
                now.into(),
                limit.into(),
            ],
        );

        match self.db.query_one(stmt).await? {
            Some(row) => {
                let count: i64 = row.try_get("", "count")?;
                Ok((count, true))
            }
            // the conditional update matched nothing: the row is at the limit
            None => Ok((limit, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::conn::open_sqlite_memory;

    async fn memory_limiter() -> DailyLimiter {
        let db = open_sqlite_memory().await.unwrap();
        DailyLimiter::with_conn(db).await.unwrap()
    }

    #[tokio::test]
    async fn consume_counts_up_to_limit() {
        let limiter = memory_limiter().await;
        let day = "2026-02-08";

        let (count, allowed) = limiter.consume("k1", "claude-opus-4-6", day, 2).await.unwrap();
        assert_eq!((count, allowed), (1, true));
        let (count, allowed) = limiter.consume("k1", "claude-opus-4-6", day, 2).await.unwrap();
        assert_eq!((count, allowed), (2, true));
        let (count, allowed) = limiter.consume("k1", "claude-opus-4-6", day, 2).await.unwrap();
        assert_eq!((count, allowed), (2, false));
        // refusals do not advance the counter
        let (count, allowed) = limiter.consume("k1", "claude-opus-4-6", day, 2).await.unwrap();
        assert_eq!((count, allowed), (2, false));
    }

    #[tokio::test]
    async fn consume_normalises_model_case() {
        let limiter = memory_limiter().await;
        let day = "2026-02-08";
        limiter.consume("k1", "Claude-Opus-4-6", day, 2).await.unwrap();
        let (count, allowed) = limiter.consume("k1", "claude-opus-4-6", day, 2).await.unwrap();
        assert_eq!((count, allowed), (2, true));
    }

    #[tokio::test]
    async fn non_positive_limit_never_allows_and_never_writes() {
        let limiter = memory_limiter().await;
        let day = "2026-02-08";
        let (count, allowed) = limiter.consume("k1", "m", day, 0).await.unwrap();
        assert_eq!((count, allowed), (0, false));
        let (count, allowed) = limiter.consume("k1", "m", day, -3).await.unwrap();
        assert_eq!((count, allowed), (0, false));
        // the row was never created, so a real limit starts from scratch
        let (count, allowed) = limiter.consume("k1", "m", day, 1).await.unwrap();
        assert_eq!((count, allowed), (1, true));
    }

    #[tokio::test]
    async fn blank_inputs_are_rejected() {
        let limiter = memory_limiter().await;
        assert!(limiter.consume(" ", "m", "2026-02-08", 1).await.is_err());
        assert!(limiter.consume("k", "", "2026-02-08", 1).await.is_err());
        assert!(limiter.consume("k", "m", "", 1).await.is_err());
    }

    #[tokio::test]
    async fn counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.sqlite");
        let day = "2026-02-08";

        {
            let limiter = DailyLimiter::new(&path).await.unwrap();
            assert_eq!(
                limiter.consume("k1", "claude-opus-4-6", day, 1).await.unwrap(),
                (1, true)
            );
            assert_eq!(
                limiter.consume("k1", "claude-opus-4-6", day, 1).await.unwrap(),
                (1, false)
            );
        }

        let limiter = DailyLimiter::new(&path).await.unwrap();
        assert_eq!(
            limiter.consume("k1", "claude-opus-4-6", day, 1).await.unwrap(),
            (1, false),
            "counter must persist across restarts"
        );
    }
}
