use std::path::Path;

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Statement,
    sea_query::{Index, OnConflict},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::PolygateError,
    persistence::{
        conn::{ensure_index, ensure_table, open_sqlite},
        entities::{
            ActiveModelModelPrice, ColumnDailyUsage, ColumnModelPrice, EntityDailyUsage,
            EntityModelPrice,
        },
        prices::DEFAULT_PRICES,
    },
    policy::{normalise_model_key, strip_thinking_variant},
};

const TOKENS_PER_MILLION: i64 = 1_000_000;

/// USD pricing in micro-dollars per 1M tokens.
/// Example: $5 / 1M tokens => 5_000_000 micro-USD per 1M.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceMicroPer1M {
    pub prompt: i64,
    pub completion: i64,
    pub cached: i64,
}

/// Where a resolved price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Saved,
    Default,
    Missing,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Saved => "saved",
            PriceSource::Default => "default",
            PriceSource::Missing => "missing",
        }
    }
}

/// Price row shaped for the management API, in USD per 1M tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub prompt_usd_per_1m: f64,
    pub completion_usd_per_1m: f64,
    pub cached_usd_per_1m: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub updated_at: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Non-negative deltas merged into one (api_key, model, day) row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyUsageDelta {
    pub requests: i64,
    pub failed_requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub cost_micro_usd: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyUsageRow {
    pub api_key: String,
    pub model: String,
    pub day: String,
    pub requests: i64,
    pub failed_requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub cost_micro_usd: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyUsageReport {
    pub api_key: String,
    pub day: String,
    pub total_cost_micro_usd: i64,
    pub total_cost_usd: f64,
    pub total_requests: i64,
    pub total_failed_requests: i64,
    pub total_tokens: i64,
    pub models: Vec<DailyUsageRow>,
    pub generated_at_unix: i64,
}

/// USD per 1M tokens to micro-USD per 1M, rounded to the nearest integer.
pub fn usd_per_1m_to_micro(v: f64) -> i64 {
    if v <= 0.0 || !v.is_finite() {
        return 0;
    }
    (v * 1_000_000.0).round() as i64
}

pub fn micro_usd_to_usd(v: i64) -> f64 {
    if v == 0 {
        return 0.0;
    }
    v as f64 / 1_000_000.0
}

/// Cost of `tokens` at `rate` micro-USD per 1M tokens, rounded half up.
/// Half-up rounding at the record boundary keeps aggregates reproducible.
pub fn cost_micro_usd(tokens: i64, rate_micro_per_1m: i64) -> i64 {
    if tokens <= 0 || rate_micro_per_1m <= 0 {
        return 0;
    }
    (tokens * rate_micro_per_1m + TOKENS_PER_MILLION / 2) / TOKENS_PER_MILLION
}

/// Model prices and per-day usage aggregates, in one SQLite database.
pub struct BillingStore {
    db: DatabaseConnection,
}

impl BillingStore {
    pub async fn new(path: &Path) -> Result<Self, PolygateError> {
        let db = open_sqlite(path).await?;
        Self::with_conn(db).await
    }

    pub async fn with_conn(db: DatabaseConnection) -> Result<Self, PolygateError> {
        ensure_table(&db, EntityModelPrice).await?;
        ensure_table(&db, EntityDailyUsage).await?;
        ensure_index(
            &db,
            Index::create()
                .name("idx_api_key_model_daily_usage_api_day")
                .table(EntityDailyUsage)
                .col(ColumnDailyUsage::ApiKey)
                .col(ColumnDailyUsage::Day)
                .to_owned(),
        )
        .await?;
        Ok(Self { db })
    }

    pub async fn upsert_model_price(
        &self,
        model: &str,
        price: PriceMicroPer1M,
    ) -> Result<(), PolygateError> {
        let key = normalise_model_key(model);
        if key.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: model is required".to_string(),
            });
        }
        if price.prompt < 0 || price.completion < 0 || price.cached < 0 {
            return Err(PolygateError::InvalidInput {
                msg: "billing: prices must be >= 0".to_string(),
            });
        }
        let am = ActiveModelModelPrice {
            model: Set(key),
            prompt_micro_usd_per_1m: Set(price.prompt),
            completion_micro_usd_per_1m: Set(price.completion),
            cached_micro_usd_per_1m: Set(price.cached),
            updated_at: Set(Utc::now().timestamp()),
        };
        EntityModelPrice::insert(am)
            .on_conflict(
                OnConflict::column(ColumnModelPrice::Model)
                    .update_columns([
                        ColumnModelPrice::PromptMicroUsdPer1m,
                        ColumnModelPrice::CompletionMicroUsdPer1m,
                        ColumnModelPrice::CachedMicroUsdPer1m,
                        ColumnModelPrice::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Deletes a saved price override. Returns false when nothing was saved.
    pub async fn delete_model_price(&self, model: &str) -> Result<bool, PolygateError> {
        let key = normalise_model_key(model);
        if key.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: model is required".to_string(),
            });
        }
        let res = EntityModelPrice::delete_by_id(key).exec(&self.db).await?;
        Ok(res.rows_affected > 0)
    }

    async fn saved_price(
        &self,
        model_key: &str,
    ) -> Result<Option<(PriceMicroPer1M, i64)>, PolygateError> {
        let row = EntityModelPrice::find_by_id(model_key.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|m| {
            (
                PriceMicroPer1M {
                    prompt: m.prompt_micro_usd_per_1m,
                    completion: m.completion_micro_usd_per_1m,
                    cached: m.cached_micro_usd_per_1m,
                },
                m.updated_at,
            )
        }))
    }

    /// Resolution order: saved override on the exact key, saved override on
    /// the thinking-stripped base, built-in default on the exact key,
    /// built-in default on the base, missing.
    pub async fn resolve_price_micro(
        &self,
        model: &str,
    ) -> Result<(PriceMicroPer1M, PriceSource, i64), PolygateError> {
        let model_key = normalise_model_key(model);
        if model_key.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: model is required".to_string(),
            });
        }
        let base_key = strip_thinking_variant(&model_key);

        if let Some((price, updated)) = self.saved_price(&model_key).await? {
            return Ok((price, PriceSource::Saved, updated));
        }
        if base_key != model_key
            && let Some((price, updated)) = self.saved_price(&base_key).await?
        {
            return Ok((price, PriceSource::Saved, updated));
        }
        if let Some(price) = DEFAULT_PRICES.get(model_key.as_str()) {
            return Ok((*price, PriceSource::Default, 0));
        }
        if base_key != model_key
            && let Some(price) = DEFAULT_PRICES.get(base_key.as_str())
        {
            return Ok((*price, PriceSource::Default, 0));
        }
        Ok((PriceMicroPer1M::default(), PriceSource::Missing, 0))
    }

    /// Merged price view: saved overrides shadow defaults, sorted by model.
    pub async fn list_model_prices(&self) -> Result<Vec<ModelPrice>, PolygateError> {
        let saved = EntityModelPrice::find()
            .order_by_asc(ColumnModelPrice::Model)
            .all(&self.db)
            .await?;

        let mut merged: Vec<ModelPrice> = Vec::with_capacity(saved.len() + DEFAULT_PRICES.len());
        for row in &saved {
            merged.push(ModelPrice {
                model: row.model.to_owned(),
                prompt_usd_per_1m: micro_usd_to_usd(row.prompt_micro_usd_per_1m),
                completion_usd_per_1m: micro_usd_to_usd(row.completion_micro_usd_per_1m),
                cached_usd_per_1m: micro_usd_to_usd(row.cached_micro_usd_per_1m),
                source: PriceSource::Saved.as_str().to_string(),
                updated_at: row.updated_at,
            });
        }
        for (model, price) in DEFAULT_PRICES.iter() {
            if saved.iter().any(|s| s.model == *model) {
                continue;
            }
            merged.push(ModelPrice {
                model: model.to_string(),
                prompt_usd_per_1m: micro_usd_to_usd(price.prompt),
                completion_usd_per_1m: micro_usd_to_usd(price.completion),
                cached_usd_per_1m: micro_usd_to_usd(price.cached),
                source: PriceSource::Default.as_str().to_string(),
                updated_at: 0,
            });
        }
        merged.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(merged)
    }

    /// Adds a non-negative delta to the (api_key, model, day) row. Counters
    /// only ever grow; negative fields in the delta are clamped to zero.
    pub async fn add_usage(
        &self,
        api_key: &str,
        model: &str,
        day: &str,
        delta: DailyUsageDelta,
    ) -> Result<(), PolygateError> {
        let api_key = api_key.trim();
        let model_key = normalise_model_key(model);
        let day = day.trim();
        if api_key.is_empty() || model_key.is_empty() || day.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: api key, model and day are required".to_string(),
            });
        }

        let now = Utc::now().timestamp();
        let stmt = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            r#"
            INSERT INTO api_key_model_daily_usage (
                api_key, model, day,
                requests, failed_requests,
                input_tokens, output_tokens, reasoning_tokens, cached_tokens, total_tokens,
                cost_micro_usd, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(api_key, model, day) DO UPDATE SET
                requests = requests + excluded.requests,
                failed_requests = failed_requests + excluded.failed_requests,
                input_tokens = input_tokens + excluded.input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                reasoning_tokens = reasoning_tokens + excluded.reasoning_tokens,
                cached_tokens = cached_tokens + excluded.cached_tokens,
                total_tokens = total_tokens + excluded.total_tokens,
                cost_micro_usd = cost_micro_usd + excluded.cost_micro_usd,
                updated_at = excluded.updated_at
            "#,
            [
                api_key.into(),
                model_key.into(),
                day.into(),
                delta.requests.max(0).into(),
                delta.failed_requests.max(0).into(),
                delta.input_tokens.max(0).into(),
                delta.output_tokens.max(0).into(),
                delta.reasoning_tokens.max(0).into(),
                delta.cached_tokens.max(0).into(),
                delta.total_tokens.max(0).into(),
                delta.cost_micro_usd.max(0).into(),
                now.into(),
            ],
        );
        self.db.execute(stmt).await?;
        Ok(())
    }

    /// Total spend for a key on one accounting day, in micro-USD.
    pub async fn get_daily_cost_micro(
        &self,
        api_key: &str,
        day: &str,
    ) -> Result<i64, PolygateError> {
        let api_key = api_key.trim();
        let day = day.trim();
        if api_key.is_empty() || day.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: api key and day are required".to_string(),
            });
        }
        let stmt = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            r#"
            SELECT COALESCE(SUM(cost_micro_usd), 0) AS total
            FROM api_key_model_daily_usage
            WHERE api_key = ? AND day = ?
            "#,
            [api_key.into(), day.into()],
        );
        let row = self.db.query_one(stmt).await?;
        Ok(row.map_or(0, |r| r.try_get::<i64>("", "total").unwrap_or(0)))
    }

    /// Per-model rows plus totals for one key and accounting day.
    pub async fn get_daily_usage_report(
        &self,
        api_key: &str,
        day: &str,
    ) -> Result<DailyUsageReport, PolygateError> {
        let api_key = api_key.trim().to_string();
        let day = day.trim().to_string();
        if api_key.is_empty() || day.is_empty() {
            return Err(PolygateError::InvalidInput {
                msg: "billing: api_key and day are required".to_string(),
            });
        }
        let mut report = DailyUsageReport {
            api_key: api_key.to_owned(),
            day: day.to_owned(),
            generated_at_unix: Utc::now().timestamp(),
            ..Default::default()
        };

        let rows = EntityDailyUsage::find()
            .filter(ColumnDailyUsage::ApiKey.eq(api_key))
            .filter(ColumnDailyUsage::Day.eq(day))
            .order_by_asc(ColumnDailyUsage::Model)
            .all(&self.db)
            .await?;

        for row in rows {
            report.total_cost_micro_usd += row.cost_micro_usd;
            report.total_requests += row.requests;
            report.total_failed_requests += row.failed_requests;
            report.total_tokens += row.total_tokens;
            report.models.push(DailyUsageRow {
                api_key: row.api_key,
                model: row.model,
                day: row.day,
                requests: row.requests,
                failed_requests: row.failed_requests,
                input_tokens: row.input_tokens,
                output_tokens: row.output_tokens,
                reasoning_tokens: row.reasoning_tokens,
                cached_tokens: row.cached_tokens,
                total_tokens: row.total_tokens,
                cost_micro_usd: row.cost_micro_usd,
                updated_at: row.updated_at,
            });
        }
        report.total_cost_usd = micro_usd_to_usd(report.total_cost_micro_usd);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::conn::open_sqlite_memory;

    async fn memory_store() -> BillingStore {
        let db = open_sqlite_memory().await.unwrap();
        BillingStore::with_conn(db).await.unwrap()
    }

    #[tokio::test]
    async fn price_resolution_default_then_override() {
        let store = memory_store().await;
        let model = "claude-opus-4-5-20251101";

        let (price, source, _) = store.resolve_price_micro(model).await.unwrap();
        assert_eq!(source, PriceSource::Default);
        assert!(price.prompt > 0 && price.completion > 0);

        let override_price = PriceMicroPer1M {
            prompt: 1,
            completion: 2,
            cached: 3,
        };
        store.upsert_model_price(model, override_price).await.unwrap();
        let (price, source, updated) = store.resolve_price_micro(model).await.unwrap();
        assert_eq!(source, PriceSource::Saved);
        assert_eq!(price, override_price);
        assert!(updated > 0);

        assert!(store.delete_model_price(model).await.unwrap());
        assert!(!store.delete_model_price(model).await.unwrap());
        let (_, source, _) = store.resolve_price_micro(model).await.unwrap();
        assert_eq!(source, PriceSource::Default);
    }

    #[tokio::test]
    async fn unknown_model_resolves_missing_with_zero_cost() {
        let store = memory_store().await;
        let (price, source, _) = store
            .resolve_price_micro("totally-unknown-model")
            .await
            .unwrap();
        assert_eq!(source, PriceSource::Missing);
        assert_eq!(cost_micro_usd(1_000_000, price.prompt), 0);
    }

    #[tokio::test]
    async fn thinking_variant_resolves_base_price() {
        let store = memory_store().await;
        store
            .upsert_model_price(
                "claude-opus-4-6",
                PriceMicroPer1M {
                    prompt: 10,
                    completion: 20,
                    cached: 5,
                },
            )
            .await
            .unwrap();
        let (price, source, _) = store
            .resolve_price_micro("claude-opus-4-6-thinking(8192)")
            .await
            .unwrap();
        assert_eq!(source, PriceSource::Saved);
        assert_eq!(price.prompt, 10);
    }

    #[tokio::test]
    async fn negative_prices_are_rejected() {
        let store = memory_store().await;
        let err = store
            .upsert_model_price(
                "m",
                PriceMicroPer1M {
                    prompt: -1,
                    completion: 0,
                    cached: 0,
                },
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn usage_accumulates_and_reports() {
        let store = memory_store().await;
        let day = "2026-02-13";

        // 2 tokens @ $1 / 1M => 2 micro-USD
        store
            .add_usage(
                "k",
                "claude-opus-4-5-20251101",
                day,
                DailyUsageDelta {
                    requests: 1,
                    input_tokens: 2,
                    total_tokens: 2,
                    cost_micro_usd: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .add_usage(
                "k",
                "claude-opus-4-5-20251101",
                day,
                DailyUsageDelta {
                    requests: 1,
                    failed_requests: 1,
                    input_tokens: 3,
                    total_tokens: 3,
                    cost_micro_usd: 3,
                    // negative deltas are clamped, never subtracted
                    output_tokens: -5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.get_daily_cost_micro("k", day).await.unwrap(), 5);
        assert_eq!(store.get_daily_cost_micro("k", "2026-02-14").await.unwrap(), 0);

        let report = store.get_daily_usage_report("k", day).await.unwrap();
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.total_failed_requests, 1);
        assert_eq!(report.total_tokens, 5);
        assert_eq!(report.total_cost_micro_usd, 5);
        assert_eq!(report.models.len(), 1);
        assert_eq!(report.models[0].input_tokens, 5);
        assert_eq!(report.models[0].output_tokens, 0);
        assert!((report.total_cost_usd - 0.000005).abs() < 1e-12);
    }

    #[test]
    fn cost_rounds_half_up() {
        // 1 token at $1.50/1M: 1.5 micro-USD rounds up to 2
        assert_eq!(cost_micro_usd(1, 1_500_000), 2);
        // 1 token at $1.40/1M: 1.4 micro-USD rounds down to 1
        assert_eq!(cost_micro_usd(1, 1_400_000), 1);
        assert_eq!(cost_micro_usd(0, 1_000_000), 0);
        assert_eq!(cost_micro_usd(5, 0), 0);
        assert_eq!(cost_micro_usd(-3, 1_000_000), 0);
    }

    #[test]
    fn usd_conversions_round_trip() {
        assert_eq!(usd_per_1m_to_micro(5.0), 5_000_000);
        assert_eq!(usd_per_1m_to_micro(0.0), 0);
        assert_eq!(usd_per_1m_to_micro(-1.0), 0);
        assert_eq!(usd_per_1m_to_micro(f64::NAN), 0);
        assert!((micro_usd_to_usd(5_000_000) - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn list_merges_saved_over_defaults_sorted() {
        let store = memory_store().await;
        store
            .upsert_model_price(
                "claude-opus-4-5-20251101",
                PriceMicroPer1M {
                    prompt: 7_000_000,
                    completion: 1,
                    cached: 1,
                },
            )
            .await
            .unwrap();
        store
            .upsert_model_price(
                "custom-model",
                PriceMicroPer1M {
                    prompt: 1,
                    completion: 1,
                    cached: 1,
                },
            )
            .await
            .unwrap();

        let prices = store.list_model_prices().await.unwrap();
        let opus = prices
            .iter()
            .find(|p| p.model == "claude-opus-4-5-20251101")
            .unwrap();
        assert_eq!(opus.source, "saved");
        assert!((opus.prompt_usd_per_1m - 7.0).abs() < 1e-9);
        assert!(prices.iter().any(|p| p.model == "custom-model"));
        assert!(prices.iter().any(|p| p.source == "default"));
        let mut sorted = prices.clone();
        sorted.sort_by(|a, b| a.model.cmp(&b.model));
        assert_eq!(
            prices.iter().map(|p| &p.model).collect::<Vec<_>>(),
            sorted.iter().map(|p| &p.model).collect::<Vec<_>>()
        );
    }
}
