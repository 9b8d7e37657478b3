use std::collections::HashMap;

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::{
    config::{ApiKeyPolicy, POLYGATE_CONFIG, PolygateConfig, sanitize_api_key_policies},
    error::PolygateError,
    middleware::RequireAdminAuth,
    persistence::{PriceMicroPer1M, usd_per_1m_to_micro},
    policy::today_china,
    state::AppState,
};

fn persist_config() {
    tokio::spawn(async {
        if let Err(e) = POLYGATE_CONFIG.load().save() {
            error!("Failed to save config: {}", e);
        }
    });
}

/// GET /api/policies
pub async fn api_get_policies(_: RequireAdminAuth) -> Response {
    let policies = POLYGATE_CONFIG.load().api_key_policies.to_owned();
    Json(json!({ "api-key-policies": policies })).into_response()
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum PolicyListBody {
    Items { items: Vec<ApiKeyPolicy> },
    Plain(Vec<ApiKeyPolicy>),
}

/// PUT /api/policies replaces the whole table; the body is either a plain
/// array or `{"items":[...]}`.
pub async fn api_put_policies(
    _: RequireAdminAuth,
    Json(body): Json<PolicyListBody>,
) -> Response {
    let policies = match body {
        PolicyListBody::Plain(items) | PolicyListBody::Items { items } => items,
    };
    POLYGATE_CONFIG.rcu(|config| {
        let mut config = PolygateConfig::clone(config);
        config.api_key_policies = sanitize_api_key_policies(policies.to_owned());
        config
    });
    persist_config();
    Json(json!({"status": "ok"})).into_response()
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicyPatch {
    pub api_key: Option<String>,
    pub excluded_models: Option<Vec<String>>,
    pub allow_claude_opus_4_6: Option<bool>,
    pub daily_limits: Option<HashMap<String, i64>>,
    pub daily_budget_usd: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyPatchBody {
    pub api_key: String,
    pub value: PolicyPatch,
}

/// PATCH /api/policies updates (or creates) one entry. Patching the key to
/// an empty string deletes the entry.
pub async fn api_patch_policy(
    _: RequireAdminAuth,
    Json(body): Json<PolicyPatchBody>,
) -> Result<Response, PolygateError> {
    let api_key = body.api_key.trim().to_string();
    if api_key.is_empty() {
        return Err(PolygateError::InvalidInput {
            msg: "api-key is required".to_string(),
        });
    }

    let delete = body
        .value
        .api_key
        .as_ref()
        .is_some_and(|k| k.trim().is_empty());

    POLYGATE_CONFIG.rcu(|config| {
        let mut config = PolygateConfig::clone(config);
        let mut policies = std::mem::take(&mut config.api_key_policies);

        if delete {
            policies.retain(|p| p.api_key.trim() != api_key);
        } else {
            let mut entry = policies
                .iter()
                .find(|p| p.api_key.trim() == api_key)
                .cloned()
                .unwrap_or_else(|| ApiKeyPolicy {
                    api_key: api_key.to_owned(),
                    ..Default::default()
                });
            if let Some(renamed) = &body.value.api_key {
                entry.api_key = renamed.to_owned();
            }
            if let Some(excluded) = &body.value.excluded_models {
                entry.excluded_models = excluded.to_owned();
            }
            if let Some(allow) = body.value.allow_claude_opus_4_6 {
                entry.allow_claude_opus_4_6 = Some(allow);
            }
            if let Some(limits) = &body.value.daily_limits {
                entry.daily_limits = limits.to_owned();
            }
            if let Some(budget) = body.value.daily_budget_usd {
                entry.daily_budget_usd = budget;
            }
            policies.retain(|p| p.api_key.trim() != api_key);
            policies.push(entry);
        }

        config.api_key_policies = sanitize_api_key_policies(policies);
        config
    });
    persist_config();
    Ok(Json(json!({"status": "ok"})).into_response())
}

/// GET /api/prices
pub async fn api_get_model_prices(
    _: RequireAdminAuth,
    State(state): State<AppState>,
) -> Result<Response, PolygateError> {
    let prices = state.billing.list_model_prices().await?;
    Ok(Json(json!({ "prices": prices })).into_response())
}

#[derive(Deserialize)]
pub struct PutPriceBody {
    pub model: String,
    pub prompt_usd_per_1m: f64,
    pub completion_usd_per_1m: f64,
    pub cached_usd_per_1m: f64,
}

/// PUT /api/prices
pub async fn api_put_model_price(
    _: RequireAdminAuth,
    State(state): State<AppState>,
    Json(body): Json<PutPriceBody>,
) -> Result<Response, PolygateError> {
    let model = body.model.trim();
    if model.is_empty() {
        return Err(PolygateError::InvalidInput {
            msg: "model is required".to_string(),
        });
    }
    let price = PriceMicroPer1M {
        prompt: usd_per_1m_to_micro(body.prompt_usd_per_1m),
        completion: usd_per_1m_to_micro(body.completion_usd_per_1m),
        cached: usd_per_1m_to_micro(body.cached_usd_per_1m),
    };
    state.billing.upsert_model_price(model, price).await?;
    Ok(Json(json!({"status": "ok"})).into_response())
}

#[derive(Deserialize)]
pub struct PriceQuery {
    pub model: String,
}

/// DELETE /api/prices?model=
pub async fn api_delete_model_price(
    _: RequireAdminAuth,
    State(state): State<AppState>,
    Query(query): Query<PriceQuery>,
) -> Result<Response, PolygateError> {
    let model = query.model.trim();
    if model.is_empty() {
        return Err(PolygateError::InvalidInput {
            msg: "model is required".to_string(),
        });
    }
    let deleted = state.billing.delete_model_price(model).await?;
    if !deleted {
        return Ok((
            http::StatusCode::NOT_FOUND,
            Json(json!({"error": "item not found"})),
        )
            .into_response());
    }
    Ok(Json(json!({"status": "ok"})).into_response())
}

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(rename = "api-key")]
    pub api_key: Option<String>,
    #[serde(rename = "apiKey")]
    pub api_key_camel: Option<String>,
    pub day: Option<String>,
}

/// GET /api/usage?api-key=&day= (day defaults to the current Asia/Shanghai
/// accounting day)
pub async fn api_get_daily_usage(
    _: RequireAdminAuth,
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, PolygateError> {
    let api_key = query
        .api_key
        .as_deref()
        .or(query.api_key_camel.as_deref())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| PolygateError::InvalidInput {
            msg: "api-key is required".to_string(),
        })?;
    let day = query
        .day
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(today_china);
    let report = state.billing.get_daily_usage_report(api_key, &day).await?;
    Ok(Json(json!({ "usage": report })).into_response())
}

/// GET /api/credentials, a pool snapshot for operators.
pub async fn api_get_credentials(
    _: RequireAdminAuth,
    State(state): State<AppState>,
) -> Result<Response, PolygateError> {
    let info = state.conductor.auth().pool().get_status().await?;
    Ok(Json(json!({ "credentials": info.credentials })).into_response())
}
