use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

use crate::{
    persistence::{BillingStore, DailyUsageDelta, cost_micro_usd},
    policy::{day_key_china, normalise_model_key},
};

/// Token counts attributed to one completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub client_key: String,
    pub model: String,
    pub requested_at: DateTime<Utc>,
    pub failed: bool,
    pub detail: TokenUsage,
}

impl UsageRecord {
    pub fn success(client_key: &str, model: &str, detail: TokenUsage) -> Self {
        Self {
            client_key: client_key.to_string(),
            model: model.to_string(),
            requested_at: Utc::now(),
            failed: false,
            detail,
        }
    }

    pub fn failure(client_key: &str, model: &str) -> Self {
        Self {
            client_key: client_key.to_string(),
            model: model.to_string(),
            requested_at: Utc::now(),
            failed: true,
            detail: TokenUsage::default(),
        }
    }
}

/// Prices and persists one record. Failures are logged and swallowed so
/// accounting can never corrupt the response path.
pub(crate) async fn persist_record(store: &BillingStore, record: UsageRecord) {
    let client_key = record.client_key.trim();
    if client_key.is_empty() {
        // un-attributable usage is dropped
        return;
    }
    let mut model_key = normalise_model_key(&record.model);
    if model_key.is_empty() {
        model_key = "unknown".to_string();
    }
    let day_key = day_key_china(record.requested_at);

    let mut detail = record.detail;
    if detail.total_tokens == 0 {
        detail.total_tokens = detail.input_tokens
            + detail.output_tokens
            + detail.reasoning_tokens
            + detail.cached_tokens;
    }
    detail.total_tokens = detail.total_tokens.max(0);

    let prompt_tokens = (detail.input_tokens - detail.cached_tokens).max(0);
    let completion_tokens = detail.output_tokens + detail.reasoning_tokens;

    // a missing price means zero cost, never a dropped row
    let price = match store.resolve_price_micro(&model_key).await {
        Ok((price, _, _)) => price,
        Err(_) => Default::default(),
    };
    let mut cost = 0i64;
    cost += cost_micro_usd(prompt_tokens, price.prompt);
    cost += cost_micro_usd(detail.cached_tokens, price.cached);
    cost += cost_micro_usd(completion_tokens, price.completion);

    let delta = DailyUsageDelta {
        requests: 1,
        failed_requests: record.failed as i64,
        input_tokens: detail.input_tokens.max(0),
        output_tokens: detail.output_tokens.max(0),
        reasoning_tokens: detail.reasoning_tokens.max(0),
        cached_tokens: detail.cached_tokens.max(0),
        total_tokens: detail.total_tokens,
        cost_micro_usd: cost.max(0),
    };
    if let Err(e) = store.add_usage(client_key, &model_key, &day_key, delta).await {
        error!("failed to persist usage row: {}", e);
    }
}

/// Cloneable handle feeding the background persistence task. Sending never
/// blocks the response path.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl UsageRecorder {
    pub fn start(store: Arc<BillingStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                persist_record(&store, record).await;
            }
        });
        Self { tx }
    }

    pub fn record(&self, record: UsageRecord) {
        let _ = self.tx.send(record);
    }
}

fn get_i64(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| value.get(key).and_then(Value::as_i64))
}

fn find_usage_object(value: &Value) -> Option<&Value> {
    for pointer in ["/usage", "/response/usage", "/message/usage", "/usageMetadata"] {
        if let Some(usage) = value.pointer(pointer)
            && usage.is_object()
        {
            return Some(usage);
        }
    }
    None
}

/// Accumulates usage fields across the dialects the proxy fronts. Stream
/// events report cumulative counters, so merging takes the maximum.
#[derive(Debug, Default)]
pub struct UsageScanner {
    usage: TokenUsage,
}

impl UsageScanner {
    pub fn observe_json(&mut self, value: &Value) {
        let Some(usage) = find_usage_object(value) else {
            return;
        };
        let merge = |current: &mut i64, seen: Option<i64>| {
            if let Some(seen) = seen
                && seen > *current
            {
                *current = seen;
            }
        };
        merge(
            &mut self.usage.input_tokens,
            get_i64(usage, &["input_tokens", "prompt_tokens", "promptTokenCount"]),
        );
        merge(
            &mut self.usage.output_tokens,
            get_i64(
                usage,
                &["output_tokens", "completion_tokens", "candidatesTokenCount"],
            ),
        );
        merge(
            &mut self.usage.reasoning_tokens,
            usage
                .pointer("/completion_tokens_details/reasoning_tokens")
                .or_else(|| usage.pointer("/output_tokens_details/reasoning_tokens"))
                .and_then(Value::as_i64)
                .or_else(|| get_i64(usage, &["thoughtsTokenCount"])),
        );
        merge(
            &mut self.usage.cached_tokens,
            usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .or_else(|| usage.pointer("/input_tokens_details/cached_tokens"))
                .and_then(Value::as_i64)
                .or_else(|| {
                    get_i64(
                        usage,
                        &["cache_read_input_tokens", "cachedContentTokenCount"],
                    )
                }),
        );
        merge(
            &mut self.usage.total_tokens,
            get_i64(usage, &["total_tokens", "totalTokenCount"]),
        );
    }

    /// Feeds one payload: raw JSON or a block of SSE `data:` lines.
    pub fn feed(&mut self, chunk: &[u8]) {
        if let Ok(value) = serde_json::from_slice::<Value>(chunk) {
            self.observe_json(&value);
            return;
        }
        let Ok(text) = std::str::from_utf8(chunk) else {
            return;
        };
        for line in text.split('\n') {
            if let Some(payload) = line.strip_prefix("data:")
                && let Ok(value) = serde_json::from_str::<Value>(payload.trim_start())
            {
                self.observe_json(&value);
            }
        }
    }

    pub fn finish(self) -> TokenUsage {
        self.usage
    }
}
