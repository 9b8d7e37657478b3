use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    conductor::RequestScope,
    executors::{CHUNK_CHANNEL_CAPACITY, ChunkReceiver, SourceFormat},
    middleware::{ClientKey, PolicyEntry},
    services::usage_sink::{UsageRecord, UsageRecorder, UsageScanner},
};

mod completions;
mod gemini;
mod management;
mod messages;
mod responses;

pub use completions::api_completions;
pub use gemini::api_gemini_generate;
pub use management::{
    api_delete_model_price, api_get_credentials, api_get_daily_usage, api_get_model_prices,
    api_get_policies, api_patch_policy, api_put_model_price, api_put_policies,
};
pub use messages::{api_count_tokens, api_messages};
pub use responses::api_responses;

/// Assembles the conductor scope from what the middleware attached to the
/// request. A missing Idempotency-Key is replaced with a fresh UUID.
pub(crate) fn request_scope(
    headers: &HeaderMap,
    client_key: Option<&ClientKey>,
    policy: Option<&PolicyEntry>,
    source_format: SourceFormat,
) -> RequestScope {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    RequestScope::new(
        client_key.map(|k| k.0.to_owned()).unwrap_or_default(),
        policy.map(|p| (*p.0).to_owned()),
        source_format,
        idempotency_key,
    )
}

pub(crate) fn body_model(bytes: &Bytes) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let model = value.get("model")?.as_str()?.trim().to_string();
    (!model.is_empty()).then_some(model)
}

pub(crate) fn body_wants_stream(bytes: &Bytes) -> bool {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or_default()
}

/// Relays a chunk stream while scanning it for usage counters; one record
/// is emitted when the stream ends, covering partial streams too.
pub(crate) fn observe_stream(
    mut rx: ChunkReceiver,
    usage: UsageRecorder,
    client_key: String,
    model: String,
) -> ChunkReceiver {
    let (tx, out) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut scanner = UsageScanner::default();
        let mut failed = false;
        while let Some(item) = rx.recv().await {
            match &item {
                Ok(chunk) => scanner.feed(chunk),
                Err(_) => failed = true,
            }
            if tx.send(item).await.is_err() {
                // client went away; still account for what was seen
                break;
            }
        }
        let mut record = if failed {
            UsageRecord::failure(&client_key, &model)
        } else {
            UsageRecord::success(&client_key, &model, Default::default())
        };
        record.detail = scanner.finish();
        usage.record(record);
    });
    out
}
