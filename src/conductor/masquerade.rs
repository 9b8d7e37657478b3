use bytes::Bytes;
use serde_json::Value;

/// Rewrites the `model` field of a request body. Bodies without a model
/// field pass through untouched.
pub fn rewrite_request_model(body: &Bytes, model: &str) -> Bytes {
    let model = model.trim();
    if body.is_empty() || model.is_empty() {
        return body.to_owned();
    }
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.to_owned();
    };
    let Some(obj) = value.as_object_mut() else {
        return body.to_owned();
    };
    if !obj.contains_key("model") {
        return body.to_owned();
    }
    obj.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .unwrap_or_else(|_| body.to_owned())
}

/// Rewrites the model fields of one JSON document: the top-level `model`
/// and the nested `message.model`. Returns None when nothing changed.
fn rewrite_json_model(data: &[u8], model: &str) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(data).ok()?;
    let obj = value.as_object_mut()?;
    let mut changed = false;
    if obj.contains_key("model") {
        obj.insert("model".to_string(), Value::String(model.to_string()));
        changed = true;
    }
    if let Some(message) = obj.get_mut("message").and_then(|m| m.as_object_mut())
        && message.contains_key("model")
    {
        message.insert("model".to_string(), Value::String(model.to_string()));
        changed = true;
    }
    if !changed {
        return None;
    }
    serde_json::to_vec(&value).ok()
}

/// Masquerades a whole (non-streaming) response payload back to the model
/// the client asked for. Payloads without model fields are untouched.
pub fn rewrite_response_model_fields(body: Bytes, model: &str) -> Bytes {
    let model = model.trim();
    if body.is_empty() || model.is_empty() {
        return body;
    }
    rewrite_json_model(&body, model)
        .map(Bytes::from)
        .unwrap_or(body)
}

/// Masquerades one streamed chunk: either a raw JSON payload or a block of
/// `data: <json>` SSE lines. `data: [DONE]` and non-JSON payloads pass
/// through untouched.
pub fn rewrite_stream_chunk_model_fields(chunk: Bytes, model: &str) -> Bytes {
    let model = model.trim();
    if chunk.is_empty() || model.is_empty() {
        return chunk;
    }

    let looks_sse = chunk.starts_with(b"data:")
        || chunk.starts_with(b"event:")
        || chunk.windows(6).any(|w| w == b"\ndata:");
    if !looks_sse {
        return rewrite_json_model(&chunk, model)
            .map(Bytes::from)
            .unwrap_or(chunk);
    }

    let Ok(text) = std::str::from_utf8(&chunk) else {
        return chunk;
    };
    let mut changed = false;
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim_start();
            if let Some(rewritten) = rewrite_json_model(payload.as_bytes(), model)
                && let Ok(rewritten) = String::from_utf8(rewritten)
            {
                out.push_str("data: ");
                out.push_str(&rewritten);
                changed = true;
                continue;
            }
        }
        out.push_str(line);
    }
    if changed { Bytes::from(out) } else { chunk }
}
