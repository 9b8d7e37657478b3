use std::time::Duration;

use axum::{
    Extension,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use colored::Colorize;
use scopeguard::defer;
use tracing::info;

use crate::{
    api::{body_model, body_wants_stream, observe_stream, request_scope},
    config::POLYGATE_CONFIG,
    error::PolygateError,
    executors::SourceFormat,
    middleware::{ClientKey, PolicyEntry},
    services::usage_sink::{UsageRecord, UsageScanner},
    state::AppState,
    utils::{
        enabled,
        stream::{json_response_with_keepalive, sse_response},
    },
};

/// Main entry point for the Anthropic messages dialect. Streams or buffers
/// depending on the request body, accounts usage either way.
pub async fn api_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    client_key: Option<Extension<ClientKey>>,
    policy: Option<Extension<PolicyEntry>>,
    body: Bytes,
) -> Result<Response, PolygateError> {
    let scope = request_scope(
        &headers,
        client_key.as_ref().map(|e| &e.0),
        policy.as_ref().map(|e| &e.0),
        SourceFormat::Claude,
    );
    let Some(model) = body_model(&body) else {
        return Err(PolygateError::InvalidInput {
            msg: "model is required".to_string(),
        });
    };
    let stream = body_wants_stream(&body);
    info!(
        "[REQ] stream: {}, model: {}, format: {}",
        enabled(stream),
        model.green(),
        scope.source_format.to_string().green()
    );
    let stopwatch = chrono::Utc::now();
    defer!(
        let elapsed = chrono::Utc::now().signed_duration_since(stopwatch);
        info!(
            "[FIN] elapsed: {}s",
            format!("{}", elapsed.num_milliseconds() as f64 / 1000.0).green()
        );
    );

    dispatch_chat(state, scope, model, body, stream).await
}

/// Token-counting variant of the messages endpoint.
pub async fn api_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    client_key: Option<Extension<ClientKey>>,
    policy: Option<Extension<PolicyEntry>>,
    body: Bytes,
) -> Result<Response, PolygateError> {
    let scope = request_scope(
        &headers,
        client_key.as_ref().map(|e| &e.0),
        policy.as_ref().map(|e| &e.0),
        SourceFormat::Claude,
    );
    let Some(model) = body_model(&body) else {
        return Err(PolygateError::InvalidInput {
            msg: "model is required".to_string(),
        });
    };
    info!("[TOKENS] model: {}", model.green());
    let payload = state.conductor.execute_count(&scope, &model, body).await?;
    Ok((
        [(http::header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}

/// Shared chat dispatch used by every chat-shaped dialect handler.
pub(crate) async fn dispatch_chat(
    state: AppState,
    scope: crate::conductor::RequestScope,
    model: String,
    body: Bytes,
    stream: bool,
) -> Result<Response, PolygateError> {
    if stream {
        let rx = match state.conductor.execute_stream(&scope, &model, body).await {
            Ok(rx) => rx,
            Err(e) => {
                state
                    .usage
                    .record(UsageRecord::failure(&scope.client_key, &model));
                return Err(e);
            }
        };
        let rx = observe_stream(rx, state.usage.to_owned(), scope.client_key.to_owned(), model);
        return Ok(sse_response(rx));
    }

    let conductor = state.conductor.to_owned();
    let usage = state.usage.to_owned();
    let fut = async move {
        let result = conductor.execute(&scope, &model, body).await;
        match &result {
            Ok(payload) => {
                let mut scanner = UsageScanner::default();
                scanner.feed(payload);
                usage.record(UsageRecord::success(
                    &scope.client_key,
                    &model,
                    scanner.finish(),
                ));
            }
            Err(_) => usage.record(UsageRecord::failure(&scope.client_key, &model)),
        }
        result
    };

    let keep_alive = POLYGATE_CONFIG.load().non_stream_keep_alive_secs;
    if keep_alive > 0 {
        return Ok(json_response_with_keepalive(
            Duration::from_secs(keep_alive),
            fut,
        ));
    }
    let payload = fut.await?;
    Ok((
        [(http::header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}
