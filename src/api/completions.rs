use axum::{Extension, extract::State, http::HeaderMap, response::Response};
use bytes::Bytes;
use colored::Colorize;
use tracing::info;

use crate::{
    api::{body_model, body_wants_stream, messages::dispatch_chat, request_scope},
    error::PolygateError,
    executors::SourceFormat,
    middleware::{ClientKey, PolicyEntry},
    state::AppState,
    utils::enabled,
};

/// OpenAI chat-completions dialect entry point.
pub async fn api_completions(
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
        SourceFormat::OpenAI,
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
        scope.source_format.to_string().yellow()
    );
    dispatch_chat(state, scope, model, body, stream).await
}
