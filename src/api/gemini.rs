use axum::{
    Extension,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use colored::Colorize;
use tracing::info;

use crate::{
    api::{messages::dispatch_chat, request_scope},
    error::PolygateError,
    executors::SourceFormat,
    middleware::{ClientKey, PolicyEntry},
    state::AppState,
};

/// Gemini dialect entry point. The model and the operation travel in the
/// path, `models/{model}:{action}`, not in the body.
pub async fn api_gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    client_key: Option<Extension<ClientKey>>,
    policy: Option<Extension<PolicyEntry>>,
    body: Bytes,
) -> Result<Response, PolygateError> {
    let (model, action) = model_action
        .split_once(':')
        .map(|(m, a)| (m.trim(), a.trim()))
        .ok_or_else(|| PolygateError::InvalidInput {
            msg: format!("malformed model path segment: {model_action}"),
        })?;
    if model.is_empty() {
        return Err(PolygateError::InvalidInput {
            msg: "model is required".to_string(),
        });
    }

    let scope = request_scope(
        &headers,
        client_key.as_ref().map(|e| &e.0),
        policy.as_ref().map(|e| &e.0),
        SourceFormat::Gemini,
    );
    info!(
        "[REQ] action: {}, model: {}, format: {}",
        action.blue(),
        model.green(),
        scope.source_format.to_string().green()
    );

    match action {
        "generateContent" => dispatch_chat(state, scope, model.to_string(), body, false).await,
        "streamGenerateContent" => {
            dispatch_chat(state, scope, model.to_string(), body, true).await
        }
        "countTokens" => {
            let payload = state.conductor.execute_count(&scope, model, body).await?;
            Ok((
                [(http::header::CONTENT_TYPE, "application/json")],
                payload,
            )
                .into_response())
        }
        other => Err(PolygateError::InvalidInput {
            msg: format!("unsupported action: {other}"),
        }),
    }
}
