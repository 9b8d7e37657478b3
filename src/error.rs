use axum::response::IntoResponse;
use colored::Colorize;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::Location;
use tracing::debug;

/// Crate-wide error type. Variants either wrap plumbing failures or carry
/// an HTTP status that maps onto the client-facing error envelope.
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PolygateError {
    #[snafu(display("JSON error: {}", source))]
    #[snafu(context(false))]
    JsonError { source: serde_json::Error },
    #[snafu(display("IO error: {}", source))]
    #[snafu(context(false))]
    IoError {
        #[snafu(implicit)]
        loc: Location,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    TomlSeError { source: toml::ser::Error },
    #[snafu(display("database error: {}", source))]
    #[snafu(context(false))]
    DbError {
        #[snafu(implicit)]
        loc: Location,
        source: sea_orm::DbErr,
    },
    #[snafu(display("upstream request failed: {}: {}", msg, source))]
    WreqError {
        msg: &'static str,
        source: wreq::Error,
    },
    #[snafu(display("actor error: {}", msg))]
    RactorError {
        #[snafu(implicit)]
        loc: Location,
        msg: String,
    },
    /// Upstream returned a non-success status; the body is preserved
    /// byte-for-byte so JSON error payloads pass through unchanged.
    #[snafu(display("upstream error: code: {}, body: {}", code.to_string().red(), body))]
    UpstreamHttp { code: StatusCode, body: String },
    /// Every credential of every candidate provider was skipped or failed.
    /// The message markers are matched by the failover eligibility check.
    #[snafu(display("auth_unavailable: no auth available"))]
    NoAuthAvailable,
    #[snafu(display("unknown provider for model {}", model))]
    UnknownProvider { model: String },
    #[snafu(display("{}", msg))]
    InvalidInput { msg: String },
    #[snafu(display("translation rejected request: {}", msg))]
    TranslationError { msg: String },
    #[snafu(display("model access denied by api key policy"))]
    ModelDenied,
    #[snafu(display("daily model limit exceeded"))]
    DailyLimitExceeded,
    #[snafu(display("daily budget exceeded"))]
    DailyBudgetExceeded,
    #[snafu(display("Key/Password Invalid"))]
    InvalidKey,
    #[snafu(display("Unexpected None: {}", msg))]
    UnexpectedNone { msg: &'static str },
    #[snafu(whatever, display("{}: {}", message, source.as_ref().map_or_else(|| "Unknown error".into(), |e| e.to_string())))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send>, Some)))]
        source: Option<Box<dyn std::error::Error + Send>>,
    },
}

impl PolygateError {
    /// Message text surfaced to the client: the raw upstream body when one
    /// was captured, the display form otherwise.
    pub fn client_text(&self) -> String {
        match self {
            PolygateError::UpstreamHttp { body, .. } if !body.trim().is_empty() => body.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status surfaced to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            PolygateError::UpstreamHttp { code, .. } => *code,
            PolygateError::UnknownProvider { .. } => StatusCode::BAD_GATEWAY,
            PolygateError::InvalidInput { .. }
            | PolygateError::TranslationError { .. }
            | PolygateError::JsonError { .. } => StatusCode::BAD_REQUEST,
            PolygateError::ModelDenied => StatusCode::FORBIDDEN,
            PolygateError::DailyLimitExceeded | PolygateError::DailyBudgetExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            PolygateError::InvalidKey => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Client-facing error envelope.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Builds an OpenAI-compatible JSON error body. If `text` is already valid
/// JSON it is returned as-is so upstream error payloads are preserved.
pub fn error_body(status: StatusCode, text: &str) -> Vec<u8> {
    let trimmed = text.trim();
    let text = if trimmed.is_empty() {
        status.canonical_reason().unwrap_or("error")
    } else {
        trimmed
    };
    if serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return text.as_bytes().to_vec();
    }

    let (err_type, code) = match status {
        StatusCode::UNAUTHORIZED => ("authentication_error", Some("invalid_api_key")),
        StatusCode::FORBIDDEN => ("permission_error", Some("insufficient_quota")),
        StatusCode::TOO_MANY_REQUESTS => ("rate_limit_error", Some("rate_limit_exceeded")),
        StatusCode::NOT_FOUND => ("invalid_request_error", Some("model_not_found")),
        s if s.is_server_error() => ("server_error", Some("internal_server_error")),
        _ => ("invalid_request_error", None),
    };
    serde_json::to_vec(&ErrorResponse {
        error: ErrorDetail {
            message: text.to_string(),
            r#type: err_type.to_string(),
            code: code.map(str::to_string),
        },
    })
    .unwrap_or_else(|_| {
        json!({"error":{"message":text,"type":"server_error","code":"internal_server_error"}})
            .to_string()
            .into_bytes()
    })
}

/// Digs a human-readable message out of a raw error payload, unwrapping the
/// standard `{"error":{"message":...}}` envelope when present.
pub fn extract_error_message(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return raw.to_string();
    };
    if let Some(msg) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        && !msg.trim().is_empty()
    {
        return msg.trim().to_string();
    }
    if let Some(msg) = value.get("message").and_then(|m| m.as_str())
        && !msg.trim().is_empty()
    {
        return msg.trim().to_string();
    }
    raw.to_string()
}

impl IntoResponse for PolygateError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        debug!("responding with error: {}", self);
        let body = error_body(status, &self.client_text());
        (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// Maps non-success upstream responses into `UpstreamHttp`, keeping the
/// original body so it can be forwarded verbatim.
pub trait CheckUpstreamErr
where
    Self: Sized,
{
    fn check_upstream(self) -> impl Future<Output = Result<Self, PolygateError>>;
}

impl CheckUpstreamErr for wreq::Response {
    async fn check_upstream(self) -> Result<Self, PolygateError> {
        let status = self.status();
        if status.is_success() {
            return Ok(self);
        }
        let body = self.text().await.unwrap_or_default();
        Err(PolygateError::UpstreamHttp { code: status, body })
    }
}
