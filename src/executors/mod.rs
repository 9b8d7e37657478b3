use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use strum::{Display, EnumString};
use tokio::sync::mpsc;

use crate::{
    config::{AuthCredential, POLYGATE_CONFIG},
    error::PolygateError,
};

pub mod claude;
pub mod codex;
pub mod gemini;

/// Inbound wire dialect of the client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SourceFormat {
    Claude,
    OpenAI,
    Codex,
    Gemini,
}

/// One upstream invocation: the resolved model plus the raw request body.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub model: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResponse {
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub stream: bool,
    pub source_format: SourceFormat,
    /// Client-supplied or generated key correlating retries of one logical
    /// request; also drives credential stickiness.
    pub idempotency_key: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            stream: false,
            source_format: SourceFormat::Claude,
            idempotency_key: String::new(),
        }
    }
}

/// Stream side of an execution: whole SSE frames or raw JSON payloads, in
/// upstream order, with at most one trailing error.
pub type ChunkReceiver = mpsc::Receiver<Result<Bytes, PolygateError>>;

pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Capability set implemented per provider. `refresh` and `count_tokens`
/// have defaults so providers without those concerns stay small.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn identifier(&self) -> &str;

    async fn execute(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError>;

    async fn execute_stream(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ChunkReceiver, PolygateError>;

    async fn count_tokens(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        let _ = (auth, req, opts);
        Err(PolygateError::InvalidInput {
            msg: format!("{}: count_tokens is not supported", self.identifier()),
        })
    }

    /// Renews refreshable token material. The default is a no-op for
    /// providers whose credentials are plain API keys.
    async fn refresh(&self, auth: AuthCredential) -> Result<AuthCredential, PolygateError> {
        Ok(auth)
    }
}

/// Shared upstream client honouring the configured egress proxy.
pub static UPSTREAM_CLIENT: LazyLock<wreq::Client> = LazyLock::new(|| {
    let mut builder = wreq::Client::builder();
    if let Some(proxy) = POLYGATE_CONFIG.load().wreq_proxy.to_owned() {
        builder = builder.proxy(proxy);
    }
    builder.build().expect("Failed to build upstream client")
});

/// Reassembles a parsed SSE event into a wire frame.
pub fn sse_frame(event: &str, data: &str) -> Bytes {
    if event.is_empty() || event == "message" {
        Bytes::from(format!("data: {data}\n\n"))
    } else {
        Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
    }
}

pub(crate) fn wreq_send_err(source: wreq::Error, msg: &'static str) -> PolygateError {
    PolygateError::WreqError { msg, source }
}

/// Dialect translation seam. The real translators are external
/// collaborators; their contract is a bidirectional pair of functions over
/// raw payload bytes. The identity pair is registered for every
/// (source, provider) combination here, and a translator that cannot
/// express a request must fail with `TranslationError`.
pub mod translate {
    use bytes::Bytes;

    use super::SourceFormat;
    use crate::error::PolygateError;

    /// Client dialect -> provider dialect.
    pub fn request_into_provider(
        _source: SourceFormat,
        _provider: &str,
        payload: Bytes,
    ) -> Result<Bytes, PolygateError> {
        Ok(payload)
    }

    /// Provider dialect -> client dialect, applied per payload or chunk.
    pub fn response_into_source(
        _source: SourceFormat,
        _provider: &str,
        payload: Bytes,
    ) -> Result<Bytes, PolygateError> {
        Ok(payload)
    }
}
