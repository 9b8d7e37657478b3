use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{
    config::{AuthCredential, GEMINI_ENDPOINT},
    error::{CheckUpstreamErr, PolygateError},
    executors::{
        CHUNK_CHANNEL_CAPACITY, ChunkReceiver, ExecOptions, ExecRequest, ExecResponse,
        ProviderExecutor, UPSTREAM_CLIENT, sse_frame, wreq_send_err,
    },
    policy::parse_thinking_suffix,
};

pub struct GeminiExecutor;

impl GeminiExecutor {
    fn endpoint(auth: &AuthCredential, model: &str, action: &str) -> String {
        let base = auth.base_url().unwrap_or(GEMINI_ENDPOINT);
        // budget suffixes never reach the upstream URL
        let model = parse_thinking_suffix(model).model_name;
        let model = model.strip_prefix("models/").unwrap_or(&model);
        format!(
            "{}/v1beta/models/{}:{}",
            base.trim_end_matches('/'),
            model,
            action
        )
    }

    fn request(auth: &AuthCredential, url: String, payload: &Bytes) -> wreq::RequestBuilder {
        let mut builder = UPSTREAM_CLIENT
            .post(url)
            .header("content-type", "application/json")
            .body(payload.to_vec());
        if let Some(key) = auth.api_key() {
            builder = builder.header("x-goog-api-key", key);
        } else if let Some(token) = auth.access_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &str {
        "gemini"
    }

    async fn execute(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        let url = Self::endpoint(auth, &req.model, "generateContent");
        let res = Self::request(auth, url, &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to send generateContent"))?
            .check_upstream()
            .await?;
        let payload = res
            .bytes()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to read generateContent response"))?;
        Ok(ExecResponse { payload })
    }

    async fn execute_stream(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ChunkReceiver, PolygateError> {
        let url = format!(
            "{}?alt=sse",
            Self::endpoint(auth, &req.model, "streamGenerateContent")
        );
        let res = Self::request(auth, url, &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to open generateContent stream"))?
            .check_upstream()
            .await?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            use eventsource_stream::Eventsource;
            let mut events = res.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let frame = sse_frame(&event.event, &event.data);
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(PolygateError::Whatever {
                                message: format!("gemini stream failed: {e}"),
                                source: None,
                            }))
                            .await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        let url = Self::endpoint(auth, &req.model, "countTokens");
        let res = Self::request(auth, url, &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to send countTokens"))?
            .check_upstream()
            .await?;
        let payload = res
            .bytes()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to read countTokens response"))?;
        Ok(ExecResponse { payload })
    }
}
