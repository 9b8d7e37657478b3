use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{
    config::{AuthCredential, CODEX_ENDPOINT},
    error::{CheckUpstreamErr, PolygateError},
    executors::{
        CHUNK_CHANNEL_CAPACITY, ChunkReceiver, ExecOptions, ExecRequest, ExecResponse,
        ProviderExecutor, UPSTREAM_CLIENT, sse_frame, wreq_send_err,
    },
};

pub struct CodexExecutor;

impl CodexExecutor {
    fn endpoint(auth: &AuthCredential) -> String {
        let base = auth.base_url().unwrap_or(CODEX_ENDPOINT);
        format!("{}/responses", base.trim_end_matches('/'))
    }

    fn request(auth: &AuthCredential, payload: &Bytes) -> wreq::RequestBuilder {
        let mut builder = UPSTREAM_CLIENT
            .post(Self::endpoint(auth))
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .body(payload.to_vec());
        if let Some(token) = auth.access_token() {
            builder = builder.bearer_auth(token);
        } else if let Some(key) = auth.api_key() {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

/// The `response.completed` event ends the logical response even when the
/// upstream keeps its TCP connection open afterwards.
pub fn is_terminal_event(data: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .is_some_and(|t| t == "response.completed")
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &str {
        "codex"
    }

    /// The responses endpoint always answers as an event stream; the
    /// non-streaming path aggregates it and returns the completed event
    /// promptly, without waiting for the upstream to hang up.
    async fn execute(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        let res = Self::request(auth, &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to send responses request"))?
            .check_upstream()
            .await?;

        let sse = res
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));
        if !sse {
            let payload = res
                .bytes()
                .await
                .map_err(|e| wreq_send_err(e, "Failed to read responses body"))?;
            return Ok(ExecResponse { payload });
        }

        use eventsource_stream::Eventsource;
        let mut events = res.bytes_stream().eventsource();
        let mut last = Bytes::new();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| PolygateError::Whatever {
                message: format!("codex stream failed: {e}"),
                source: None,
            })?;
            if event.data == "[DONE]" {
                break;
            }
            last = Bytes::from(event.data.to_owned());
            if is_terminal_event(&event.data) {
                break;
            }
        }
        if last.is_empty() {
            return Err(PolygateError::UnexpectedNone {
                msg: "responses stream ended without any event",
            });
        }
        Ok(ExecResponse { payload: last })
    }

    async fn execute_stream(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ChunkReceiver, PolygateError> {
        let res = Self::request(auth, &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to open responses stream"))?
            .check_upstream()
            .await?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            use eventsource_stream::Eventsource;
            let mut events = res.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let terminal = is_terminal_event(&event.data);
                        let frame = sse_frame(&event.event, &event.data);
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                        if terminal {
                            // close our side promptly; the upstream socket
                            // may stay open long after completion
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(PolygateError::Whatever {
                                message: format!("codex stream failed: {e}"),
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
}
