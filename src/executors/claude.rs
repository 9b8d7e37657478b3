use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    config::{
        ATTR_ACCESS_TOKEN, ATTR_EXPIRES_AT, ATTR_REFRESH_TOKEN, AuthCredential, CLAUDE_ENDPOINT,
        CLAUDE_TOKEN_URL,
    },
    error::{CheckUpstreamErr, PolygateError},
    executors::{
        CHUNK_CHANNEL_CAPACITY, ChunkReceiver, ExecOptions, ExecRequest, ExecResponse,
        ProviderExecutor, UPSTREAM_CLIENT, sse_frame, wreq_send_err,
    },
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub struct ClaudeExecutor;

impl ClaudeExecutor {
    fn endpoint(auth: &AuthCredential, path: &str) -> String {
        let base = auth.base_url().unwrap_or(CLAUDE_ENDPOINT);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    fn request(auth: &AuthCredential, url: String, payload: &Bytes) -> wreq::RequestBuilder {
        let mut builder = UPSTREAM_CLIENT
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .body(payload.to_vec());
        if let Some(token) = auth.access_token() {
            builder = builder.bearer_auth(token);
        } else if let Some(key) = auth.api_key() {
            builder = builder.header("x-api-key", key);
        }
        builder
    }
}

#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &str {
        "claude"
    }

    async fn execute(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        let res = Self::request(auth, Self::endpoint(auth, "/v1/messages"), &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to send chat message"))?
            .check_upstream()
            .await?;
        let payload = res
            .bytes()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to read chat response"))?;
        Ok(ExecResponse { payload })
    }

    async fn execute_stream(
        &self,
        auth: &AuthCredential,
        req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> Result<ChunkReceiver, PolygateError> {
        let res = Self::request(auth, Self::endpoint(auth, "/v1/messages"), &req.payload)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to open chat stream"))?
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
                            // client went away
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(PolygateError::Whatever {
                                message: format!("claude stream failed: {e}"),
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
        let res = Self::request(
            auth,
            Self::endpoint(auth, "/v1/messages/count_tokens"),
            &req.payload,
        )
        .send()
        .await
        .map_err(|e| wreq_send_err(e, "Failed to count tokens"))?
        .check_upstream()
        .await?;
        let payload = res
            .bytes()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to read count response"))?;
        Ok(ExecResponse { payload })
    }

    /// Exchanges the refresh token for fresh access material and writes it
    /// back into the credential attributes.
    async fn refresh(&self, mut auth: AuthCredential) -> Result<AuthCredential, PolygateError> {
        let Some(refresh_token) = auth.refresh_token().map(str::to_string) else {
            return Ok(auth);
        };
        debug!("refreshing token for credential {}", auth.ellipse());
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": OAUTH_CLIENT_ID,
        });
        let res = UPSTREAM_CLIENT
            .post(CLAUDE_TOKEN_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to refresh token"))?
            .check_upstream()
            .await?;
        let grant: TokenGrant = res
            .json()
            .await
            .map_err(|e| wreq_send_err(e, "Failed to parse token grant"))?;
        if grant.access_token.is_empty() {
            warn!("token endpoint returned an empty access token");
            return Err(PolygateError::UnexpectedNone {
                msg: "empty access token in refresh grant",
            });
        }
        auth.set_attribute(ATTR_ACCESS_TOKEN, grant.access_token);
        if !grant.refresh_token.is_empty() {
            auth.set_attribute(ATTR_REFRESH_TOKEN, grant.refresh_token);
        }
        if grant.expires_in > 0 {
            auth.set_attribute(
                ATTR_EXPIRES_AT,
                (Utc::now().timestamp() + grant.expires_in).to_string(),
            );
        }
        Ok(auth)
    }
}
