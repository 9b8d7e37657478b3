use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    conductor::{Conductor, RequestScope, ResolvedCall, masquerade::rewrite_stream_chunk_model_fields},
    config::POLYGATE_CONFIG,
    error::PolygateError,
    executors::{CHUNK_CHANNEL_CAPACITY, ChunkReceiver, ExecRequest, translate},
};

/// Statuses on which a fresh stream may be silently re-established before
/// any payload bytes have been flushed to the client.
fn bootstrap_eligible(err: &PolygateError) -> bool {
    let status = err.status();
    matches!(
        status.as_u16(),
        401 | 402 | 403 | 408 | 429
    ) || status.is_server_error()
}

impl Conductor {
    fn stream_request(
        call: &ResolvedCall,
        scope: &RequestScope,
    ) -> Result<ExecRequest, PolygateError> {
        let provider = call.providers.first().map(String::as_str).unwrap_or("");
        let payload = translate::request_into_provider(
            scope.source_format,
            provider,
            call.payload.to_owned(),
        )?;
        Ok(ExecRequest {
            model: call.model.to_owned(),
            payload,
        })
    }

    /// Streaming execution. Failures before the first payload byte may be
    /// retried (bounded bootstrap retries) or failed over once; after the
    /// first byte has been flushed every error is surfaced as the stream's
    /// terminal item. Chunks are re-emitted in upstream order.
    pub async fn execute_stream(
        &self,
        scope: &RequestScope,
        model_name: &str,
        payload: Bytes,
    ) -> Result<ChunkReceiver, PolygateError> {
        let opts = scope.exec_options(true);
        let mut active = self.resolve_call(scope, model_name, &payload)?;
        let mut req = Self::stream_request(&active, scope)?;

        let mut upstream = match self.auth.execute_stream(&active.providers, &req, &opts).await {
            Ok(rx) => rx,
            Err(err) => {
                // immediate failure, no stream established yet
                let Some(failover) =
                    self.failover_call(scope, &active, model_name, &payload, &err)
                else {
                    return Err(err);
                };
                req = Self::stream_request(&failover, scope)?;
                active = failover;
                self.auth
                    .execute_stream(&active.providers, &req, &opts)
                    .await?
            }
        };

        let (tx, rx_out) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let conductor = self.to_owned();
        let scope = scope.to_owned();
        let original_model = model_name.to_string();
        let original_payload = payload;
        tokio::spawn(async move {
            let mut sent_payload = false;
            let mut bootstrap_left = POLYGATE_CONFIG.load().streaming_bootstrap_retries;
            loop {
                let Some(item) = upstream.recv().await else {
                    // upstream finished; dropping tx closes our side
                    return;
                };
                match item {
                    Ok(chunk) => {
                        sent_payload = true;
                        let chunk = match &active.masquerade_model {
                            Some(model) => rewrite_stream_chunk_model_fields(chunk, model),
                            None => chunk,
                        };
                        let provider =
                            active.providers.first().map(String::as_str).unwrap_or("");
                        let chunk = match translate::response_into_source(
                            scope.source_format,
                            provider,
                            chunk,
                        ) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            // client disconnected
                            return;
                        }
                    }
                    Err(mut err) => {
                        if !sent_payload {
                            if bootstrap_left > 0 && bootstrap_eligible(&err) {
                                bootstrap_left -= 1;
                                match conductor
                                    .auth
                                    .execute_stream(&active.providers, &req, &opts)
                                    .await
                                {
                                    Ok(rx) => {
                                        upstream = rx;
                                        continue;
                                    }
                                    Err(e2) => err = e2,
                                }
                            }
                            if let Some(failover) = conductor.failover_call(
                                &scope,
                                &active,
                                &original_model,
                                &original_payload,
                                &err,
                            ) {
                                match Self::stream_request(&failover, &scope) {
                                    Ok(failover_req) => {
                                        match conductor
                                            .auth
                                            .execute_stream(
                                                &failover.providers,
                                                &failover_req,
                                                &opts,
                                            )
                                            .await
                                        {
                                            Ok(rx) => {
                                                active = failover;
                                                req = failover_req;
                                                upstream = rx;
                                                bootstrap_left = POLYGATE_CONFIG
                                                    .load()
                                                    .streaming_bootstrap_retries;
                                                continue;
                                            }
                                            Err(e2) => err = e2,
                                        }
                                    }
                                    Err(e2) => err = e2,
                                }
                            }
                        }
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx_out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use http::StatusCode;

    use super::*;
    use crate::{
        conductor::tests::{
            FailStatusExecutor, OkExecutor, conductor_with, failover_policy, scope_with,
        },
        config::AuthCredential,
        executors::{ExecOptions, ExecResponse, ProviderExecutor},
    };

    async fn collect(mut rx: ChunkReceiver) -> (Vec<Bytes>, Option<PolygateError>) {
        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => return (chunks, Some(e)),
            }
        }
        (chunks, None)
    }

    #[tokio::test]
    async fn pre_first_byte_failover_masquerades_chunks() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::TOO_MANY_REQUESTS,
            msg: "rolling cap",
            payload_chunks_before_error: 0,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: r#"{"type":"message_start","message":{"model":"gpt-5.2","role":"assistant","content":[]}}"#,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude.to_owned() as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("claude-auth-smr", "claude"),
                AuthCredential::new("codex-auth-smr", "codex"),
            ],
            &[("claude-opus-4-6", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let rx = conductor
            .execute_stream(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":true}"#),
            )
            .await
            .unwrap();

        let (chunks, err) = collect(rx).await;
        assert!(err.is_none(), "unexpected error: {err:?}");
        let joined: Vec<u8> = chunks.concat();
        let value: serde_json::Value = serde_json::from_slice(&joined).unwrap();
        assert_eq!(
            value["message"]["model"], "claude-opus-4-6",
            "failover model leaked into the stream"
        );
        assert_eq!(*codex.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn no_retry_after_first_payload_byte() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::TOO_MANY_REQUESTS,
            msg: "cap",
            payload_chunks_before_error: 1,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: "never",
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude.to_owned() as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("c1", "claude"),
                AuthCredential::new("x1", "codex"),
            ],
            &[("claude-opus-4-6", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let rx = conductor
            .execute_stream(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":true}"#),
            )
            .await
            .unwrap();

        let (chunks, err) = collect(rx).await;
        assert_eq!(chunks, vec![Bytes::from("chunk-0")]);
        let err = err.expect("error must surface after first byte");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            *codex.calls.lock().unwrap(),
            0,
            "bytes out means no failover"
        );
        assert_eq!(*claude.calls.lock().unwrap(), 1, "and no bootstrap retry");
    }

    /// Fails the stream once, then serves it.
    struct FlakyStreamExecutor {
        attempts: Mutex<usize>,
    }

    #[async_trait]
    impl ProviderExecutor for FlakyStreamExecutor {
        fn identifier(&self) -> &str {
            "claude"
        }

        async fn execute(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            unreachable!("streaming test")
        }

        async fn execute_stream(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ChunkReceiver, PolygateError> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            let first = *attempts == 1;
            drop(attempts);
            let (tx, rx) = mpsc::channel(4);
            if first {
                tx.send(Err(PolygateError::UpstreamHttp {
                    code: StatusCode::SERVICE_UNAVAILABLE,
                    body: "overloaded".into(),
                }))
                .await
                .ok();
            } else {
                tx.send(Ok(Bytes::from_static(b"data: {\"ok\":true}\n\n")))
                    .await
                    .ok();
            }
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn bootstrap_retry_recovers_transient_stream_failure() {
        let claude = Arc::new(FlakyStreamExecutor {
            attempts: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude.to_owned() as Arc<dyn ProviderExecutor>],
            vec![AuthCredential::new("c1", "claude")],
            &[("claude-opus-4-6", "claude")],
        )
        .await;

        let scope = scope_with(None);
        let rx = conductor
            .execute_stream(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":true}"#),
            )
            .await
            .unwrap();

        let (chunks, err) = collect(rx).await;
        assert!(err.is_none(), "bootstrap retry should recover: {err:?}");
        assert_eq!(chunks, vec![Bytes::from_static(b"data: {\"ok\":true}\n\n")]);
        assert_eq!(*claude.attempts.lock().unwrap(), 2);
    }

    /// Rejects the stream before a channel even exists.
    struct ImmediateFailExecutor;

    #[async_trait]
    impl ProviderExecutor for ImmediateFailExecutor {
        fn identifier(&self) -> &str {
            "claude"
        }

        async fn execute(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            unreachable!("streaming test")
        }

        async fn execute_stream(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ChunkReceiver, PolygateError> {
            Err(PolygateError::UpstreamHttp {
                code: StatusCode::FORBIDDEN,
                body: "org disabled".into(),
            })
        }
    }

    #[tokio::test]
    async fn immediate_stream_failure_fails_over_before_spawn() {
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: "ok",
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![Arc::new(ImmediateFailExecutor) as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("c1", "claude"),
                AuthCredential::new("x1", "codex"),
            ],
            &[("claude-opus-4-6", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let rx = conductor
            .execute_stream(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":true}"#),
            )
            .await
            .unwrap();
        let (chunks, err) = collect(rx).await;
        assert!(err.is_none());
        assert_eq!(chunks, vec![Bytes::from("ok")]);
        assert_eq!(*codex.calls.lock().unwrap(), 1);
    }
}
