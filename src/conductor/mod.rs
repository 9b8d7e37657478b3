use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tracing::warn;

use crate::{
    config::ApiKeyPolicy,
    conductor::masquerade::{rewrite_request_model, rewrite_response_model_fields},
    error::{PolygateError, extract_error_message},
    executors::{ExecOptions, ExecRequest, SourceFormat, translate},
    services::{
        auth_manager::AuthManager,
        registry::{SharedRegistry, seems_claude_model},
    },
    utils::hide_api_key,
};

pub mod masquerade;
mod stream;

/// Per-request context assembled by the API layer: who is calling, under
/// which policy, in which dialect, with which idempotency key.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub client_key: String,
    pub policy: Option<ApiKeyPolicy>,
    pub source_format: SourceFormat,
    pub idempotency_key: String,
}

impl RequestScope {
    pub fn new(
        client_key: impl Into<String>,
        policy: Option<ApiKeyPolicy>,
        source_format: SourceFormat,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            client_key: client_key.into(),
            policy,
            source_format,
            idempotency_key: idempotency_key.into(),
        }
    }

    fn exec_options(&self, stream: bool) -> ExecOptions {
        ExecOptions {
            stream,
            source_format: self.source_format,
            idempotency_key: self.idempotency_key.to_owned(),
        }
    }
}

/// Upstream conditions under which a Claude request may transparently
/// retry against the configured failover target.
pub fn claude_failover_eligible(status: StatusCode, message: &str) -> bool {
    let msg = extract_error_message(message).to_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::UNAUTHORIZED
        | StatusCode::PAYMENT_REQUIRED
        | StatusCode::FORBIDDEN => true,
        StatusCode::INTERNAL_SERVER_ERROR => {
            // the pool signals exhaustion as an internal error with a
            // stable marker; route those to the target provider
            !msg.is_empty()
                && (msg.contains("auth_unavailable")
                    || msg.contains("auth_not_found")
                    || msg.contains("no auth available"))
        }
        StatusCode::BAD_GATEWAY => {
            !msg.is_empty() && msg.contains("unknown provider") && msg.contains("model")
        }
        StatusCode::BAD_REQUEST => {
            !msg.is_empty()
                && (msg.contains("account")
                    || msg.contains("token")
                    || msg.contains("oauth")
                    || msg.contains("credential")
                    || msg.contains("session")
                    || msg.contains("login"))
        }
        _ => false,
    }
}

fn failover_signal(err: &PolygateError) -> (StatusCode, String) {
    (err.status(), err.client_text())
}

#[derive(Clone, Copy)]
enum UnaryKind {
    Execute,
    Count,
}

/// State shared by the unary and streaming paths when a request is
/// switched to its failover target.
struct ResolvedCall {
    providers: Vec<String>,
    model: String,
    payload: Bytes,
    /// The client-requested model to masquerade responses back to,
    /// present only after failover.
    masquerade_model: Option<String>,
}

#[derive(Clone)]
pub struct Conductor {
    pub(crate) auth: Arc<AuthManager>,
    pub(crate) registry: SharedRegistry,
}

impl Conductor {
    pub fn new(auth: Arc<AuthManager>, registry: SharedRegistry) -> Self {
        Self { auth, registry }
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Claude failover target for this request, when the policy enables
    /// one distinct from the model in play.
    fn failover_target(scope: &RequestScope, current_model: &str) -> Option<String> {
        let policy = scope.policy.as_ref()?;
        let target = policy.claude_failover_target_for(current_model)?;
        let target = target.trim().to_string();
        if target.is_empty() || target == current_model.trim() {
            return None;
        }
        Some(target)
    }

    fn log_failover(
        scope: &RequestScope,
        from_model: &str,
        to_model: &str,
        status: StatusCode,
        message: &str,
        reason: &str,
    ) {
        warn!(
            component = "failover",
            client_api_key = %hide_api_key(&scope.client_key),
            from_provider = "claude",
            from_model = %from_model,
            to_model = %to_model,
            status_code = status.as_u16(),
            error_message = %extract_error_message(message),
            idempotency_key = %scope.idempotency_key,
            reason = %reason,
            "triggering automatic failover for Claude request"
        );
    }

    /// Resolves providers for the requested model; when resolution itself
    /// fails but the model looks like a Claude model and the policy allows
    /// it, switches to the failover target before any upstream call.
    fn resolve_call(
        &self,
        scope: &RequestScope,
        model_name: &str,
        payload: &Bytes,
    ) -> Result<ResolvedCall, PolygateError> {
        match self.registry.resolve(model_name) {
            Ok((providers, model)) => Ok(ResolvedCall {
                providers,
                model,
                payload: payload.to_owned(),
                masquerade_model: None,
            }),
            Err(err) => {
                let (status, message) = failover_signal(&err);
                let Some(target) = Self::failover_target(scope, model_name) else {
                    return Err(err);
                };
                if !seems_claude_model(model_name)
                    || !claude_failover_eligible(status, &message)
                {
                    return Err(err);
                }
                let (providers, model) = self.registry.resolve(&target)?;
                Self::log_failover(
                    scope,
                    model_name,
                    &model,
                    status,
                    &message,
                    "unknown_provider",
                );
                Ok(ResolvedCall {
                    providers,
                    model,
                    payload: rewrite_request_model(payload, &target),
                    masquerade_model: Some(model_name.trim().to_string()),
                })
            }
        }
    }

    /// Builds the failover form of a resolved call after an upstream
    /// refusal, or None when this request is not eligible.
    fn failover_call(
        &self,
        scope: &RequestScope,
        call: &ResolvedCall,
        original_model: &str,
        original_payload: &Bytes,
        err: &PolygateError,
    ) -> Option<ResolvedCall> {
        if call.masquerade_model.is_some() {
            // failover is one-shot per request
            return None;
        }
        if !call.providers.iter().any(|p| p == "claude") {
            return None;
        }
        let target = Self::failover_target(scope, &call.model)?;
        let (status, message) = failover_signal(err);
        if !claude_failover_eligible(status, &message) {
            return None;
        }
        let (providers, model) = self.registry.resolve(&target).ok()?;
        Self::log_failover(scope, &call.model, &model, status, &message, "upstream_error");
        Some(ResolvedCall {
            providers,
            model,
            payload: rewrite_request_model(original_payload, &target),
            masquerade_model: Some(original_model.trim().to_string()),
        })
    }

    async fn run_unary(
        &self,
        kind: UnaryKind,
        call: &ResolvedCall,
        scope: &RequestScope,
    ) -> Result<Bytes, PolygateError> {
        let provider = call.providers.first().map(String::as_str).unwrap_or("");
        let payload = translate::request_into_provider(
            scope.source_format,
            provider,
            call.payload.to_owned(),
        )?;
        let req = ExecRequest {
            model: call.model.to_owned(),
            payload,
        };
        let opts = scope.exec_options(false);
        let resp = match kind {
            UnaryKind::Execute => self.auth.execute(&call.providers, &req, &opts).await?,
            UnaryKind::Count => self.auth.execute_count(&call.providers, &req, &opts).await?,
        };
        let payload = translate::response_into_source(scope.source_format, provider, resp.payload)?;
        Ok(match &call.masquerade_model {
            Some(model) => rewrite_response_model_fields(payload, model),
            None => payload,
        })
    }

    async fn execute_unary(
        &self,
        kind: UnaryKind,
        scope: &RequestScope,
        model_name: &str,
        payload: Bytes,
    ) -> Result<Bytes, PolygateError> {
        let call = self.resolve_call(scope, model_name, &payload)?;
        match self.run_unary(kind, &call, scope).await {
            Ok(out) => Ok(out),
            Err(err) => {
                let Some(failover) =
                    self.failover_call(scope, &call, model_name, &payload, &err)
                else {
                    return Err(err);
                };
                self.run_unary(kind, &failover, scope).await
            }
        }
    }

    /// Non-streaming execution with one-shot failover and response
    /// masquerade.
    pub async fn execute(
        &self,
        scope: &RequestScope,
        model_name: &str,
        payload: Bytes,
    ) -> Result<Bytes, PolygateError> {
        self.execute_unary(UnaryKind::Execute, scope, model_name, payload)
            .await
    }

    /// Token-counting execution; identical failover behaviour, different
    /// executor operation.
    pub async fn execute_count(
        &self,
        scope: &RequestScope,
        model_name: &str,
        payload: Bytes,
    ) -> Result<Bytes, PolygateError> {
        self.execute_unary(UnaryKind::Count, scope, model_name, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::{
        config::{ApiKeyFailoverPolicy, AuthCredential, ProviderFailoverPolicy},
        executors::{ChunkReceiver, ExecResponse, ProviderExecutor},
        services::{auth_actor::AuthPoolHandle, registry::ModelRegistry},
    };

    pub(crate) struct FailStatusExecutor {
        pub id: &'static str,
        pub status: StatusCode,
        pub msg: &'static str,
        /// payload chunks emitted before the scripted stream error
        pub payload_chunks_before_error: usize,
        pub calls: Mutex<usize>,
    }

    #[async_trait]
    impl ProviderExecutor for FailStatusExecutor {
        fn identifier(&self) -> &str {
            self.id
        }

        async fn execute(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            *self.calls.lock().unwrap() += 1;
            Err(PolygateError::UpstreamHttp {
                code: self.status,
                body: self.msg.to_string(),
            })
        }

        async fn execute_stream(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ChunkReceiver, PolygateError> {
            *self.calls.lock().unwrap() += 1;
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            for i in 0..self.payload_chunks_before_error {
                tx.send(Ok(Bytes::from(format!("chunk-{i}")))).await.ok();
            }
            tx.send(Err(PolygateError::UpstreamHttp {
                code: self.status,
                body: self.msg.to_string(),
            }))
            .await
            .ok();
            Ok(rx)
        }

        async fn count_tokens(
            &self,
            auth: &AuthCredential,
            req: &ExecRequest,
            opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            self.execute(auth, req, opts).await
        }
    }

    pub(crate) struct OkExecutor {
        pub id: &'static str,
        pub payload: &'static str,
        pub calls: Mutex<usize>,
    }

    #[async_trait]
    impl ProviderExecutor for OkExecutor {
        fn identifier(&self) -> &str {
            self.id
        }

        async fn execute(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            *self.calls.lock().unwrap() += 1;
            Ok(ExecResponse {
                payload: Bytes::from_static(self.payload.as_bytes()),
            })
        }

        async fn execute_stream(
            &self,
            _auth: &AuthCredential,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> Result<ChunkReceiver, PolygateError> {
            *self.calls.lock().unwrap() += 1;
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            tx.send(Ok(Bytes::from_static(self.payload.as_bytes())))
                .await
                .ok();
            Ok(rx)
        }

        async fn count_tokens(
            &self,
            auth: &AuthCredential,
            req: &ExecRequest,
            opts: &ExecOptions,
        ) -> Result<ExecResponse, PolygateError> {
            self.execute(auth, req, opts).await
        }
    }

    pub(crate) fn failover_policy() -> ApiKeyPolicy {
        ApiKeyPolicy {
            api_key: "client-key".into(),
            failover: ApiKeyFailoverPolicy {
                claude: ProviderFailoverPolicy {
                    enabled: true,
                    target_model: "gpt-5.2(high)".into(),
                    rules: Vec::new(),
                },
            },
            ..Default::default()
        }
    }

    pub(crate) fn scope_with(policy: Option<ApiKeyPolicy>) -> RequestScope {
        RequestScope::new("client-key", policy, SourceFormat::Claude, "idem-1")
    }

    pub(crate) async fn conductor_with(
        executors: Vec<Arc<dyn ProviderExecutor>>,
        credentials: Vec<AuthCredential>,
        models: &[(&str, &str)],
    ) -> Conductor {
        let pool = AuthPoolHandle::start(credentials).await.unwrap();
        let manager = Arc::new(AuthManager::new(pool));
        for executor in executors {
            manager.register_executor(executor);
        }
        let registry = Arc::new(ModelRegistry::new());
        for (model, provider) in models {
            registry.register_model(model, provider);
        }
        Conductor::new(manager, registry)
    }

    fn model_of(body: &[u8]) -> String {
        serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn failover_rewrites_model_in_response() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::TOO_MANY_REQUESTS,
            msg: "weekly cap",
            payload_chunks_before_error: 0,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: r#"{"id":"msg_abc","model":"gpt-5.2","type":"message","role":"assistant","content":[{"type":"text","text":"hello"}]}"#,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude.to_owned() as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("claude-auth-mr", "claude"),
                AuthCredential::new("codex-auth-mr", "codex"),
            ],
            &[("claude-opus-4-6", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let payload = Bytes::from(r#"{"model":"claude-opus-4-6","stream":false}"#);
        let resp = conductor
            .execute(&scope, "claude-opus-4-6", payload)
            .await
            .unwrap();

        assert_eq!(model_of(&resp), "claude-opus-4-6", "failover model leaked");
        let value: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(value["id"], "msg_abc");
        assert_eq!(*claude.calls.lock().unwrap(), 1);
        assert_eq!(*codex.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failover_disabled_surfaces_upstream_status() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::TOO_MANY_REQUESTS,
            msg: "weekly cap",
            payload_chunks_before_error: 0,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: "ok",
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("claude-auth", "claude"),
                AuthCredential::new("codex-auth", "codex"),
            ],
            &[("claude-model", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let mut policy = failover_policy();
        policy.failover.claude.enabled = false;
        let scope = scope_with(Some(policy));
        let err = conductor
            .execute(
                &scope,
                "claude-model",
                Bytes::from(r#"{"model":"claude-model"}"#),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(*codex.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_fails_over_before_any_upstream_call() {
        // no claude executor at all; pool exhaustion carries the
        // auth_unavailable marker which is failover eligible
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: r#"{"id":"msg_xyz","model":"gpt-5.2-high","type":"message","content":[]}"#,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![codex.to_owned() as Arc<dyn ProviderExecutor>],
            vec![AuthCredential::new("codex-auth-up", "codex")],
            &[("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let resp = conductor
            .execute(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":false}"#),
            )
            .await
            .unwrap();
        assert_eq!(model_of(&resp), "claude-opus-4-6");
        assert_eq!(*codex.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn no_failover_leaves_response_untouched() {
        let payload =
            r#"{"id":"msg_ok","model":"claude-opus-4-6","type":"message","content":[]}"#;
        let claude = Arc::new(OkExecutor {
            id: "claude",
            payload,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude as Arc<dyn ProviderExecutor>],
            vec![AuthCredential::new("claude-auth-nf", "claude")],
            &[("claude-opus-4-6", "claude")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let resp = conductor
            .execute(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6","stream":false}"#),
            )
            .await
            .unwrap();
        assert_eq!(
            &resp[..],
            payload.as_bytes(),
            "without failover the payload must be byte-identical"
        );
    }

    #[tokio::test]
    async fn count_path_fails_over_like_execute() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::FORBIDDEN,
            msg: "org disabled",
            payload_chunks_before_error: 0,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: r#"{"input_tokens":7}"#,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude as Arc<dyn ProviderExecutor>, codex.to_owned()],
            vec![
                AuthCredential::new("c1", "claude"),
                AuthCredential::new("x1", "codex"),
            ],
            &[("claude-opus-4-6", "claude"), ("gpt-5.2", "codex")],
        )
        .await;

        let scope = scope_with(Some(failover_policy()));
        let resp = conductor
            .execute_count(
                &scope,
                "claude-opus-4-6",
                Bytes::from(r#"{"model":"claude-opus-4-6"}"#),
            )
            .await
            .unwrap();
        assert_eq!(&resp[..], br#"{"input_tokens":7}"#);
        assert_eq!(*codex.calls.lock().unwrap(), 1);
    }

    #[test]
    fn eligibility_table() {
        assert!(claude_failover_eligible(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(claude_failover_eligible(StatusCode::UNAUTHORIZED, ""));
        assert!(claude_failover_eligible(StatusCode::PAYMENT_REQUIRED, ""));
        assert!(claude_failover_eligible(StatusCode::FORBIDDEN, ""));
        assert!(claude_failover_eligible(
            StatusCode::INTERNAL_SERVER_ERROR,
            "auth_unavailable: no auth available"
        ));
        assert!(!claude_failover_eligible(
            StatusCode::INTERNAL_SERVER_ERROR,
            "database on fire"
        ));
        assert!(claude_failover_eligible(
            StatusCode::BAD_GATEWAY,
            "unknown provider for model claude-x"
        ));
        assert!(!claude_failover_eligible(
            StatusCode::BAD_GATEWAY,
            "bad gateway"
        ));
        assert!(claude_failover_eligible(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"invalid_request_error","message":"account disabled"}}"#
        ));
        assert!(claude_failover_eligible(
            StatusCode::BAD_REQUEST,
            "oauth token expired"
        ));
        assert!(!claude_failover_eligible(
            StatusCode::BAD_REQUEST,
            "messages: field required"
        ));
        assert!(!claude_failover_eligible(StatusCode::NOT_FOUND, "nope"));
    }

    #[tokio::test]
    async fn failover_rules_pick_model_specific_target() {
        let claude = Arc::new(FailStatusExecutor {
            id: "claude",
            status: StatusCode::TOO_MANY_REQUESTS,
            msg: "cap",
            payload_chunks_before_error: 0,
            calls: Mutex::new(0),
        });
        let codex = Arc::new(OkExecutor {
            id: "codex",
            payload: r#"{"model":"gpt-5.2-mini"}"#,
            calls: Mutex::new(0),
        });
        let conductor = conductor_with(
            vec![claude as Arc<dyn ProviderExecutor>, codex],
            vec![
                AuthCredential::new("c1", "claude"),
                AuthCredential::new("x1", "codex"),
            ],
            &[
                ("claude-haiku-4-5", "claude"),
                ("gpt-5.2-mini", "codex"),
                ("gpt-5.2", "codex"),
            ],
        )
        .await;

        let mut policy = failover_policy();
        policy.failover.claude.rules = vec![crate::config::ModelFailoverRule {
            from_model: "claude-haiku-*".into(),
            target_model: "gpt-5.2-mini".into(),
        }];
        let scope = scope_with(Some(policy));
        let resp = conductor
            .execute(
                &scope,
                "claude-haiku-4-5",
                Bytes::from(r#"{"model":"claude-haiku-4-5"}"#),
            )
            .await
            .unwrap();
        assert_eq!(model_of(&resp), "claude-haiku-4-5");
    }
}
