use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use arc_swap::ArcSwap;
use http::StatusCode;
use tracing::{debug, warn};

use crate::{
    error::{PolygateError, extract_error_message},
    executors::{ChunkReceiver, ExecOptions, ExecRequest, ExecResponse, ProviderExecutor},
    policy::normalise_model_key,
    services::auth_actor::{AuthPoolHandle, CooldownReason},
};

/// How a failed upstream call affects credential traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, 408, 5xx without auth markers, unclassified transport
    /// failures. Cool the credential down for this model and move on.
    Transient,
    /// The provider refused this credential (401/403/402, or 400 with
    /// account/token markers). Cool down and keep traversing.
    AuthScoped,
    /// Per-credential rate or spend caps (429, or 400 with quota markers).
    Quota,
    /// A genuine client mistake. Abort traversal and surface immediately.
    ClientCaused,
}

fn has_auth_markers(msg: &str) -> bool {
    ["account", "token", "oauth", "credential", "session", "login"]
        .iter()
        .any(|marker| msg.contains(marker))
}

fn has_quota_markers(msg: &str) -> bool {
    ["quota", "rate limit", "cap"]
        .iter()
        .any(|marker| msg.contains(marker))
}

/// Buckets an upstream failure for the traversal loop. In the claude pool
/// an `invalid_request_error` carrying account semantics is an account
/// problem, not a client one, so other credentials must still be tried.
pub fn classify_upstream_error(err: &PolygateError) -> ErrorClass {
    let PolygateError::UpstreamHttp { code, body } = err else {
        // transport-level failure before any status line
        return ErrorClass::Transient;
    };
    let msg = extract_error_message(body).to_lowercase();
    match *code {
        StatusCode::TOO_MANY_REQUESTS => ErrorClass::Quota,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => {
            ErrorClass::AuthScoped
        }
        StatusCode::REQUEST_TIMEOUT => ErrorClass::Transient,
        StatusCode::BAD_REQUEST => {
            if has_quota_markers(&msg) {
                ErrorClass::Quota
            } else if has_auth_markers(&msg) {
                ErrorClass::AuthScoped
            } else {
                ErrorClass::ClientCaused
            }
        }
        code if code.is_server_error() => {
            if has_auth_markers(&msg) {
                ErrorClass::AuthScoped
            } else {
                ErrorClass::Transient
            }
        }
        _ => ErrorClass::Transient,
    }
}

fn cooldown_reason(class: ErrorClass) -> CooldownReason {
    match class {
        ErrorClass::AuthScoped => CooldownReason::AuthRejected,
        ErrorClass::Quota => CooldownReason::Quota,
        _ => CooldownReason::Transient,
    }
}

enum Invocation<'a> {
    Execute(&'a ExecRequest, &'a ExecOptions),
    Count(&'a ExecRequest, &'a ExecOptions),
    Stream(&'a ExecRequest, &'a ExecOptions),
}

enum Outcome {
    Payload(ExecResponse),
    Stream(ChunkReceiver),
}

/// Holds the executor table and drives credential traversal for one
/// provider list: pick, call, classify, cool down, move on.
pub struct AuthManager {
    pool: AuthPoolHandle,
    executors: ArcSwap<HashMap<String, Arc<dyn ProviderExecutor>>>,
}

impl AuthManager {
    pub fn new(pool: AuthPoolHandle) -> Self {
        Self {
            pool,
            executors: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &AuthPoolHandle {
        &self.pool
    }

    pub fn register_executor(&self, executor: Arc<dyn ProviderExecutor>) {
        let id = executor.identifier().trim().to_lowercase();
        self.executors.rcu(|executors| {
            let mut executors = HashMap::clone(executors);
            executors.insert(id.to_owned(), executor.to_owned());
            executors
        });
    }

    pub fn executor(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors
            .load()
            .get(&provider.trim().to_lowercase())
            .cloned()
    }

    pub async fn execute(
        &self,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        match self.traverse(providers, Invocation::Execute(req, opts)).await? {
            Outcome::Payload(resp) => Ok(resp),
            Outcome::Stream(_) => Err(PolygateError::UnexpectedNone {
                msg: "unary invocation produced a stream",
            }),
        }
    }

    pub async fn execute_count(
        &self,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ExecResponse, PolygateError> {
        match self.traverse(providers, Invocation::Count(req, opts)).await? {
            Outcome::Payload(resp) => Ok(resp),
            Outcome::Stream(_) => Err(PolygateError::UnexpectedNone {
                msg: "unary invocation produced a stream",
            }),
        }
    }

    pub async fn execute_stream(
        &self,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> Result<ChunkReceiver, PolygateError> {
        match self.traverse(providers, Invocation::Stream(req, opts)).await? {
            Outcome::Stream(rx) => Ok(rx),
            Outcome::Payload(_) => Err(PolygateError::UnexpectedNone {
                msg: "stream invocation produced a payload",
            }),
        }
    }

    async fn invoke(
        executor: &Arc<dyn ProviderExecutor>,
        auth: &crate::config::AuthCredential,
        invocation: &Invocation<'_>,
    ) -> Result<Outcome, PolygateError> {
        match invocation {
            Invocation::Execute(req, opts) => executor
                .execute(auth, req, opts)
                .await
                .map(Outcome::Payload),
            Invocation::Count(req, opts) => executor
                .count_tokens(auth, req, opts)
                .await
                .map(Outcome::Payload),
            Invocation::Stream(req, opts) => executor
                .execute_stream(auth, req, opts)
                .await
                .map(Outcome::Stream),
        }
    }

    async fn traverse(
        &self,
        providers: &[String],
        invocation: Invocation<'_>,
    ) -> Result<Outcome, PolygateError> {
        let (req, opts) = match &invocation {
            Invocation::Execute(req, opts)
            | Invocation::Count(req, opts)
            | Invocation::Stream(req, opts) => (*req, *opts),
        };
        let model_key = normalise_model_key(&req.model);
        let sticky = stickiness_hash(&opts.idempotency_key);
        let mut last_err: Option<PolygateError> = None;

        for provider in providers {
            let provider = provider.trim().to_lowercase();
            if provider.is_empty() {
                continue;
            }
            let Some(executor) = self.executor(&provider) else {
                debug!("no executor registered for provider {}", provider);
                continue;
            };

            let mut tried: Vec<String> = Vec::new();
            loop {
                let Some(mut auth) = self
                    .pool
                    .acquire(&provider, &model_key, tried.to_owned(), sticky)
                    .await?
                else {
                    break;
                };
                tried.push(auth.id.to_owned());

                // lazy refresh when the token is known-expired
                if auth.token_expired() {
                    match executor.refresh(auth.to_owned()).await {
                        Ok(fresh) => {
                            self.pool.update(fresh.to_owned()).await;
                            auth = fresh;
                        }
                        Err(e) => warn!("[{}] refresh before use failed: {}", provider, e),
                    }
                }

                let mut attempt = Self::invoke(&executor, &auth, &invocation).await;

                // opportunistic refresh on auth-classed failures, then one
                // retry on the same credential before it cools down
                if let Err(err) = &attempt
                    && classify_upstream_error(err) == ErrorClass::AuthScoped
                    && auth.refresh_token().is_some()
                    && let Ok(fresh) = executor.refresh(auth.to_owned()).await
                    && fresh.access_token() != auth.access_token()
                {
                    self.pool.update(fresh.to_owned()).await;
                    attempt = Self::invoke(&executor, &fresh, &invocation).await;
                }

                match attempt {
                    Ok(outcome) => {
                        self.pool
                            .report_success(&provider, &auth.id, &model_key)
                            .await;
                        return Ok(outcome);
                    }
                    Err(err) => {
                        let class = classify_upstream_error(&err);
                        if class == ErrorClass::ClientCaused {
                            return Err(err);
                        }
                        let scope = match class {
                            // account-level refusals block every model
                            ErrorClass::AuthScoped => None,
                            _ if model_key.is_empty() => None,
                            _ => Some(model_key.to_owned()),
                        };
                        warn!("[{}] {} failed: {}", provider, auth.ellipse(), err);
                        self.pool
                            .report_failure(&provider, &auth.id, scope, cooldown_reason(class))
                            .await;
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(PolygateError::NoAuthAvailable))
    }
}

fn stickiness_hash(idempotency_key: &str) -> Option<u64> {
    let key = idempotency_key.trim();
    if key.is_empty() {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    Some(hasher.finish())
}
