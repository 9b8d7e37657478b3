use axum::{
    Router,
    http::HeaderMap,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, options, post},
};

use crate::{
    api::{
        api_completions, api_count_tokens, api_delete_model_price, api_gemini_generate,
        api_get_credentials, api_get_daily_usage, api_get_model_prices, api_get_policies,
        api_messages, api_patch_policy, api_put_model_price, api_put_policies, api_responses,
    },
    middleware::{enforce_api_key_policy, require_client_auth},
    state::AppState,
};

/// RouterBuilder for the application
pub struct RouterBuilder {
    state: AppState,
    inner: Router<AppState>,
}

impl RouterBuilder {
    fn new(state: AppState) -> Self {
        RouterBuilder {
            state,
            inner: Router::new(),
        }
    }

    /// Assembles the default route set: the LLM dialect endpoints behind
    /// client auth and the policy gate, plus the management API.
    pub fn new_default(state: AppState) -> Self {
        Self::new(state)
            .route_llm_endpoints()
            .route_management_endpoints()
    }

    fn route_llm_endpoints(mut self) -> Self {
        let llm = Router::new()
            .route("/v1/messages", post(api_messages))
            .route("/v1/messages/count_tokens", post(api_count_tokens))
            .route("/v1/chat/completions", post(api_completions))
            .route("/responses", post(api_responses))
            .route("/v1beta/models/{model_action}", post(api_gemini_generate))
            .layer(from_fn_with_state(
                self.state.gate.to_owned(),
                enforce_api_key_policy,
            ))
            .layer(from_fn(require_client_auth));
        self.inner = self
            .inner
            .route("/v1", options(api_options))
            .merge(llm);
        self
    }

    fn route_management_endpoints(mut self) -> Self {
        self.inner = self
            .inner
            .route(
                "/api/policies",
                get(api_get_policies)
                    .put(api_put_policies)
                    .patch(api_patch_policy),
            )
            .route(
                "/api/prices",
                get(api_get_model_prices)
                    .put(api_put_model_price)
                    .delete(api_delete_model_price),
            )
            .route("/api/usage", get(api_get_daily_usage))
            .route("/api/credentials", get(api_get_credentials));
        self
    }

    /// Returns the configured router
    pub fn build(self) -> Router {
        self.inner.with_state(self.state)
    }
}

/// Handles CORS preflight requests
async fn api_options() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("access-control-allow-origin", "*".parse().unwrap());
    headers.insert(
        "access-control-allow-headers",
        "Authorization, Content-Type, x-api-key, Idempotency-Key"
            .parse()
            .unwrap(),
    );
    headers.insert(
        "access-control-allow-methods",
        "POST, GET, OPTIONS".parse().unwrap(),
    );
    headers
}
