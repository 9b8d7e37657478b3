use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use http::Method;
use serde_json::Value;

use crate::{
    config::{ApiKeyPolicy, POLYGATE_CONFIG},
    error::PolygateError,
    middleware::auth::ClientKey,
    persistence::{BillingStore, DailyLimiter, usd_per_1m_to_micro},
    policy::{downgrade_claude_opus46, normalise_model_key, today_china},
};

/// The resolved policy for the authenticated key, available to handlers
/// (the conductor reads the failover block from it).
#[derive(Debug, Clone)]
pub struct PolicyEntry(pub Arc<ApiKeyPolicy>);

type PolicyLookup = Arc<dyn Fn(&str) -> Option<ApiKeyPolicy> + Send + Sync>;

/// State for the policy enforcement layer. The policy lookup is a closure
/// so the layer follows config reloads and stays testable.
#[derive(Clone)]
pub struct PolicyGate {
    limiter: Arc<DailyLimiter>,
    billing: Arc<BillingStore>,
    lookup: PolicyLookup,
}

impl PolicyGate {
    pub fn new(limiter: Arc<DailyLimiter>, billing: Arc<BillingStore>) -> Self {
        Self {
            limiter,
            billing,
            lookup: Arc::new(|key| POLYGATE_CONFIG.load().find_policy(key).cloned()),
        }
    }

    pub fn with_lookup(
        limiter: Arc<DailyLimiter>,
        billing: Arc<BillingStore>,
        lookup: PolicyLookup,
    ) -> Self {
        Self {
            limiter,
            billing,
            lookup,
        }
    }
}

fn body_model(bytes: &Bytes) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let model = value.get("model")?.as_str()?.trim().to_string();
    (!model.is_empty()).then_some(model)
}

fn patch_body_model(bytes: &Bytes, model: &str) -> Option<Bytes> {
    let mut value: Value = serde_json::from_slice(bytes).ok()?;
    let obj = value.as_object_mut()?;
    obj.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&value).ok().map(Bytes::from)
}

/// Enforces per-key restrictions on JSON-body requests: daily budget,
/// transparent opus downgrade, exclusion patterns and daily limits, then
/// patches the request body when the model was rewritten.
pub async fn enforce_api_key_policy(
    State(gate): State<PolicyGate>,
    req: Request,
    next: Next,
) -> Result<Response, PolygateError> {
    // GET /v1/models and friends are handled by response filtering
    if matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return Ok(next.run(req).await);
    }
    let Some(ClientKey(api_key)) = req.extensions().get::<ClientKey>().cloned() else {
        return Ok(next.run(req).await);
    };
    let Some(policy) = (gate.lookup)(&api_key) else {
        return Ok(next.run(req).await);
    };

    let (mut parts, body) = req.into_parts();
    parts.extensions.insert(PolicyEntry(Arc::new(policy.to_owned())));

    // daily budget first, based on persisted spend
    if policy.daily_budget_usd > 0.0 {
        let day_key = today_china();
        let spent = gate.billing.get_daily_cost_micro(&api_key, &day_key).await?;
        let budget_micro = usd_per_1m_to_micro(policy.daily_budget_usd);
        if budget_micro > 0 && spent >= budget_micro {
            return Err(PolygateError::DailyBudgetExceeded);
        }
    }

    let bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| PolygateError::InvalidInput {
            msg: format!("failed to read request body: {e}"),
        })?;
    let Some(model) = body_model(&bytes) else {
        return Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await);
    };

    let mut effective_model = model.to_owned();
    if !policy.allows_claude_opus46() {
        let (rewritten, changed) = downgrade_claude_opus46(&effective_model);
        if changed {
            effective_model = rewritten;
        }
    }

    let model_key = normalise_model_key(&effective_model);
    if policy.excludes(&model_key) {
        return Err(PolygateError::ModelDenied);
    }

    if let Some((limit, limit_key)) = policy.daily_limit_for(&model_key) {
        let day_key = today_china();
        let (_, allowed) = gate
            .limiter
            .consume(&api_key, &limit_key, &day_key, limit)
            .await?;
        if !allowed {
            return Err(PolygateError::DailyLimitExceeded);
        }
    }

    let bytes = if effective_model != model {
        match patch_body_model(&bytes, &effective_model) {
            Some(patched) => patched,
            None => bytes,
        }
    } else {
        bytes
    };
    let mut req = Request::from_parts(parts, Body::from(bytes.to_owned()));
    req.headers_mut().insert(
        http::header::CONTENT_LENGTH,
        http::HeaderValue::from(bytes.len()),
    );
    Ok(next.run(req).await)
}
