use std::sync::Arc;

use crate::{
    conductor::Conductor,
    middleware::PolicyGate,
    persistence::{BillingStore, DailyLimiter},
    services::usage_sink::UsageRecorder,
};

/// Shared application state handed to the router.
#[derive(Clone)]
pub struct AppState {
    pub conductor: Conductor,
    pub billing: Arc<BillingStore>,
    pub limiter: Arc<DailyLimiter>,
    pub usage: UsageRecorder,
    pub gate: PolicyGate,
}

impl AppState {
    pub fn new(
        conductor: Conductor,
        billing: Arc<BillingStore>,
        limiter: Arc<DailyLimiter>,
        usage: UsageRecorder,
    ) -> Self {
        let gate = PolicyGate::new(limiter.to_owned(), billing.to_owned());
        Self {
            conductor,
            billing,
            limiter,
            usage,
            gate,
        }
    }
}
