/// Authentication and policy enforcement middleware.
///
/// - Authentication: validate proxy-issued client keys and the admin key
/// - Policy gate: per-key model restrictions, budgets and daily limits,
///   applied to JSON-body requests before they reach the handlers
mod auth;
mod policy_gate;

pub use auth::{ClientKey, RequireAdminAuth, require_client_auth};
pub use policy_gate::{PolicyEntry, PolicyGate, enforce_api_key_policy};
