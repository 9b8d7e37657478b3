use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Attribute keys shared between config files and executors.
pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_BASE_URL: &str = "base_url";
pub const ATTR_ACCESS_TOKEN: &str = "access_token";
pub const ATTR_REFRESH_TOKEN: &str = "refresh_token";
pub const ATTR_EXPIRES_AT: &str = "expires_at";

/// Lifecycle state of an upstream credential.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    CoolingDown,
    Disabled,
    Invalid,
}

/// One upstream account: an identity, a provider tag and an attribute map
/// holding whatever the provider executor needs (API key, base URL,
/// refreshable token material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCredential {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(skip)]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl PartialEq for AuthCredential {
    fn eq(&self, other: &Self) -> bool {
        self.provider == other.provider && self.id == other.id
    }
}
impl Eq for AuthCredential {}

impl AuthCredential {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into().trim().to_lowercase(),
            status: AuthStatus::Active,
            attributes: HashMap::new(),
            last_error_at: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.attribute(ATTR_API_KEY)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.attribute(ATTR_BASE_URL)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.attribute(ATTR_ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.attribute(ATTR_REFRESH_TOKEN)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// True when the credential carries refreshable token material whose
    /// expiry is known and within the renewal margin.
    pub fn token_expired(&self) -> bool {
        if self.refresh_token().is_none() {
            return false;
        }
        let Some(expires_at) = self
            .attribute(ATTR_EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok())
        else {
            return false;
        };
        // refresh five minutes early
        Utc::now().timestamp() >= expires_at - 300
    }

    pub fn selectable(&self) -> bool {
        matches!(self.status, AuthStatus::Active | AuthStatus::CoolingDown)
    }

    /// Shortened id for log lines.
    pub fn ellipse(&self) -> String {
        if self.id.len() > 12 {
            format!("{}...", &self.id[..12])
        } else {
            self.id.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_needs_refresh_material() {
        let mut auth = AuthCredential::new("a1", "claude");
        assert!(!auth.token_expired());

        auth.set_attribute(ATTR_REFRESH_TOKEN, "rt");
        auth.set_attribute(ATTR_EXPIRES_AT, "0");
        assert!(auth.token_expired());

        let future = (Utc::now().timestamp() + 3600).to_string();
        auth.set_attribute(ATTR_EXPIRES_AT, future);
        assert!(!auth.token_expired());
    }

    #[test]
    fn identity_is_provider_scoped() {
        let a = AuthCredential::new("x", "claude");
        let b = AuthCredential::new("x", "codex");
        assert_ne!(a, b);
        assert_eq!(a, AuthCredential::new("x", "Claude"));
    }
}
