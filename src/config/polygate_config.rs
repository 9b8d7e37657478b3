use axum::http::{Uri, uri::Scheme};
use colored::Colorize;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use passwords::PasswordGenerator;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::Display,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};
use tracing::{error, warn};
use wreq::Proxy;

use crate::{
    config::{
        ApiKeyPolicy, AuthCredential, CONFIG_NAME, default_auto_model, default_bootstrap_retries,
        default_cooldown_base_secs, default_cooldown_max_secs, default_ip, default_port,
        find_api_key_policy, sanitize_api_key_policies,
    },
    error::PolygateError,
};

use super::{ARG_CONFIG_FILE, CONFIG_PATH};

/// Generates a random password for authentication
fn generate_password() -> String {
    let pg = PasswordGenerator {
        length: 64,
        numbers: true,
        lowercase_letters: true,
        uppercase_letters: true,
        symbols: false,
        spaces: false,
        exclude_similar_characters: true,
        strict: true,
    };

    println!("{}", "Generating random admin password......".green());
    pg.generate_one().unwrap()
}

/// A struct representing the configuration of the application
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PolygateConfig {
    // Upstream credentials, can hot reload
    #[serde(default)]
    pub credentials: Vec<AuthCredential>,

    // Server settings, cannot hot reload
    #[serde(default = "default_ip")]
    ip: IpAddr,
    #[serde(default = "default_port")]
    port: u16,

    // Client authentication, can hot reload
    #[serde(default)]
    api_keys: HashSet<String>,
    #[serde(default)]
    admin_password: String,

    // Per-key policy table, can hot reload
    #[serde(default)]
    pub api_key_policies: Vec<ApiKeyPolicy>,

    // Routing settings, can hot reload
    #[serde(default = "default_auto_model")]
    pub auto_model: String,

    // Execution settings, can hot reload
    #[serde(default = "default_bootstrap_retries")]
    pub streaming_bootstrap_retries: usize,
    #[serde(default)]
    pub non_stream_keep_alive_secs: u64,
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,
    #[serde(default = "default_cooldown_max_secs")]
    pub cooldown_max_secs: u64,

    // Network settings, can hot reload
    #[serde(default)]
    pub proxy: Option<String>,

    // Persistence settings, cannot hot reload
    #[serde(default)]
    pub limits_db: Option<PathBuf>,
    #[serde(default)]
    pub billing_db: Option<PathBuf>,

    // Skip field, can hot reload
    #[serde(skip)]
    pub wreq_proxy: Option<Proxy>,
}

impl Default for PolygateConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            ip: default_ip(),
            port: default_port(),
            api_keys: HashSet::new(),
            admin_password: String::new(),
            api_key_policies: Vec::new(),
            auto_model: default_auto_model(),
            streaming_bootstrap_retries: default_bootstrap_retries(),
            non_stream_keep_alive_secs: 0,
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_max_secs: default_cooldown_max_secs(),
            proxy: None,
            limits_db: None,
            billing_db: None,
            wreq_proxy: None,
        }
    }
}

impl Display for PolygateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let authority = format!("{}:{}", self.ip, self.port);
        let api_url = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(authority.to_owned())
            .path_and_query("/v1")
            .build()
            .map_err(|_| std::fmt::Error)?;
        writeln!(f, "LLM API Endpoint: {}", api_url.to_string().green().underline())?;
        writeln!(f, "Admin Password: {}", self.admin_password.yellow())?;
        writeln!(f, "Client keys: {}", self.api_keys.len().to_string().blue())?;
        writeln!(
            f,
            "Key policies: {}",
            self.api_key_policies.len().to_string().blue()
        )?;
        writeln!(
            f,
            "Credentials: {}",
            self.credentials.len().to_string().blue()
        )?;
        if let Some(ref proxy) = self.proxy {
            writeln!(f, "Proxy: {}", proxy.to_string().blue())?;
        }
        Ok(())
    }
}

impl PolygateConfig {
    /// A proxy key is accepted when it is listed directly or carries a
    /// policy entry.
    pub fn client_auth(&self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        self.api_keys.contains(key) || find_api_key_policy(&self.api_key_policies, key).is_some()
    }

    pub fn admin_auth(&self, key: &str) -> bool {
        !self.admin_password.is_empty() && key == self.admin_password
    }

    pub fn find_policy(&self, api_key: &str) -> Option<&ApiKeyPolicy> {
        find_api_key_policy(&self.api_key_policies, api_key)
    }

    /// Loads configuration from files and environment variables
    pub fn new() -> Self {
        let config = Figment::new()
            .adjoin(Toml::file("config.toml"))
            .adjoin(Toml::file(CONFIG_NAME));
        let config: PolygateConfig = if let Some(arg_config) = ARG_CONFIG_FILE.as_ref() {
            config.merge(Toml::file(arg_config))
        } else {
            config
        }
        .admerge(Env::prefixed("POLYGATE_"))
        .extract_lossy()
        .inspect_err(|e| {
            error!("Failed to load config: {}", e);
        })
        .unwrap_or_default();
        let config = config.validate();
        config.save().unwrap_or_else(|e| {
            error!("Failed to save config: {}", e);
        });
        config
    }

    /// address of proxy
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Resolved path of the request-limit database.
    pub fn limits_db_path(&self) -> PathBuf {
        self.limits_db
            .to_owned()
            .unwrap_or_else(|| default_db_path("polygate.limits.sqlite"))
    }

    /// Resolved path of the billing database.
    pub fn billing_db_path(&self) -> PathBuf {
        self.billing_db
            .to_owned()
            .unwrap_or_else(|| default_db_path("polygate.billing.sqlite"))
    }

    /// Save the configuration to a file
    pub fn save(&self) -> Result<(), PolygateError> {
        Ok(std::fs::write(
            CONFIG_PATH.as_path(),
            toml::ser::to_string_pretty(self)?,
        )?)
    }

    /// Validate the configuration
    pub fn validate(mut self) -> Self {
        if self.admin_password.trim().is_empty() {
            self.admin_password = generate_password();
        }
        self.api_keys = self
            .api_keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        self.api_key_policies = sanitize_api_key_policies(std::mem::take(&mut self.api_key_policies));

        // ids must be unique within a provider; first registration wins
        let mut seen = HashSet::new();
        self.credentials.retain(|c| {
            let keep = !c.id.trim().is_empty()
                && seen.insert((c.provider.trim().to_lowercase(), c.id.trim().to_string()));
            if !keep {
                warn!("Dropping duplicate or unnamed credential: {}", c.id);
            }
            keep
        });
        for c in self.credentials.iter_mut() {
            c.provider = c.provider.trim().to_lowercase();
            c.id = c.id.trim().to_string();
        }

        if self.cooldown_base_secs == 0 {
            self.cooldown_base_secs = default_cooldown_base_secs();
        }
        if self.cooldown_max_secs < self.cooldown_base_secs {
            self.cooldown_max_secs = default_cooldown_max_secs().max(self.cooldown_base_secs);
        }
        if self.auto_model.trim().is_empty() {
            self.auto_model = default_auto_model();
        }

        self.wreq_proxy = self.proxy.to_owned().and_then(|p| {
            Proxy::all(p)
                .inspect_err(|e| {
                    error!("Failed to parse proxy: {}", e);
                })
                .ok()
        });
        self
    }
}

fn default_db_path(file: &str) -> PathBuf {
    CONFIG_PATH
        .parent()
        .map(|dir| dir.join(file))
        .unwrap_or_else(|| PathBuf::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_dedupes_credentials_per_provider() {
        let mut cfg = PolygateConfig {
            credentials: vec![
                AuthCredential::new("a", "claude"),
                AuthCredential::new("a", "Claude"),
                AuthCredential::new("a", "codex"),
                AuthCredential::new("", "codex"),
            ],
            admin_password: "x".into(),
            ..Default::default()
        };
        cfg = cfg.validate();
        assert_eq!(cfg.credentials.len(), 2);
        assert_eq!(cfg.credentials[0].provider, "claude");
        assert_eq!(cfg.credentials[1].provider, "codex");
    }

    #[test]
    fn client_auth_accepts_policy_keys() {
        let mut cfg = PolygateConfig {
            admin_password: "admin".into(),
            ..Default::default()
        };
        cfg.api_keys.insert("direct".into());
        cfg.api_key_policies = vec![ApiKeyPolicy {
            api_key: "via-policy".into(),
            ..Default::default()
        }];
        let cfg = cfg.validate();
        assert!(cfg.client_auth("direct"));
        assert!(cfg.client_auth("via-policy"));
        assert!(!cfg.client_auth("nope"));
        assert!(!cfg.client_auth(""));
    }
}
