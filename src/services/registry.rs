use std::collections::HashMap;

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::{
    config::POLYGATE_CONFIG,
    error::PolygateError,
    policy::{normalise_model_key, parse_thinking_suffix},
};

/// Read-mostly model -> providers table. Lookups take a snapshot; updates
/// swap the whole map so readers never see a partial registration.
pub struct ModelRegistry {
    entries: ArcSwap<HashMap<String, Vec<String>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn register_model(&self, model: &str, provider: &str) {
        let key = normalise_model_key(model);
        let provider = provider.trim().to_lowercase();
        if key.is_empty() || provider.is_empty() {
            return;
        }
        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            let providers = entries.entry(key.to_owned()).or_default();
            if !providers.contains(&provider) {
                providers.push(provider.to_owned());
            }
            entries
        });
    }

    pub fn unregister_provider(&self, provider: &str) {
        let provider = provider.trim().to_lowercase();
        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            entries.retain(|_, providers| {
                providers.retain(|p| p != &provider);
                !providers.is_empty()
            });
            entries
        });
    }

    fn registered(&self, model_key: &str) -> Vec<String> {
        self.entries
            .load()
            .get(model_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolves the synthetic `auto` model and selects candidate providers.
    /// The thinking budget suffix is carried through on the resolved name.
    /// Falls back to a prefix heuristic when the registry has not been
    /// warmed with the model yet; a total miss is a 502.
    pub fn resolve(&self, model_name: &str) -> Result<(Vec<String>, String), PolygateError> {
        let parsed = parse_thinking_suffix(model_name);
        let resolved_name = if parsed.model_name.eq_ignore_ascii_case("auto") {
            let base = POLYGATE_CONFIG.load().auto_model.to_owned();
            if parsed.has_suffix {
                format!("{}({})", base, parsed.raw_suffix)
            } else {
                base
            }
        } else {
            model_name.trim().to_string()
        };

        let base_key = normalise_model_key(&resolved_name);
        let mut providers = self.registered(&base_key);
        if providers.is_empty() {
            // a custom model may have been registered with its full
            // suffixed name
            let full_key = resolved_name.trim().to_lowercase();
            if full_key != base_key {
                providers = self.registered(&full_key);
            }
        }
        if providers.is_empty() {
            providers = heuristic_providers(&base_key);
        }
        if providers.is_empty() {
            return Err(PolygateError::UnknownProvider {
                model: model_name.to_string(),
            });
        }
        Ok((providers, resolved_name))
    }
}

/// Routing by prefix for models the registry does not know yet.
fn heuristic_providers(base_key: &str) -> Vec<String> {
    let lower = base_key.trim().to_lowercase();
    let provider = if lower.starts_with("claude-") {
        "claude"
    } else if lower.starts_with("gpt-")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
        || lower.starts_with("chatgpt-")
    {
        "codex"
    } else if lower.starts_with("gemini")
        || lower.starts_with("models/gemini")
        || lower.starts_with("vertex")
        || lower.starts_with("aistudio")
    {
        "gemini"
    } else if lower.starts_with("qwen") {
        "qwen"
    } else if lower.starts_with("kimi") {
        "kimi"
    } else if lower.starts_with("iflow") {
        "iflow"
    } else {
        return Vec::new();
    };
    vec![provider.to_string()]
}

/// True when a model name routes to the Claude provider.
pub fn seems_claude_model(model_name: &str) -> bool {
    let resolved = if parse_thinking_suffix(model_name)
        .model_name
        .eq_ignore_ascii_case("auto")
    {
        POLYGATE_CONFIG.load().auto_model.to_owned()
    } else {
        model_name.to_string()
    };
    normalise_model_key(&resolved).starts_with("claude-")
}

pub type SharedRegistry = Arc<ModelRegistry>;
