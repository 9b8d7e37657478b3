use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::policy::{match_wildcard, normalise_model_key, strip_thinking_variant};

const DEFAULT_CLAUDE_FAILOVER_TARGET: &str = "gpt-5.2(high)";

/// Restrictions and quotas applied to one authenticated client API key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiKeyPolicy {
    pub api_key: String,

    /// Model IDs or wildcard patterns this key may NOT access.
    /// Matching is case-insensitive; `*` matches any substring.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded_models: Vec<String>,

    /// Automatic provider failover behaviour for this key.
    pub failover: ApiKeyFailoverPolicy,

    /// When false, claude-opus-4-6* requests are transparently downgraded
    /// to claude-opus-4-5-20251101*. Defaults to true when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_claude_opus_4_6: Option<bool>,

    /// Per-model daily request limits. Values <= 0 are dropped.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub daily_limits: HashMap<String, i64>,

    /// Maximum daily spend in USD. Values <= 0 disable the budget.
    pub daily_budget_usd: f64,
}

/// Failover configuration grouped per upstream provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiKeyFailoverPolicy {
    pub claude: ProviderFailoverPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProviderFailoverPolicy {
    pub enabled: bool,
    /// Model to retry with when failover triggers.
    pub target_model: String,
    /// Model-specific overrides, first match wins.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ModelFailoverRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModelFailoverRule {
    pub from_model: String,
    pub target_model: String,
}

impl ApiKeyPolicy {
    pub fn allows_claude_opus46(&self) -> bool {
        self.allow_claude_opus_4_6.unwrap_or(true)
    }

    /// Resolves the Claude failover target, or None when disabled.
    /// An enabled block with no target falls back to a safe default.
    pub fn claude_failover_target(&self) -> Option<String> {
        if !self.failover.claude.enabled {
            return None;
        }
        let target = self.failover.claude.target_model.trim();
        if target.is_empty() {
            Some(DEFAULT_CLAUDE_FAILOVER_TARGET.to_string())
        } else {
            Some(target.to_string())
        }
    }

    /// Resolves the Claude failover target for a specific requested model.
    /// Rules are evaluated first; fallthrough is the default target.
    pub fn claude_failover_target_for(&self, requested_model: &str) -> Option<String> {
        if !self.failover.claude.enabled {
            return None;
        }
        let request_key = normalise_model_key(requested_model);
        if !request_key.is_empty() {
            for rule in &self.failover.claude.rules {
                let from = rule.from_model.trim().to_lowercase();
                if from.is_empty() || !match_wildcard(&from, &request_key) {
                    continue;
                }
                let target = rule.target_model.trim();
                if target.is_empty() {
                    continue;
                }
                return Some(target.to_string());
            }
        }
        self.claude_failover_target()
    }

    /// True when any exclusion pattern matches the canonical model key.
    pub fn excludes(&self, model_key: &str) -> bool {
        self.excluded_models
            .iter()
            .any(|pattern| match_wildcard(pattern, model_key))
    }

    /// Resolves the daily limit for a canonical model key, trying the exact
    /// key first and then the non-thinking base, and returns the limit
    /// together with the key the counter should be charged against.
    pub fn daily_limit_for(&self, model_key: &str) -> Option<(i64, String)> {
        if self.daily_limits.is_empty() {
            return None;
        }
        let key = model_key.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        if let Some(&limit) = self.daily_limits.get(&key)
            && limit > 0
        {
            return Some((limit, key));
        }
        let base = strip_thinking_variant(&key);
        if base != key
            && let Some(&limit) = self.daily_limits.get(&base)
            && limit > 0
        {
            return Some((limit, base));
        }
        None
    }
}

/// Finds the policy for an authenticated key, if any.
pub fn find_api_key_policy<'a>(
    policies: &'a [ApiKeyPolicy],
    api_key: &str,
) -> Option<&'a ApiKeyPolicy> {
    let key = api_key.trim();
    if key.is_empty() {
        return None;
    }
    policies.iter().find(|p| p.api_key.trim() == key)
}

/// Trims keys, lowercases and dedupes exclusion patterns, drops invalid
/// limits and rules, clamps budgets, and collapses duplicate client keys
/// (the later entry wins).
pub fn sanitize_api_key_policies(policies: Vec<ApiKeyPolicy>) -> Vec<ApiKeyPolicy> {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(policies.len());
    let mut out: Vec<ApiKeyPolicy> = Vec::with_capacity(policies.len());

    for mut entry in policies {
        entry.api_key = entry.api_key.trim().to_string();
        if entry.api_key.is_empty() {
            continue;
        }

        let mut patterns: Vec<String> = Vec::with_capacity(entry.excluded_models.len());
        for pattern in &entry.excluded_models {
            let p = pattern.trim().to_lowercase();
            if !p.is_empty() && !patterns.contains(&p) {
                patterns.push(p);
            }
        }
        entry.excluded_models = patterns;

        entry.failover.claude.target_model =
            entry.failover.claude.target_model.trim().to_string();
        entry.failover.claude.rules.retain_mut(|rule| {
            rule.from_model = rule.from_model.trim().to_string();
            rule.target_model = rule.target_model.trim().to_string();
            !rule.from_model.is_empty() && !rule.target_model.is_empty()
        });

        if !entry.daily_limits.is_empty() {
            let mut normalized = HashMap::with_capacity(entry.daily_limits.len());
            for (model, limit) in entry.daily_limits.drain() {
                let m = model.trim().to_lowercase();
                if m.is_empty() || limit <= 0 {
                    continue;
                }
                normalized.insert(m, limit);
            }
            entry.daily_limits = normalized;
        }

        if entry.daily_budget_usd <= 0.0 {
            entry.daily_budget_usd = 0.0;
        }

        let key = entry.api_key.to_owned();
        if let Some(&prior) = seen.get(&key) {
            out[prior] = entry;
            continue;
        }
        seen.insert(key, out.len());
        out.push(entry);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_key(key: &str) -> ApiKeyPolicy {
        ApiKeyPolicy {
            api_key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sanitize_drops_blank_keys_and_bad_limits() {
        let mut a = policy_with_key("  k1  ");
        a.excluded_models = vec!["Claude-*".into(), "claude-*".into(), " ".into()];
        a.daily_limits = HashMap::from([
            ("Claude-Opus-4-6".to_string(), 3),
            ("gpt-5.2".to_string(), 0),
            ("".to_string(), 5),
        ]);
        a.daily_budget_usd = -2.0;
        let blank = policy_with_key("   ");

        let out = sanitize_api_key_policies(vec![a, blank]);
        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.api_key, "k1");
        assert_eq!(p.excluded_models, vec!["claude-*".to_string()]);
        assert_eq!(p.daily_limits.len(), 1);
        assert_eq!(p.daily_limits.get("claude-opus-4-6"), Some(&3));
        assert_eq!(p.daily_budget_usd, 0.0);
    }

    #[test]
    fn sanitize_last_duplicate_wins() {
        let mut first = policy_with_key("k");
        first.daily_budget_usd = 1.0;
        let mut second = policy_with_key("k");
        second.daily_budget_usd = 9.0;
        let out = sanitize_api_key_policies(vec![first, second]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].daily_budget_usd, 9.0);
    }

    #[test]
    fn sanitize_drops_incomplete_failover_rules() {
        let mut p = policy_with_key("k");
        p.failover.claude.enabled = true;
        p.failover.claude.rules = vec![
            ModelFailoverRule {
                from_model: "".into(),
                target_model: "gpt-5.2".into(),
            },
            ModelFailoverRule {
                from_model: "claude-opus-*".into(),
                target_model: "".into(),
            },
            ModelFailoverRule {
                from_model: " claude-haiku-* ".into(),
                target_model: " gpt-5.2-mini ".into(),
            },
        ];
        let out = sanitize_api_key_policies(vec![p]);
        assert_eq!(out[0].failover.claude.rules.len(), 1);
        assert_eq!(out[0].failover.claude.rules[0].from_model, "claude-haiku-*");
    }

    #[test]
    fn failover_target_resolution_order() {
        let mut p = policy_with_key("k");
        assert_eq!(p.claude_failover_target(), None);

        p.failover.claude.enabled = true;
        assert_eq!(
            p.claude_failover_target().as_deref(),
            Some("gpt-5.2(high)"),
            "enabled with empty target uses the default"
        );

        p.failover.claude.target_model = "gpt-5.2".into();
        p.failover.claude.rules = vec![ModelFailoverRule {
            from_model: "claude-haiku-*".into(),
            target_model: "gpt-5.2-mini".into(),
        }];
        assert_eq!(
            p.claude_failover_target_for("claude-haiku-4-5(1024)").as_deref(),
            Some("gpt-5.2-mini")
        );
        assert_eq!(
            p.claude_failover_target_for("claude-opus-4-6").as_deref(),
            Some("gpt-5.2")
        );
    }

    #[test]
    fn daily_limit_falls_back_to_thinking_base() {
        let mut p = policy_with_key("k");
        p.daily_limits = HashMap::from([("claude-opus-4-6".to_string(), 2)]);
        assert_eq!(
            p.daily_limit_for("claude-opus-4-6-thinking"),
            Some((2, "claude-opus-4-6".to_string())),
            "thinking variant shares the base quota"
        );
        p.daily_limits
            .insert("claude-opus-4-6-thinking".to_string(), 7);
        assert_eq!(
            p.daily_limit_for("claude-opus-4-6-thinking"),
            Some((7, "claude-opus-4-6-thinking".to_string())),
            "explicit thinking entry takes precedence"
        );
        assert_eq!(p.daily_limit_for("gpt-5.2"), None);
    }

    #[test]
    fn exclusion_uses_wildcards() {
        let mut p = policy_with_key("k");
        p.excluded_models = vec!["claude-haiku-*".into()];
        assert!(p.excludes("claude-haiku-4-5-20251001"));
        assert!(!p.excludes("claude-opus-4-6"));
    }
}
