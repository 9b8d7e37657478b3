use chrono::{DateTime, FixedOffset, Utc};

const CLAUDE_OPUS_46_PREFIX: &str = "claude-opus-4-6";
const CLAUDE_OPUS_45_FALLBACK_PREFIX: &str = "claude-opus-4-5-20251101";
const THINKING_SUFFIX: &str = "-thinking";

/// Result of splitting a model name into its base name and the optional
/// thinking budget suffix, e.g. `claude-opus-4-6-thinking(8192)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSuffix {
    pub model_name: String,
    pub has_suffix: bool,
    pub raw_suffix: String,
}

/// Splits a trailing `(...)` budget suffix off a model name.
/// Only a well-formed trailing group counts; anything else is left intact.
pub fn parse_thinking_suffix(raw: &str) -> ParsedSuffix {
    let trimmed = raw.trim();
    if let Some(open) = trimmed.rfind('(')
        && trimmed.ends_with(')')
        && open > 0
    {
        let inner = &trimmed[open + 1..trimmed.len() - 1];
        return ParsedSuffix {
            model_name: trimmed[..open].to_string(),
            has_suffix: true,
            raw_suffix: inner.to_string(),
        };
    }
    ParsedSuffix {
        model_name: trimmed.to_string(),
        has_suffix: false,
        raw_suffix: String::new(),
    }
}

/// Canonical model key: lowercased, trimmed, budget suffix stripped.
pub fn normalise_model_key(model: &str) -> String {
    let parsed = parse_thinking_suffix(model.trim());
    parsed.model_name.trim().to_lowercase()
}

/// Maps `-thinking` models to their non-thinking base so thinking and
/// non-thinking variants can share a configured quota.
pub fn strip_thinking_variant(model_key: &str) -> String {
    let trimmed = model_key.trim().to_lowercase();
    trimmed
        .strip_suffix(THINKING_SUFFIX)
        .map(str::to_string)
        .unwrap_or(trimmed)
}

/// True when the model (after stripping the budget suffix) is in the
/// claude-opus-4-6 family.
pub fn is_claude_opus46(model: &str) -> bool {
    normalise_model_key(model).starts_with(CLAUDE_OPUS_46_PREFIX)
}

/// Rewrites claude-opus-4-6* to claude-opus-4-5-20251101*, preserving any
/// trailing segments (e.g. `-thinking`) and the `(...)` budget suffix.
/// Returns the rewritten name and whether anything changed.
pub fn downgrade_claude_opus46(model: &str) -> (String, bool) {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return (model.to_string(), false);
    }
    let parsed = parse_thinking_suffix(trimmed);
    let base = parsed.model_name;
    if !base.trim().to_lowercase().starts_with(CLAUDE_OPUS_46_PREFIX) {
        return (model.to_string(), false);
    }
    let remainder = if base.len() >= CLAUDE_OPUS_46_PREFIX.len() {
        &base[CLAUDE_OPUS_46_PREFIX.len()..]
    } else {
        ""
    };
    let mut rewritten = format!("{CLAUDE_OPUS_45_FALLBACK_PREFIX}{remainder}");
    if parsed.has_suffix {
        rewritten = format!("{}({})", rewritten, parsed.raw_suffix);
    }
    (rewritten, true)
}

/// Case-insensitive wildcard match where `*` matches any substring,
/// including the empty one. Leading and trailing literal segments anchor;
/// internal segments are consumed left to right.
pub fn match_wildcard(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let value = value.trim().to_lowercase();
    if pattern.is_empty() || value.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value.as_str();
    if let Some(prefix) = parts.first()
        && !prefix.is_empty()
    {
        let Some(stripped) = rest.strip_prefix(prefix) else {
            return false;
        };
        rest = stripped;
    }
    if let Some(suffix) = parts.last()
        && !suffix.is_empty()
    {
        let Some(stripped) = rest.strip_suffix(suffix) else {
            return false;
        };
        rest = stripped;
    }
    for segment in &parts[1..parts.len().saturating_sub(1)] {
        if segment.is_empty() {
            continue;
        }
        let Some(idx) = rest.find(segment) else {
            return false;
        };
        rest = &rest[idx + segment.len()..];
    }
    true
}

/// Accounting day boundaries are fixed to UTC+8 so counters do not shift
/// with the host timezone.
pub fn day_key_china(at: DateTime<Utc>) -> String {
    let cst = FixedOffset::east_opt(8 * 3600).expect("fixed offset");
    at.with_timezone(&cst).format("%Y-%m-%d").to_string()
}

/// Current Asia/Shanghai day key.
pub fn today_china() -> String {
    day_key_china(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn downgrade_claude_opus46_table() {
        let cases = [
            ("claude-opus-4-6", "claude-opus-4-5-20251101", true),
            (
                "claude-opus-4-6-thinking",
                "claude-opus-4-5-20251101-thinking",
                true,
            ),
            ("claude-opus-4-6(8192)", "claude-opus-4-5-20251101(8192)", true),
            (
                "claude-opus-4-6-thinking(high)",
                "claude-opus-4-5-20251101-thinking(high)",
                true,
            ),
            ("claude-sonnet-4-5", "claude-sonnet-4-5", false),
        ];
        for (input, want, want_changed) in cases {
            let (got, changed) = downgrade_claude_opus46(input);
            assert_eq!(changed, want_changed, "changed for {input}");
            assert_eq!(got, want, "rewrite for {input}");
        }
    }

    #[test]
    fn normalise_strips_suffix_and_is_idempotent() {
        assert_eq!(normalise_model_key("claude-opus-4-6(8192)"), "claude-opus-4-6");
        assert_eq!(
            normalise_model_key(" Claude-Opus-4-6-Thinking(8192) "),
            "claude-opus-4-6-thinking"
        );
        for model in ["claude-opus-4-6(8192)", "GPT-5.2(high)", "gemini-2.5-pro"] {
            let once = normalise_model_key(model);
            assert_eq!(normalise_model_key(&once), once);
        }
    }

    #[test]
    fn strip_thinking_variant_shares_base() {
        assert_eq!(
            strip_thinking_variant("claude-opus-4-6-thinking"),
            "claude-opus-4-6"
        );
        assert_eq!(strip_thinking_variant("claude-opus-4-6"), "claude-opus-4-6");
    }

    #[test]
    fn wildcard_matrix() {
        let cases = [
            ("claude-*", "claude-opus-4-6", true),
            ("*-thinking", "claude-opus-4-5-thinking", true),
            ("claude-opus-4-6", "claude-opus-4-6", true),
            ("claude-opus-4-6", "claude-opus-4-5", false),
            ("claude-*-thinking", "claude-opus-4-6-thinking", true),
            ("claude-*-thinking", "claude-opus-4-6", false),
            ("*", "anything", true),
            ("", "anything", false),
            ("claude-*", "", false),
        ];
        for (pattern, value, want) in cases {
            assert_eq!(
                match_wildcard(pattern, value),
                want,
                "match_wildcard({pattern:?}, {value:?})"
            );
        }
    }

    #[test]
    fn parse_suffix_edges() {
        let parsed = parse_thinking_suffix("gpt-5.2(high)");
        assert_eq!(parsed.model_name, "gpt-5.2");
        assert!(parsed.has_suffix);
        assert_eq!(parsed.raw_suffix, "high");

        let parsed = parse_thinking_suffix("gemini-2.5-pro");
        assert!(!parsed.has_suffix);
        assert_eq!(parsed.model_name, "gemini-2.5-pro");

        // a lone "(...)" is not a suffix of anything
        let parsed = parse_thinking_suffix("(8192)");
        assert!(!parsed.has_suffix);
    }

    #[test]
    fn day_key_is_fixed_offset() {
        // 2026-02-07 23:30 UTC is already 2026-02-08 in UTC+8
        let at = Utc.with_ymd_and_hms(2026, 2, 7, 23, 30, 0).unwrap();
        assert_eq!(day_key_china(at), "2026-02-08");
        let at = Utc.with_ymd_and_hms(2026, 2, 7, 10, 0, 0).unwrap();
        assert_eq!(day_key_china(at), "2026-02-07");
    }
}
