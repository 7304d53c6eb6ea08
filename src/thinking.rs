use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ingress::{MessagesRequest, ThinkingMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
    Max,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Effort> {
        match name {
            "low" => Some(Effort::Low),
            "medium" => Some(Effort::Medium),
            "high" => Some(Effort::High),
            "max" => Some(Effort::Max),
            _ => None,
        }
    }
}

/// Resolved per-request reasoning setting. Immutable once resolved; it drives
/// both the upstream request flags and the downstream labeling behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThinkingConfig {
    pub enabled: bool,
    pub effort: Effort,
}

impl ThinkingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            effort: Effort::Low,
        }
    }
}

lazy_static! {
    static ref THINKING_TAG: Regex =
        Regex::new(r"(?i)<\s*thinking\s*:\s*(on|off)\s*>").expect("thinking tag pattern");
    static ref EFFORT_TAG: Regex =
        Regex::new(r"(?i)<\s*effort\s*:\s*(low|medium|high)\s*>").expect("effort tag pattern");
}

/// Trigger keywords in priority order; the first hit wins even if several
/// appear in the same message.
const KEYWORD_TIERS: &[(&str, Effort)] = &[
    ("ultrathink", Effort::Max),
    ("think harder", Effort::High),
    ("think hard", Effort::Medium),
    ("think", Effort::Low),
];

/// Derives the effective thinking setting for one request. Resolution order,
/// highest precedence first: explicit request parameter, inline control tags,
/// trigger keywords, configured default. Never fails; unrecognized content
/// falls through to the next tier.
pub fn resolve(request: &MessagesRequest, default: ThinkingConfig) -> ThinkingConfig {
    if let Some(param) = &request.thinking {
        return match param.mode {
            ThinkingMode::Disabled => ThinkingConfig::disabled(),
            ThinkingMode::Enabled => ThinkingConfig {
                enabled: true,
                effort: param
                    .budget_tokens
                    .map(effort_from_budget)
                    .unwrap_or(default.effort),
            },
        };
    }

    let text = match request.latest_user_text() {
        Some(text) => text,
        None => return default,
    };

    if let Some(resolved) = resolve_tags(&text, default) {
        return resolved;
    }

    let lowered = text.to_lowercase();
    for (keyword, effort) in KEYWORD_TIERS {
        if lowered.contains(keyword) {
            return ThinkingConfig {
                enabled: true,
                effort: *effort,
            };
        }
    }

    default
}

fn resolve_tags(text: &str, default: ThinkingConfig) -> Option<ThinkingConfig> {
    let switched_on = THINKING_TAG
        .captures(text)
        .map(|caps| caps[1].eq_ignore_ascii_case("on"));
    let effort = EFFORT_TAG
        .captures(text)
        .and_then(|caps| Effort::from_name(&caps[1].to_lowercase()));

    match (switched_on, effort) {
        (Some(false), _) => Some(ThinkingConfig::disabled()),
        (Some(true), tagged) => Some(ThinkingConfig {
            enabled: true,
            effort: tagged.unwrap_or(default.effort),
        }),
        // An effort tag alone is a request for thinking at that effort.
        (None, Some(tagged)) => Some(ThinkingConfig {
            enabled: true,
            effort: tagged,
        }),
        (None, None) => None,
    }
}

/// Maps an explicit token budget onto an effort tier.
pub fn effort_from_budget(budget: u32) -> Effort {
    if budget >= 32_768 {
        Effort::Max
    } else if budget >= 16_384 {
        Effort::High
    } else if budget >= 8_192 {
        Effort::Medium
    } else {
        Effort::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json).expect("request fixture")
    }

    fn default_off() -> ThinkingConfig {
        ThinkingConfig {
            enabled: false,
            effort: Effort::Medium,
        }
    }

    #[test]
    fn explicit_parameter_wins_over_tags() {
        let req = request(serde_json::json!({
            "model": "m",
            "thinking": {"type": "enabled"},
            "messages": [{"role": "user", "content": "<Thinking:Off> proceed"}]
        }));
        let resolved = resolve(&req, default_off());
        assert!(resolved.enabled);
    }

    #[test]
    fn explicit_disabled_wins_over_keywords() {
        let req = request(serde_json::json!({
            "model": "m",
            "thinking": {"type": "disabled"},
            "messages": [{"role": "user", "content": "ultrathink about it"}]
        }));
        assert!(!resolve(&req, default_off()).enabled);
    }

    #[test]
    fn budget_maps_to_effort_tier() {
        let req = request(serde_json::json!({
            "model": "m",
            "thinking": {"type": "enabled", "budget_tokens": 32768},
            "messages": [{"role": "user", "content": "go"}]
        }));
        let resolved = resolve(&req, default_off());
        assert!(resolved.enabled);
        assert_eq!(resolved.effort, Effort::Max);
    }

    #[test]
    fn off_tag_disables_despite_keywords() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "<Thinking:Off> ultrathink this"}]
        }));
        assert!(!resolve(&req, default_off()).enabled);
    }

    #[test]
    fn effort_tag_alone_enables_thinking() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "<Effort:High> solve it"}]
        }));
        let resolved = resolve(&req, default_off());
        assert!(resolved.enabled);
        assert_eq!(resolved.effort, Effort::High);
    }

    #[test]
    fn ultrathink_keyword_resolves_to_max() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "ultrathink this"}]
        }));
        let resolved = resolve(&req, default_off());
        assert!(resolved.enabled);
        assert_eq!(resolved.effort, Effort::Max);
    }

    #[test]
    fn keyword_priority_beats_position() {
        // "think hard" appears first in the text, but ultrathink outranks it.
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "think hard, no: ultrathink"}]
        }));
        assert_eq!(resolve(&req, default_off()).effort, Effort::Max);
    }

    #[test]
    fn plain_think_resolves_to_low() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "think about this"}]
        }));
        let resolved = resolve(&req, default_off());
        assert!(resolved.enabled);
        assert_eq!(resolved.effort, Effort::Low);
    }

    #[test]
    fn no_signals_fall_through_to_default() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hello there"}]
        }));
        assert_eq!(resolve(&req, default_off()), default_off());
    }

    #[test]
    fn unrecognized_tag_content_falls_through() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "<Thinking:Maybe> hm"}]
        }));
        assert_eq!(resolve(&req, default_off()), default_off());
    }

    #[test]
    fn keywords_scan_latest_user_message_only() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "ultrathink this"},
                {"role": "assistant", "content": "done"},
                {"role": "user", "content": "now summarize"}
            ]
        }));
        assert_eq!(resolve(&req, default_off()), default_off());
    }
}
