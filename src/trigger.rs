use crate::config::{Config, TriggerRule};
use crate::entry::{Entry, Extractable};
use chrono::Utc;
use serde_json::Value;

/// Outcome of running the gate ladder for one entry. A skip is not an
/// error; the reason code is kept for counting and debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub should_extract: bool,
    pub trigger_type: Option<String>,
    /// Index into `config.trigger_rules` when a rule matched.
    pub matched_rule: Option<usize>,
    pub skip_reason: Option<String>,
}

impl Decision {
    fn skip(reason: impl Into<String>) -> Decision {
        Decision {
            should_extract: false,
            trigger_type: None,
            matched_rule: None,
            skip_reason: Some(reason.into()),
        }
    }

    fn matched_skip(rule: usize, reason: impl Into<String>) -> Decision {
        Decision {
            should_extract: false,
            trigger_type: None,
            matched_rule: Some(rule),
            skip_reason: Some(reason.into()),
        }
    }
}

/// Decide whether to extract `entry` sitting at `position_from_end`
/// (0 = newest). Gates run in order; the first satisfied gate wins.
pub fn decide(entry: &Entry, position_from_end: usize, config: &Config) -> Decision {
    if !config.enabled {
        return Decision::skip("smart_pruning_disabled");
    }

    if entry.id().is_none() {
        return Decision::skip("no_entry_id");
    }

    if entry.has_placeholder() {
        return Decision::skip("already_extracted");
    }

    match entry.extractable() {
        Extractable::Force => {
            return Decision {
                should_extract: true,
                trigger_type: Some(
                    detect_type(entry).unwrap_or_else(|| "assistant".to_string()),
                ),
                matched_rule: None,
                skip_reason: None,
            };
        }
        Extractable::Never => return Decision::skip("_extractable_false"),
        Extractable::MinPosition(min) => {
            if (position_from_end as u64) < min {
                return Decision::skip("_extractable_false");
            }
        }
        Extractable::Unset => {}
    }

    if let Some(restored_at) = entry.restored_at() {
        let elapsed = (Utc::now() - restored_at).num_seconds();
        let window = config.keep_after_restore_seconds as i64;
        if elapsed >= 0 && elapsed < window {
            return Decision::skip(format!(
                "recently_restored ({}s remaining)",
                window - elapsed
            ));
        }
    }

    let detected = detect_type(entry);

    for (i, rule) in config.trigger_rules.iter().enumerate() {
        if !rule_matches(rule, entry, detected.as_deref()) {
            continue;
        }

        let keep_recent = rule.keep_recent.unwrap_or(config.keep_recent);
        if position_from_end < keep_recent {
            return Decision::matched_skip(i, "too_recent");
        }

        let min_length = rule.min_length.unwrap_or(config.min_value_length);
        if !has_large_candidate(entry, min_length) {
            return Decision::matched_skip(i, "values_too_small");
        }

        return Decision {
            should_extract: true,
            trigger_type: Some(
                detected.unwrap_or_else(|| "assistant".to_string()),
            ),
            matched_rule: Some(i),
            skip_reason: None,
        };
    }

    Decision::skip("type_not_matched")
}

/// Detected type: `customType` → `type` → `message.role` → `role` →
/// content inference. Normalized lowercase with `ai`/`human` aliasing.
pub fn detect_type(entry: &Entry) -> Option<String> {
    if let Some(t) = entry.custom_type() {
        return Some(normalize_type(t));
    }
    if let Some(t) = entry.entry_type() {
        return Some(normalize_type(t));
    }
    if let Some(r) = entry.role() {
        return Some(normalize_type(r));
    }
    if entry.get("thinking").is_some() || nested_data_key(entry, "thinking") {
        return Some("thinking".to_string());
    }
    if entry.get("tool_result").is_some()
        || entry.get("result").is_some()
        || nested_data_key(entry, "result")
    {
        return Some("tool_result".to_string());
    }
    None
}

fn nested_data_key(entry: &Entry, key: &str) -> bool {
    entry
        .get("data")
        .and_then(|d| d.as_object())
        .map(|d| d.contains_key(key))
        .unwrap_or(false)
}

fn normalize_type(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    match lower.as_str() {
        "ai" => "assistant".to_string(),
        "human" => "user".to_string(),
        _ => lower,
    }
}

fn rule_matches(rule: &TriggerRule, entry: &Entry, detected: Option<&str>) -> bool {
    if !pattern_matches(&rule.rule_type, detected) {
        return false;
    }

    let role = effective_role(entry, detected);
    let role_pattern = rule.role.as_deref().unwrap_or("*");
    if !pattern_matches(role_pattern, role.as_deref()) {
        return false;
    }

    for (key, expected) in &rule.matchers {
        if !matcher_matches(expected, entry.get(key)) {
            return false;
        }
    }
    true
}

/// Entry role with type-specific defaults: a thinking customType acts as
/// `agent`; a tool_result has no role at all.
fn effective_role(entry: &Entry, detected: Option<&str>) -> Option<String> {
    if let Some(r) = entry.role() {
        return Some(normalize_type(r));
    }
    if entry
        .custom_type()
        .map(|c| c.eq_ignore_ascii_case("thinking"))
        .unwrap_or(false)
    {
        return Some("agent".to_string());
    }
    if detected == Some("tool_result") {
        return None;
    }
    None
}

/// `*` matches anything, including a missing value. Otherwise pipe-split
/// alternatives compared case-insensitively (with aliasing).
fn pattern_matches(pattern: &str, value: Option<&str>) -> bool {
    if pattern == "*" {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    let value = normalize_type(value);
    pattern
        .split('|')
        .map(|alt| normalize_type(alt.trim()))
        .any(|alt| alt == value)
}

/// Free-form rule matchers against top-level entry fields. Strings use
/// pipe-OR, numbers and everything else use equality. A missing field only
/// matches the `*` pattern.
fn matcher_matches(expected: &Value, actual: Option<&Value>) -> bool {
    match expected {
        Value::String(pattern) => {
            let actual_str = actual.and_then(|v| v.as_str());
            pattern_matches(pattern, actual_str)
        }
        other => actual == Some(other),
    }
}

/// Any candidate content field at or above `min_length`? String values
/// count their characters, everything else the length of its JSON encoding.
fn has_large_candidate(entry: &Entry, min_length: usize) -> bool {
    const CANDIDATES: &[&str] = &[
        "content", "text", "output", "result", "data", "thinking", "message",
    ];

    for key in CANDIDATES {
        if let Some(v) = entry.get(key) {
            if value_length(v) >= min_length {
                return true;
            }
        }
    }
    entry
        .get("message")
        .and_then(|m| m.get("content"))
        .map(|v| value_length(v) >= min_length)
        .unwrap_or(false)
}

pub fn value_length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    }
}
