use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel marking a value whose content was moved into a payload file.
/// Detection is by substring so the truncated `"<prefix>... [[extracted-id]]"`
/// form matches too.
pub const PLACEHOLDER_PREFIX: &str = "[[extracted-";

/// Keys that carry structure or linkage rather than content. These are never
/// extracted and never overwritten by a restore. The `_*` prefix rule covers
/// every control flag (`_extractable`, `_restored`, `_redacted_from`,
/// `_pruned`, `_pruned_type`, …) plus `__id`, `__ts`, `__hash`, `__meta`.
const STRUCTURAL_KEYS: &[&str] = &[
    "id",
    "parentId",
    "toolCallId",
    "toolUseId",
    "tool_call_id",
    "timestamp",
    "type",
    "customType",
    "role",
    "version",
    "cwd",
    "modelId",
    "provider",
    "thinkingLevel",
    "firstKeptEntryId",
    "fromHook",
    "tokensBefore",
];

pub fn is_structural_key(key: &str) -> bool {
    key.starts_with('_') || STRUCTURAL_KEYS.contains(&key)
}

/// The `_extractable` override flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extractable {
    /// `_extractable: true` — extract regardless of rules and protection.
    Force,
    /// `_extractable: false` — never extract.
    Never,
    /// `_extractable: N` — only extract once position_from_end >= N.
    MinPosition(u64),
    Unset,
}

/// One transcript record: an opaque JSON object with a small recognized
/// field set. Unknown keys pass through untouched — the peer runtime owns
/// the schema, we only mutate content fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct Entry(pub Map<String, Value>);

impl Entry {
    pub fn new(map: Map<String, Value>) -> Self {
        Entry(map)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Entry(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Stable identity: `__id` preferred, `id` accepted.
    pub fn id(&self) -> Option<&str> {
        self.0
            .get("__id")
            .and_then(|v| v.as_str())
            .or_else(|| self.0.get("id").and_then(|v| v.as_str()))
    }

    pub fn entry_type(&self) -> Option<&str> {
        self.0.get("type").and_then(|v| v.as_str())
    }

    pub fn custom_type(&self) -> Option<&str> {
        self.0.get("customType").and_then(|v| v.as_str())
    }

    /// Role from the nested `message.role`, falling back to the flat `role`.
    pub fn role(&self) -> Option<&str> {
        self.0
            .get("message")
            .and_then(|m| m.get("role"))
            .and_then(|v| v.as_str())
            .or_else(|| self.0.get("role").and_then(|v| v.as_str()))
    }

    pub fn extractable(&self) -> Extractable {
        match self.0.get("_extractable") {
            Some(Value::Bool(true)) => Extractable::Force,
            Some(Value::Bool(false)) => Extractable::Never,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(v) => Extractable::MinPosition(v),
                None => Extractable::Unset,
            },
            _ => Extractable::Unset,
        }
    }

    pub fn restored_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("_restored")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn restored_at_raw(&self) -> Option<&str> {
        self.0.get("_restored").and_then(|v| v.as_str())
    }

    pub fn set_restored(&mut self, when: DateTime<Utc>) {
        self.0
            .insert("_restored".to_string(), Value::String(when.to_rfc3339()));
    }

    /// True if any value in the entry carries the extraction sentinel.
    pub fn has_placeholder(&self) -> bool {
        self.0.values().any(value_has_placeholder)
    }
}

fn value_has_placeholder(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(PLACEHOLDER_PREFIX),
        Value::Array(items) => items.iter().any(value_has_placeholder),
        Value::Object(map) => map.values().any(value_has_placeholder),
        _ => false,
    }
}

pub fn placeholder_for(entry_id: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}{entry_id}]]")
}
