use crate::entry::{is_structural_key, placeholder_for, Entry, PLACEHOLDER_PREFIX};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Keys tried first for each trigger type. `thinking` additionally falls
/// through to every other non-structural key; the rest extract only their
/// listed keys.
const THINKING_KEYS: &[&str] = &["thinking", "reasoning", "chain_of_thought"];
const TOOL_RESULT_KEYS: &[&str] = &["output", "result", "content", "data"];
const MESSAGE_KEYS: &[&str] = &["content", "message", "text", "response"];

/// Values inside `data` larger than this are pulled out even without a
/// trigger-specific key preference.
const NESTED_DATA_MIN: usize = 100;

const MAX_RESTORE_DEPTH: usize = 10;

#[derive(Debug)]
pub struct ExtractResult {
    pub success: bool,
    pub extracted_keys: Vec<String>,
    /// Byte length of the JSON-encoded payload.
    pub extracted_size: u64,
    pub sizes_bytes: HashMap<String, u64>,
    pub modified_entry: Entry,
    /// The payload to persist, `__meta` included.
    pub extracted_data: Value,
}

#[derive(Debug)]
pub struct RestoreApplied {
    pub entry: Entry,
    pub keys_restored: Vec<String>,
    pub sizes_bytes: HashMap<String, u64>,
    pub total_size: u64,
}

/// Forward transform: move candidate values out of `entry` into a payload,
/// leaving placeholders behind. Pure — no I/O, input untouched.
pub fn extract_entry(entry: &Entry, trigger_type: &str, keep_chars: usize) -> ExtractResult {
    let entry_id = entry.id().unwrap_or("unknown").to_string();
    let placeholder = placeholder_for(&entry_id);

    let mut modified = entry.clone();
    let mut payload = Map::new();
    let mut sizes_bytes = HashMap::new();
    let mut extracted_keys = Vec::new();

    for key in candidate_keys(entry, trigger_type) {
        let Some(original) = entry.get(&key) else {
            continue;
        };
        let encoded = match serde_json::to_string(original) {
            Ok(s) => s,
            Err(_) => return failed(entry),
        };

        payload.insert(key.clone(), original.clone());
        modified.as_map_mut().insert(
            key.clone(),
            Value::String(placeholder_value(original, keep_chars, &placeholder)),
        );
        sizes_bytes.insert(key.clone(), encoded.len() as u64);
        extracted_keys.push(key);
    }

    // One level into a surviving `data` object.
    if let Some(Value::Object(data)) = modified.as_map_mut().get_mut("data") {
        let mut nested_payload = Map::new();
        for (k, v) in data.iter_mut() {
            if !nested_candidate(trigger_type, k, v) {
                continue;
            }
            let Ok(encoded) = serde_json::to_string(v) else {
                return failed(entry);
            };
            nested_payload.insert(k.clone(), v.clone());
            sizes_bytes.insert(format!("data.{k}"), encoded.len() as u64);
            extracted_keys.push(format!("data.{k}"));
            *v = Value::String(placeholder.clone());
        }
        if !nested_payload.is_empty() {
            payload.insert("data".to_string(), Value::Object(nested_payload));
        }
    }

    payload.insert(
        "__meta".to_string(),
        json!({
            "extracted_at": Utc::now().to_rfc3339(),
            "trigger_type": trigger_type,
            "original_keys": extracted_keys.clone(),
        }),
    );

    let extracted_data = Value::Object(payload);
    let extracted_size = serde_json::to_string(&extracted_data)
        .map(|s| s.len() as u64)
        .unwrap_or(0);

    ExtractResult {
        success: true,
        extracted_keys,
        extracted_size,
        sizes_bytes,
        modified_entry: modified,
        extracted_data,
    }
}

fn failed(entry: &Entry) -> ExtractResult {
    ExtractResult {
        success: false,
        extracted_keys: Vec::new(),
        extracted_size: 0,
        sizes_bytes: HashMap::new(),
        modified_entry: entry.clone(),
        extracted_data: Value::Null,
    }
}

fn candidate_keys(entry: &Entry, trigger_type: &str) -> Vec<String> {
    let preferred: Option<&[&str]> = match trigger_type {
        "thinking" => Some(THINKING_KEYS),
        "tool_result" => Some(TOOL_RESULT_KEYS),
        "assistant" | "user" | "system" => Some(MESSAGE_KEYS),
        _ => None,
    };

    // `data` only moves wholesale when a preferred list names it
    // (tool results); everywhere else the nested walk below handles it.
    let mut keys: Vec<String> = Vec::new();
    match preferred {
        Some(list) => {
            for k in list {
                if entry.get(k).is_some() {
                    keys.push((*k).to_string());
                }
            }
            // thinking entries can carry content under arbitrary keys
            if trigger_type == "thinking" {
                for k in entry.as_map().keys() {
                    if !is_structural_key(k) && k != "data" && !keys.contains(k) {
                        keys.push(k.clone());
                    }
                }
            }
        }
        None => {
            for k in entry.as_map().keys() {
                if !is_structural_key(k) && k != "data" {
                    keys.push(k.clone());
                }
            }
        }
    }
    keys.retain(|k| !is_structural_key(k));
    keys
}

fn nested_candidate(trigger_type: &str, key: &str, value: &Value) -> bool {
    if value
        .as_str()
        .map(|s| s.contains(PLACEHOLDER_PREFIX))
        .unwrap_or(false)
    {
        return false;
    }
    match trigger_type {
        "thinking" => THINKING_KEYS.contains(&key),
        "tool_result" => TOOL_RESULT_KEYS.contains(&key),
        "assistant" | "user" | "system" => MESSAGE_KEYS.contains(&key),
        _ => crate::trigger::value_length(value) > NESTED_DATA_MIN,
    }
}

fn placeholder_value(original: &Value, keep_chars: usize, placeholder: &str) -> String {
    if keep_chars > 0 {
        if let Value::String(s) = original {
            let head: String = s.chars().take(keep_chars).collect();
            return format!("{head}... {placeholder}");
        }
    }
    placeholder.to_string()
}

/// Reverse transform: swap placeholders back for the original values from
/// `payload`. Keys missing from the payload keep their placeholder; the
/// walk recurses through objects and arrays to a bounded depth.
pub fn restore_entry(entry: &Entry, payload: &Value) -> RestoreApplied {
    let mut content = payload.clone();
    if let Value::Object(map) = &mut content {
        map.remove("__meta");
    }

    let mut restored = entry.clone();
    let mut keys_restored = Vec::new();
    let mut sizes_bytes = HashMap::new();

    if let Value::Object(content_map) = &content {
        for (key, value) in restored.as_map_mut().iter_mut() {
            if is_structural_key(key) {
                continue;
            }
            restore_value(
                key,
                value,
                content_map.get(key),
                0,
                &mut keys_restored,
                &mut sizes_bytes,
            );
        }
    }

    let total_size = sizes_bytes.values().sum();
    RestoreApplied {
        entry: restored,
        keys_restored,
        sizes_bytes,
        total_size,
    }
}

fn restore_value(
    path: &str,
    current: &mut Value,
    replacement: Option<&Value>,
    depth: usize,
    keys_restored: &mut Vec<String>,
    sizes_bytes: &mut HashMap<String, u64>,
) {
    if depth > MAX_RESTORE_DEPTH {
        return;
    }
    match current {
        Value::String(s) if s.contains(PLACEHOLDER_PREFIX) => {
            let Some(replacement) = replacement else {
                return; // payload lost this key; leave the placeholder
            };
            let size = serde_json::to_string(replacement)
                .map(|s| s.len() as u64)
                .unwrap_or(0);
            *current = replacement.clone();
            keys_restored.push(path.to_string());
            sizes_bytes.insert(path.to_string(), size);
        }
        Value::Object(map) => {
            let replacement_map = replacement.and_then(|v| v.as_object());
            for (k, v) in map.iter_mut() {
                restore_value(
                    &format!("{path}.{k}"),
                    v,
                    replacement_map.and_then(|m| m.get(k)),
                    depth + 1,
                    keys_restored,
                    sizes_bytes,
                );
            }
        }
        Value::Array(items) => {
            let replacement_items = replacement.and_then(|v| v.as_array());
            for (i, item) in items.iter_mut().enumerate() {
                restore_value(
                    &format!("{path}[{i}]"),
                    item,
                    replacement_items.and_then(|a| a.get(i)),
                    depth + 1,
                    keys_restored,
                    sizes_bytes,
                );
            }
        }
        _ => {}
    }
}
