use crate::entry::Entry;
use crate::errors::Result;
use crate::payloads::PayloadStore;
use crate::sessions::SessionStore;
use crate::transform;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

/// Restore is full of "nothing to do" cases that are not failures; they all
/// travel through this enum instead of the error channel.
#[derive(Debug)]
pub enum RestoreOutcome {
    Restored {
        entry: Entry,
        keys_restored: Vec<String>,
        sizes_bytes: HashMap<String, u64>,
        total_size: u64,
        previous_restored_at: Option<String>,
    },
    EntryNotFound,
    /// Entry exists, has no placeholders, and was never restored.
    NoExtractedContent,
    /// Entry has no placeholders because a restore already ran. Callers
    /// wanting long-term retention should mark it `_extractable: false`.
    PreviouslyRestored { previous_restored_at: String },
    /// Placeholders exist but the payload file is gone (retention took it).
    PayloadMissing,
}

impl RestoreOutcome {
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            RestoreOutcome::Restored { .. } => None,
            RestoreOutcome::EntryNotFound => Some("entry_not_found"),
            RestoreOutcome::NoExtractedContent => Some("no_extracted_content"),
            RestoreOutcome::PreviouslyRestored { .. } => Some("previously_restored"),
            RestoreOutcome::PayloadMissing => Some("extracted_data_not_found"),
        }
    }
}

/// Swap placeholders in one entry back for their payload content, under the
/// session lock. `keys` narrows the restore to a subset of payload keys.
pub async fn restore(
    sessions: &SessionStore,
    payloads: &PayloadStore,
    agent: &str,
    session: &str,
    entry_id: &str,
    keys: Option<&[String]>,
) -> Result<RestoreOutcome> {
    let payload = payloads.read(agent, session, entry_id)?;
    let mut outcome = RestoreOutcome::EntryNotFound;

    sessions
        .update(agent, session, |entries| {
            let Some(target) = entries
                .iter_mut()
                .find(|e| e.id() == Some(entry_id))
            else {
                outcome = RestoreOutcome::EntryNotFound;
                return false;
            };

            if !target.has_placeholder() {
                outcome = match target.restored_at_raw() {
                    Some(at) => RestoreOutcome::PreviouslyRestored {
                        previous_restored_at: at.to_string(),
                    },
                    None => RestoreOutcome::NoExtractedContent,
                };
                return false;
            }

            let Some(payload) = &payload else {
                outcome = RestoreOutcome::PayloadMissing;
                return false;
            };

            let previous_restored_at = target.restored_at_raw().map(|s| s.to_string());
            let filtered = filter_payload(payload, keys);
            let applied = transform::restore_entry(target, &filtered);

            let mut entry = applied.entry;
            entry.set_restored(Utc::now());
            *target = entry.clone();

            outcome = RestoreOutcome::Restored {
                entry,
                keys_restored: applied.keys_restored,
                sizes_bytes: applied.sizes_bytes,
                total_size: applied.total_size,
                previous_restored_at,
            };
            true
        })
        .await?;

    Ok(outcome)
}

/// Narrow a payload to the requested keys. Dotted `data.<k>` keys keep the
/// matching slice of the nested `data` object.
fn filter_payload(payload: &Value, keys: Option<&[String]>) -> Value {
    let Some(keys) = keys else {
        return payload.clone();
    };
    if keys.is_empty() {
        return payload.clone();
    }
    let Value::Object(map) = payload else {
        return payload.clone();
    };

    let mut out = serde_json::Map::new();
    for key in keys {
        if let Some((parent, child)) = key.split_once('.') {
            if let Some(Value::Object(nested)) = map.get(parent) {
                if let Some(v) = nested.get(child) {
                    let slot = out
                        .entry(parent.to_string())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                    if let Some(m) = slot.as_object_mut() {
                        m.insert(child.to_string(), v.clone());
                    }
                }
            }
        } else if let Some(v) = map.get(key) {
            out.insert(key.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// Rewrite the tool-call entry that triggered a restore so the transcript
/// does not replay it: `restore_remote` becomes `remote_restore` with its
/// arguments nulled. Silently a no-op when the entry is absent or is some
/// other call.
pub async fn redact_restore_call(
    sessions: &SessionStore,
    agent: &str,
    session: &str,
    tool_call_id: &str,
) -> Result<bool> {
    let mut redacted = false;

    sessions
        .update(agent, session, |entries| {
            let Some(target) = entries
                .iter_mut()
                .find(|e| e.id() == Some(tool_call_id))
            else {
                return false;
            };
            if !is_restore_remote_call(target) {
                return false;
            }

            let map = target.as_map_mut();
            if map.contains_key("name") {
                map.insert("name".into(), Value::String("remote_restore".into()));
            }
            if map.contains_key("arguments") {
                map.insert("arguments".into(), Value::Null);
            }
            for nested in ["message", "tool"] {
                if let Some(Value::Object(obj)) = map.get_mut(nested) {
                    if obj.contains_key("name") {
                        obj.insert("name".into(), Value::String("remote_restore".into()));
                    }
                    if obj.contains_key("arguments") {
                        obj.insert("arguments".into(), Value::Null);
                    }
                }
            }
            map.insert(
                "_redacted_from".into(),
                Value::String("restore_remote".into()),
            );

            redacted = true;
            true
        })
        .await?;

    Ok(redacted)
}

fn is_restore_remote_call(entry: &Entry) -> bool {
    let is_tool_call = match entry.entry_type() {
        Some("tool_call") => true,
        Some("custom") => entry.custom_type() == Some("tool_call"),
        _ => false,
    };
    if !is_tool_call {
        return false;
    }

    let name = entry
        .get("name")
        .and_then(|v| v.as_str())
        .or_else(|| {
            entry
                .get("tool")
                .and_then(|t| t.get("name"))
                .and_then(|v| v.as_str())
        })
        .or_else(|| {
            entry
                .get("message")
                .and_then(|m| m.get("name"))
                .and_then(|v| v.as_str())
        });
    name == Some("restore_remote")
}
