use crate::errors::{EngineError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration, persisted as pretty-printed JSON at
/// `{AGENTS_DIR}/../.brainsurgeon/config.json`. Missing fields fall back to
/// defaults so a hand-edited partial file keeps working.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trigger_rules: Vec<TriggerRule>,
    /// Global default: newest N entries are never extracted.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Global default: smallest candidate value worth extracting.
    #[serde(default = "default_min_value_length")]
    pub min_value_length: usize,
    #[serde(default = "default_auto_cron")]
    pub auto_cron: String,
    /// Payload retention age, e.g. "24h", "7d". Bare numbers are milliseconds.
    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default = "default_retention_cron")]
    pub retention_cron: String,
    /// When true the API layer keeps restore_remote tool-call entries verbatim
    /// instead of redacting them after a restore.
    #[serde(default)]
    pub keep_restore_remote_calls: bool,
    /// Seconds after a restore during which re-extraction is suppressed.
    #[serde(default = "default_keep_after_restore_seconds")]
    pub keep_after_restore_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retention_run_at: Option<String>,
}

fn default_keep_recent() -> usize {
    3
}
fn default_min_value_length() -> usize {
    500
}
fn default_auto_cron() -> String {
    "*/2 * * * *".to_string()
}
fn default_retention() -> String {
    "24h".to_string()
}
fn default_retention_cron() -> String {
    "0 */6 * * *".to_string()
}
fn default_keep_after_restore_seconds() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: false,
            trigger_rules: Vec::new(),
            keep_recent: default_keep_recent(),
            min_value_length: default_min_value_length(),
            auto_cron: default_auto_cron(),
            retention: default_retention(),
            retention_cron: default_retention_cron(),
            keep_restore_remote_calls: false,
            keep_after_restore_seconds: default_keep_after_restore_seconds(),
            last_run_at: None,
            last_retention_run_at: None,
        }
    }
}

/// One declarative extraction rule. `type` and the free-form matcher values
/// may be pipe-delimited alternatives or `*`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TriggerRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_recent: Option<usize>,
    /// Any other key is a matcher against the entry's top-level field of the
    /// same name.
    #[serde(flatten)]
    pub matchers: serde_json::Map<String, serde_json::Value>,
}

impl TriggerRule {
    pub fn new(rule_type: &str) -> Self {
        TriggerRule {
            rule_type: rule_type.to_string(),
            role: None,
            min_length: None,
            keep_chars: None,
            keep_recent: None,
            matchers: serde_json::Map::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Config> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Config> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| EngineError::Validation(format!("config parse: {e}")))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&paths::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Reject a config before it is persisted or scheduled.
    pub fn validate(&self) -> Result<()> {
        cron_expr_check(&self.auto_cron, "auto_cron")?;
        cron_expr_check(&self.retention_cron, "retention_cron")?;
        parse_duration_ms(&self.retention)?;
        for (i, rule) in self.trigger_rules.iter().enumerate() {
            if rule.rule_type.trim().is_empty()
                || rule.rule_type.split('|').any(|s| s.trim().is_empty())
            {
                return Err(EngineError::Validation(format!(
                    "trigger rule {i}: empty type"
                )));
            }
        }
        Ok(())
    }

    pub fn retention_ms(&self) -> Result<u64> {
        parse_duration_ms(&self.retention)
    }
}

fn cron_expr_check(expr: &str, field: &str) -> Result<()> {
    crate::scheduler::parse_cron(expr)
        .map_err(|e| EngineError::Validation(format!("{field} '{expr}': {e}")))?;
    Ok(())
}

/// Duration grammar: `<decimal><unit>`, unit one of ms/s/m/h/d/w.
/// A bare number is milliseconds. Empty or malformed input is an error.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("empty duration".to_string()));
    }

    let (number, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000.0)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86_400_000.0)
    } else if let Some(n) = s.strip_suffix('w') {
        (n, 604_800_000.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| EngineError::Validation(format!("bad duration '{s}'")))?;
    if value < 0.0 || !value.is_finite() {
        return Err(EngineError::Validation(format!("bad duration '{s}'")));
    }
    Ok((value * multiplier) as u64)
}
