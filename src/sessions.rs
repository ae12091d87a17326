use crate::entry::Entry;
use crate::errors::{EngineError, Result};
use crate::lock::Locks;
use crate::paths;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One line of `list` output.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub agent: String,
    pub session: String,
    pub label: Option<String>,
    pub size_bytes: u64,
    pub modified_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ChildRef {
    pub id: String,
    pub label: Option<String>,
}

#[derive(Clone)]
struct CachedSession {
    entries: Vec<Entry>,
    mtime_ms: i64,
    size: u64,
}

/// Reads and writes transcripts as ordered lists of opaque JSON records.
///
/// The JSONL file is shared with the peer runtime, so every disk access is
/// bracketed by the cooperative file lock. The mtime+size cache lets
/// repeated reads of an unchanged session skip both the lock and the parse.
pub struct SessionStore {
    root: PathBuf,
    locks: Locks,
    cache: Mutex<HashMap<PathBuf, CachedSession>>,
}

impl SessionStore {
    pub fn new(locks: Locks) -> Self {
        SessionStore {
            root: paths::agents_dir(),
            locks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// For tests and embedding: a store rooted somewhere other than
    /// `AGENTS_DIR`.
    pub fn with_root(root: PathBuf, locks: Locks) -> Self {
        SessionStore {
            root,
            locks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_path(&self, agent: &str, session: &str) -> PathBuf {
        self.sessions_dir(agent).join(format!("{session}.jsonl"))
    }

    fn sessions_dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent).join("sessions")
    }

    fn index_path(&self, agent: &str) -> PathBuf {
        self.sessions_dir(agent).join("sessions.json")
    }

    /// Load a session's entries, newest last.
    pub async fn load(&self, agent: &str, session: &str) -> Result<Vec<Entry>> {
        let path = self.session_path(agent, session);
        let (mtime_ms, size) = stat(&path)
            .ok_or_else(|| EngineError::NotFound(format!("session {agent}/{session}")))?;

        if let Some(cached) = self.cache_get(&path, mtime_ms, size) {
            return Ok(cached);
        }

        let guard = self.locks.acquire(&path).await?;
        let result = self.read_and_cache(&path);
        guard.release();
        result
    }

    /// Replace the session file with `entries`.
    pub async fn save(&self, agent: &str, session: &str, entries: &[Entry]) -> Result<()> {
        let path = self.session_path(agent, session);
        let guard = self.locks.acquire(&path).await?;
        let result = self.write_and_cache(&path, entries);
        guard.release();
        result
    }

    /// Read-modify-write under a single lock hold. `f` mutates the entries
    /// in place and returns whether anything changed; unchanged sessions are
    /// not rewritten.
    pub async fn update<F>(&self, agent: &str, session: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<Entry>) -> bool,
    {
        let path = self.session_path(agent, session);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("session {agent}/{session}")));
        }

        let guard = self.locks.acquire(&path).await?;
        let result = (|| {
            let mut entries = self.read_and_cache(&path)?;
            let changed = f(&mut entries);
            if changed {
                self.write_and_cache(&path, &entries)?;
            }
            Ok(changed)
        })();
        guard.release();
        result
    }

    /// Enumerate sessions for one agent, or for every agent under the root.
    /// Labels come from the peer-maintained `sessions.json` when present.
    pub fn list(&self, agent: Option<&str>) -> Result<Vec<SessionSummary>> {
        let agents: Vec<String> = match agent {
            Some(a) => vec![a.to_string()],
            None => list_dirs(&self.root)?,
        };

        let mut out = Vec::new();
        for agent in agents {
            let dir = self.sessions_dir(&agent);
            let labels = self.read_index(&agent);
            let Ok(read) = std::fs::read_dir(&dir) else {
                continue;
            };
            for dent in read.filter_map(|e| e.ok()) {
                let name = dent.file_name().to_string_lossy().to_string();
                let Some(session) = name.strip_suffix(".jsonl") else {
                    continue;
                };
                if session.is_empty() || name.starts_with('.') {
                    continue;
                }
                let (modified_ms, size_bytes) = stat(&dent.path()).unwrap_or((0, 0));
                out.push(SessionSummary {
                    label: labels.get(session).cloned(),
                    agent: agent.clone(),
                    session: session.to_string(),
                    size_bytes,
                    modified_ms,
                });
            }
        }
        out.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
        Ok(out)
    }

    /// Move a session file into the trash subdirectory.
    pub async fn delete(&self, agent: &str, session: &str) -> Result<()> {
        let path = self.session_path(agent, session);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("session {agent}/{session}")));
        }
        let trash = self.sessions_dir(agent).join(".trash");
        std::fs::create_dir_all(&trash)?;

        let guard = self.locks.acquire(&path).await?;
        let result = std::fs::rename(&path, trash.join(format!("{session}.jsonl")));
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&path);
        }
        guard.release();
        result.map_err(Into::into)
    }

    /// Children of a session according to the peer's index
    /// (`parentSessionId` linkage). Read-only; no lock needed.
    pub fn find_children(&self, agent: &str, session: &str) -> Vec<ChildRef> {
        index_records(&self.index_path(agent))
            .into_iter()
            .filter(|rec| {
                rec.get("parentSessionId").and_then(|v| v.as_str()) == Some(session)
            })
            .filter_map(|rec| {
                let id = rec.get("id").and_then(|v| v.as_str())?.to_string();
                let label = record_label(&rec);
                Some(ChildRef { id, label })
            })
            .collect()
    }

    fn read_index(&self, agent: &str) -> HashMap<String, String> {
        index_records(&self.index_path(agent))
            .into_iter()
            .filter_map(|rec| {
                let id = rec.get("id").and_then(|v| v.as_str())?.to_string();
                Some((id, record_label(&rec)?))
            })
            .collect()
    }

    fn cache_get(&self, path: &Path, mtime_ms: i64, size: u64) -> Option<Vec<Entry>> {
        let cache = self.cache.lock().ok()?;
        let cached = cache.get(path)?;
        if cached.mtime_ms == mtime_ms && cached.size == size {
            Some(cached.entries.clone())
        } else {
            None
        }
    }

    fn read_and_cache(&self, path: &Path) -> Result<Vec<Entry>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let entries = parse_jsonl(&content);
        if let Some((mtime_ms, size)) = stat(path) {
            if let Ok(mut cache) = self.cache.lock() {
                cache.insert(
                    path.to_path_buf(),
                    CachedSession {
                        entries: entries.clone(),
                        mtime_ms,
                        size,
                    },
                );
            }
        }
        Ok(entries)
    }

    fn write_and_cache(&self, path: &Path, entries: &[Entry]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serialize_jsonl(entries)?)?;
        match stat(path) {
            Some((mtime_ms, size)) => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(
                        path.to_path_buf(),
                        CachedSession {
                            entries: entries.to_vec(),
                            mtime_ms,
                            size,
                        },
                    );
                }
            }
            None => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.remove(path);
                }
            }
        }
        Ok(())
    }
}

/// Split by LF, drop empty lines, decode each remaining line. Lines that are
/// not valid JSON objects are silently skipped; one corrupt line must not
/// take the whole session down.
pub fn parse_jsonl(content: &str) -> Vec<Entry> {
    content
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(Entry::from_value)
        .collect()
}

/// One compact JSON object per line, LF-terminated, trailing LF included.
pub fn serialize_jsonl(entries: &[Entry]) -> Result<String> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

fn stat(path: &Path) -> Option<(i64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let ms = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Some((ms, meta.len()))
}

fn list_dirs(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let read = match std::fs::read_dir(root) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for dent in read.filter_map(|e| e.ok()) {
        if dent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let name = dent.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                out.push(name);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// The peer writes `sessions.json` either as a flat array of records or as
/// an object with a `sessions` array. Tolerate both.
fn index_records(path: &Path) -> Vec<serde_json::Map<String, Value>> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&content) else {
        return Vec::new();
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("sessions") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn record_label(rec: &serde_json::Map<String, Value>) -> Option<String> {
    rec.get("label")
        .or_else(|| rec.get("title"))
        .or_else(|| rec.get("name"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
