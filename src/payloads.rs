use crate::errors::{EngineError, Result};
use crate::paths;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A payload file older than the retention window.
#[derive(Debug, Clone)]
pub struct ExpiredPayload {
    pub agent: String,
    pub session: String,
    pub entry: String,
    pub path: PathBuf,
    pub age_ms: u64,
    pub size_bytes: u64,
}

/// Stores extraction payloads as one pretty-printed JSON file per entry
/// under `{root}/{agent}/sessions/extracted/{session}/`. Payload files are
/// exclusively ours; atomicity comes from temp-file-plus-rename, not locks.
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new() -> Self {
        PayloadStore {
            root: paths::agents_dir(),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        PayloadStore { root }
    }

    fn session_dir(&self, agent: &str, session: &str) -> PathBuf {
        self.root
            .join(agent)
            .join("sessions")
            .join("extracted")
            .join(session)
    }

    pub fn payload_path(&self, agent: &str, session: &str, entry: &str) -> PathBuf {
        self.session_dir(agent, session).join(format!("{entry}.json"))
    }

    /// Atomic write: temp file in the target directory, then rename over.
    /// Directories are world-readable so a peer under another uid can read.
    pub fn store(
        &self,
        agent: &str,
        session: &str,
        entry: &str,
        payload: &Value,
    ) -> Result<(PathBuf, u64)> {
        let dir = self.session_dir(agent, session);
        std::fs::create_dir_all(&dir)?;
        set_mode(&dir, 0o755);

        let mut body = serde_json::to_string_pretty(payload)?;
        body.push('\n');

        let tmp = dir.join(format!(".tmp-{}.json", Uuid::new_v4()));
        let target = dir.join(format!("{entry}.json"));
        std::fs::write(&tmp, &body)?;
        set_mode(&tmp, 0o644);
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok((target, body.len() as u64))
    }

    /// `None` when no payload exists for the entry; parse failures and other
    /// I/O errors propagate.
    pub fn read(&self, agent: &str, session: &str, entry: &str) -> Result<Option<Value>> {
        let path = self.payload_path(agent, session, entry);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&content)
            .map_err(|e| EngineError::Internal(format!("payload {}: {e}", path.display())))?;
        Ok(Some(value))
    }

    /// Entry ids with a stored payload. Dot-prefixed temp files are ignored.
    pub fn list(&self, agent: &str, session: &str) -> Result<Vec<String>> {
        let dir = self.session_dir(agent, session);
        let mut out = Vec::new();
        let read = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for dent in read.filter_map(|e| e.ok()) {
            let name = dent.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(entry) = name.strip_suffix(".json") {
                out.push(entry.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn delete(&self, agent: &str, session: &str, entry: &str) -> Result<bool> {
        match std::fs::remove_file(self.payload_path(agent, session, entry)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_all(&self, agent: &str, session: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.list(agent, session)? {
            if self.delete(agent, session, &entry)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Walk every agent's extracted tree and collect payloads whose mtime
    /// age is at least `max_age_ms`. Unreadable files are logged and
    /// skipped; the scan always completes.
    pub fn find_expired(&self, max_age_ms: u64) -> Result<Vec<ExpiredPayload>> {
        let now = std::time::SystemTime::now();
        let mut out = Vec::new();

        for agent in dirs_in(&self.root) {
            let extracted = self.root.join(&agent).join("sessions").join("extracted");
            for session in dirs_in(&extracted) {
                let dir = extracted.join(&session);
                let Ok(read) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for dent in read.filter_map(|e| e.ok()) {
                    let name = dent.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        continue;
                    }
                    let Some(entry) = name.strip_suffix(".json") else {
                        continue;
                    };
                    let path = dent.path();
                    let meta = match std::fs::metadata(&path) {
                        Ok(m) => m,
                        Err(e) => {
                            eprintln!(
                                "[brainsurgeon] retention scan: cannot stat {}: {e}",
                                path.display()
                            );
                            continue;
                        }
                    };
                    let age_ms = meta
                        .modified()
                        .ok()
                        .and_then(|m| now.duration_since(m).ok())
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    if age_ms >= max_age_ms {
                        out.push(ExpiredPayload {
                            agent: agent.clone(),
                            session: session.clone(),
                            entry: entry.to_string(),
                            path,
                            age_ms,
                            size_bytes: meta.len(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for PayloadStore {
    fn default() -> Self {
        PayloadStore::new()
    }
}

fn dirs_in(path: &Path) -> Vec<String> {
    let Ok(read) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut out: Vec<String> = read
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    out.sort();
    out
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}
