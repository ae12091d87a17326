use std::path::PathBuf;

/// Returns the user's home directory as a `PathBuf`.
pub fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
}

/// Root under which every agent keeps its sessions.
/// `AGENTS_DIR` overrides; default is `~/agents`.
pub fn agents_dir() -> PathBuf {
    std::env::var("AGENTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join("agents"))
}

/// Engine-private data directory (bus database lives here).
/// `DATA_DIR` overrides; default is `~/.brainsurgeon`.
pub fn data_dir() -> PathBuf {
    std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".brainsurgeon"))
}

/// Engine config file: `{AGENTS_DIR}/../.brainsurgeon/config.json`.
/// Lives beside the agents tree so the peer runtime can find it too.
pub fn config_path() -> PathBuf {
    let agents = agents_dir();
    let parent = agents.parent().map(PathBuf::from).unwrap_or(agents);
    parent.join(".brainsurgeon").join("config.json")
}

pub fn bus_db_path() -> PathBuf {
    data_dir().join("bus.db")
}

pub fn sessions_dir(agent: &str) -> PathBuf {
    agents_dir().join(agent).join("sessions")
}

/// Transcript file, shared with the peer runtime.
pub fn session_path(agent: &str, session: &str) -> PathBuf {
    sessions_dir(agent).join(format!("{session}.jsonl"))
}

/// Peer-maintained index of sessions. Read-only for this engine.
pub fn sessions_index_path(agent: &str) -> PathBuf {
    sessions_dir(agent).join("sessions.json")
}

/// Directory holding extraction payloads for one session.
pub fn extracted_dir(agent: &str, session: &str) -> PathBuf {
    sessions_dir(agent).join("extracted").join(session)
}

pub fn payload_path(agent: &str, session: &str, entry: &str) -> PathBuf {
    extracted_dir(agent, session).join(format!("{entry}.json"))
}

pub fn trash_dir(agent: &str) -> PathBuf {
    sessions_dir(agent).join(".trash")
}

pub fn shorten_home(path: &str) -> String {
    let h = home_dir();
    let h_str = h.to_string_lossy();
    if !h_str.is_empty() && path.starts_with(h_str.as_ref()) {
        format!("~{}", &path[h_str.len()..])
    } else {
        path.to_string()
    }
}

/// Truthy check for boolean-ish environment variables.
pub fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "no"
        })
        .unwrap_or(false)
}
