use std::path::PathBuf;

/// Error kinds surfaced at the engine's outer edge.
///
/// Trigger skips and "already restored" style outcomes are NOT errors —
/// they travel as normal return values with a reason code. This enum is
/// reserved for genuine I/O and invariant failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("lock unavailable for {}", .0.display())]
    LockUnavailable(PathBuf),

    #[error("entry {0} was already restored at {1}")]
    AlreadyRestored(String, String),

    #[error("extraction failed for entry {0}: {1}")]
    ExtractionFailed(String, String),

    #[error("payload file missing for entry {0}")]
    StorageMissing(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("json: {e}"))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("sqlite: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
