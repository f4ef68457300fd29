use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("session is not online")]
    NotOnline,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("a scan is already running")]
    AlreadyScanning,

    #[error("invalid schedule expression '{expr}': {reason}")]
    Schedule { expr: String, reason: String },

    #[error("update check failed: {0}")]
    UpdateCheck(String),

    #[error("no updates available")]
    NoUpdateAvailable,

    #[error("update aborted during {phase}: {reason}")]
    UpdateAborted { phase: &'static str, reason: String },

    #[error("update failed ({error}); previous version restored")]
    UpdateRolledBack { error: String },

    // The one operator-visible emergency: the install may be inconsistent.
    #[error("update failed ({error}) and rollback also failed ({rollback_error})")]
    RollbackFailed {
        error: String,
        rollback_error: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
