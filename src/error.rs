//! Error types for the sync core.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure reported by a remote table backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend could not be reached (connect, timeout, DNS, ...).
    #[error("remote unreachable: {0}")]
    Transport(String),

    /// Missing or invalid credentials. Does not heal on retry.
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),

    /// The backend answered but refused the operation.
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Map an HTTP status and response body onto the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().to_string()
        };
        match status {
            401 | 403 => Self::Unauthorized(message),
            408 | 502 | 503 | 504 => Self::Transport(message),
            _ if is_permission_message(&message) => Self::Unauthorized(message),
            _ => Self::Rejected { status, message },
        }
    }

    /// Connectivity-class failures are handled as "offline".
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

fn is_permission_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("permission denied")
        || lower.contains("row-level security")
        || lower.contains("jwt expired")
        || lower.contains("invalid api key")
}

/// Errors surfaced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no id column mapping for table `{0}`")]
    UnknownTable(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True when the failure means "try again later with connectivity".
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transport())
    }

    /// True when the user must re-authenticate before writes can succeed.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_unauthorized())
    }

    /// True for SQLITE_BUSY / SQLITE_LOCKED.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Store(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
