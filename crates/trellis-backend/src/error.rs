//! Backend errors

use thiserror::Error;

/// Errors surfaced across the backend boundary
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend exists but has not finished starting
    #[error("backend not ready")]
    NotReady,

    /// No network map yet (not logged in, or control unreachable)
    #[error("no netmap")]
    NoNetMap,

    /// Preference value failed validation
    #[error("invalid preferences: {0}")]
    InvalidPrefs(String),

    /// Named waiting file does not exist
    #[error("no such file: {0}")]
    FileNotFound(String),

    /// No peer matches the given identifier
    #[error("unknown peer")]
    UnknownPeer,

    /// Operation has no implementation on this platform
    #[error("not supported on this platform")]
    Unsupported,

    /// Outbound dial through the mesh failed
    #[error("dial failed: {0}")]
    Dial(String),

    /// Signed round trip to the coordination service failed
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;
