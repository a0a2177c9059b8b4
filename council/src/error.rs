//! Error types shared across the deliberation engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from deliberation, model I/O, and persistence operations.
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("invalid configuration ({subject}): {reason}")]
    ConfigInvalid { subject: String, reason: String },

    #[error("model backend unreachable at {url}: {reason}")]
    BackendUnreachable { url: String, reason: String },

    #[error("model not loaded on backend: {0}")]
    ModelNotLoaded(String),

    #[error("model call timed out after {seconds}s: {model}")]
    Timeout { model: String, seconds: u64 },

    #[error("protocol error from {model}: {reason}")]
    ProtocolError { model: String, reason: String },

    #[error("ranking unparseable for {0}")]
    Unparseable(String),

    #[error("insufficient council: {succeeded} of {requested} models produced drafts")]
    InsufficientCouncil { succeeded: usize, requested: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("subscriber lagged and was dropped")]
    SubscriberLagged,

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store record corrupt: {0}")]
    Corrupt(String),
}

impl CouncilError {
    /// Serializable kind tag for trace records and error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Self::BackendUnreachable { .. } => ErrorKind::BackendUnreachable,
            Self::ModelNotLoaded(_) => ErrorKind::ModelNotLoaded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ProtocolError { .. } => ErrorKind::ProtocolError,
            Self::Unparseable(_) => ErrorKind::Unparseable,
            Self::InsufficientCouncil { .. } => ErrorKind::InsufficientCouncil,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SubscriberLagged => ErrorKind::SubscriberLagged,
            Self::Io(_) | Self::Corrupt(_) => ErrorKind::Store,
        }
    }

    /// Whether retrying the same call may succeed (used by the title worker).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable { .. } | Self::Timeout { .. } | Self::ProtocolError { .. }
        )
    }
}

/// Flat error tag stored in deliberation traces and emitted in error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    BackendUnreachable,
    ModelNotLoaded,
    Timeout,
    ProtocolError,
    Unparseable,
    InsufficientCouncil,
    Cancelled,
    NotFound,
    SubscriberLagged,
    Store,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigInvalid => write!(f, "config_invalid"),
            Self::BackendUnreachable => write!(f, "backend_unreachable"),
            Self::ModelNotLoaded => write!(f, "model_not_loaded"),
            Self::Timeout => write!(f, "timeout"),
            Self::ProtocolError => write!(f, "protocol_error"),
            Self::Unparseable => write!(f, "unparseable"),
            Self::InsufficientCouncil => write!(f, "insufficient_council"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::NotFound => write!(f, "not_found"),
            Self::SubscriberLagged => write!(f, "subscriber_lagged"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// Result alias used throughout the crate.
pub type CouncilResult<T> = Result<T, CouncilError>;
