//! Common types and error definitions for disasync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias for disasync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Position of an event in the history of one branch.
///
/// Ticks are allocated by the relay and start at 1; a watermark of 0 means
/// "nothing received yet".
pub type Tick = u64;

/// Comprehensive error types for disasync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "server")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[cfg(feature = "server")]
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_cbor::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unknown repository {repo}")]
    UnknownRepository { repo: String },

    #[error("Unknown branch {repo}/{branch}")]
    UnknownBranch { repo: String, branch: String },

    #[error("{what} already exists")]
    Conflict { what: String },

    #[error("No snapshot stored for {repo}/{branch}")]
    SnapshotNotFound { repo: String, branch: String },

    #[error("Request rejected by the server ({}): {message}", .code.as_str())]
    Rejected { code: ErrorCode, message: String },

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Sequence gap: expected tick {expected}, received {received}")]
    SequenceGap { expected: Tick, received: Tick },

    #[error("Not subscribed to any branch")]
    NotSubscribed,

    #[error("Event payload uses the reserved key `{key}`")]
    ReservedKey { key: &'static str },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    /// The code under which this error is reported to a peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnknownRepository { .. } | Error::UnknownBranch { .. } => ErrorCode::NotFound,
            Error::SnapshotNotFound { .. } => ErrorCode::NotFound,
            Error::Conflict { .. } => ErrorCode::Conflict,
            Error::Protocol(_) | Error::ReservedKey { .. } => ErrorCode::InvalidRequest,
            Error::NotSubscribed => ErrorCode::NotSubscribed,
            Error::Rejected { code, .. } => *code,
            Error::Timeout { .. } => ErrorCode::Timeout,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether this error references a repository or branch that does not exist.
    pub fn is_referential(&self) -> bool {
        matches!(
            self,
            Error::UnknownRepository { .. } | Error::UnknownBranch { .. }
        ) || matches!(
            self,
            Error::Rejected {
                code: ErrorCode::NotFound,
                ..
            }
        )
    }
}

/// Malformed or unexpected traffic. Fatal to the connection it was read from.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown packet type: {0}")]
    UnknownType(String),

    #[error("Packet header is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("Packet header is not a map of named fields")]
    NotAMap,

    #[error("Malformed `{tag}` packet: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_cbor::Error,
    },

    #[error("Message too large: {size} bytes > {max} max")]
    TooLarge { size: usize, max: usize },

    #[error("Unexpected packet: {0}")]
    Unexpected(String),

    #[error("Tick counter exhausted after {0}")]
    TickOverflow(Tick),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown or internal server error
    InternalError = 1000,
    /// Invalid request format or parameters
    InvalidRequest = 1001,
    /// Requested repository, branch or snapshot not found
    NotFound = 1003,
    /// Request timeout
    Timeout = 1007,
    /// Repository or branch already exists
    Conflict = 1008,
    /// Command requires a subscription
    NotSubscribed = 1010,
}

impl ErrorCode {
    /// Convert error code to human-readable string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "internal_error",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotSubscribed => "not_subscribed",
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1000 => ErrorCode::InternalError,
            1001 => ErrorCode::InvalidRequest,
            1003 => ErrorCode::NotFound,
            1007 => ErrorCode::Timeout,
            1008 => ErrorCode::Conflict,
            1010 => ErrorCode::NotSubscribed,
            other => return Err(format!("unknown error code {}", other)),
        })
    }
}

/// Top-level namespace grouping the branches of one shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Unique repository name
    pub name: String,
    /// Hash of the input file the database was created from
    pub hash: String,
    /// Name of the input file
    pub file: String,
    /// Type of the input file
    #[serde(rename = "type")]
    pub kind: String,
    /// Creation date
    pub date: DateTime<Utc>,
}

/// A named line of document history within a [`Repository`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Name of the owning repository
    pub repo: String,
    /// Branch name, unique within the repository
    pub name: String,
    /// Creation date
    pub date: DateTime<Utc>,
    /// Tick at which a snapshot can be downloaded, if one was uploaded.
    ///
    /// Computed by the relay when listing branches, never persisted.
    #[serde(default)]
    pub tick: Option<Tick>,
}

/// Identifies one `(repository, branch)` event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey {
    pub repo: String,
    pub branch: String,
}

impl BranchKey {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.branch)
    }
}
