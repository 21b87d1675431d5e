//! Shared error types for the core orchestrator.
//!
//! Library-level code returns these typed errors so callers can match on
//! variant; the CLI boundary converts them into `anyhow::Error` via `?`.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, validating, or writing a PRD document.
#[derive(Debug, Error)]
pub enum PrdError {
    #[error("PRD file not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to read PRD at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PRD at {path} is not valid JSON: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate story id {0:?} in PRD")]
    DuplicateStoryId(String),

    #[error("story {0:?} blockedBy/blocks graph contains a cycle")]
    CyclicDependency(String),

    #[error("story {story} is blocked by unknown story {blocker}")]
    UnknownBlocker { story: String, blocker: String },
}

/// Errors raised by the [`crate::registry::SessionRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a running session named {0:?} already exists")]
    Conflict(String),

    #[error("registry database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no session named {0:?} was found")]
    NotFound(String),
}

/// Errors raised by [`crate::rpc`] handlers, mapped to JSON-RPC error codes
/// by the dispatcher.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error")]
    Parse,

    #[error("invalid request")]
    InvalidRequest,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("backend error: {reason}")]
    Backend { backend: String, reason: String },
}

impl RpcError {
    /// JSON-RPC 2.0 error code for this variant.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse => -32700,
            RpcError::InvalidRequest => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::Internal(_) => -32603,
            RpcError::Backend { .. } => -32000,
        }
    }
}
