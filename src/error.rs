//! Error types for the sync engine.
//!
//! Every failure that crosses a component boundary is a [`SyncError`]. The
//! queue and pull paths care about one question only — retry or give up —
//! so the classification helpers below collapse the variants into the
//! transient / permanent split used by the drain loop and the pull
//! backoff logic.

use thiserror::Error;

/// Unified error type for cache, queue, and remote operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Could not reach the remote at all (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The remote was reachable but the request timed out.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Remote answered with a non-success HTTP status.
    #[error("remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// API key rejected or terminal not authorized. Never retried.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The remote rejected the payload (validation class). Never retried.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// Local cache (SQLite) failure.
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// An in-flight pull was cancelled; nothing was applied.
    #[error("sync aborted")]
    Aborted,

    /// The live change-feed channel closed underneath the merge worker.
    #[error("change feed closed")]
    FeedClosed,

    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the drain / pull loops should retry this error later.
    ///
    /// Unknown failures are treated as transient by default — giving up on
    /// a queued mutation loses data, retrying a dead one merely wastes a
    /// request.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status == 429 || *status >= 500,
            SyncError::Unauthorized(_) | SyncError::Validation(_) => false,
            SyncError::Aborted => false,
            SyncError::Database(_) | SyncError::Serialization(_) => false,
            SyncError::FeedClosed => true,
            SyncError::Internal(_) => true,
        }
    }

    /// Authorization-class failure: surfaced immediately, never retried,
    /// and never masked by backoff (retrying cannot fix a revoked key).
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }

    /// Permanent failure: the queue entry is removed and the error is
    /// surfaced upward instead of being replayed forever.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Remote is shedding load; defer without counting it as a failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SyncError::Http { status: 429, .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}
