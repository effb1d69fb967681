use std::fmt;

use thiserror::Error;

use crate::core::journal::JournalError;
use crate::core::recovery::RecoveryState;

/// Which admission threshold an accept ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Count,
    Size,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Count => f.write_str("count"),
            LimitKind::Size => f.write_str("size"),
        }
    }
}

/// Caller-visible errors returned by every store operation.
///
/// The `Display` strings follow the `<condition>: <detail>` shape that protocol
/// front-ends forward verbatim to clients; `ResourceLimitExceeded` in particular is
/// parsed by producers to find the queue and threshold that rejected them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource-limit-exceeded: Policy exceeded on {queue}, policy: type=reject({kind}: max={max}, current={current};)")]
    ResourceLimitExceeded {
        queue: String,
        kind: LimitKind,
        max: u64,
        current: u64,
    },

    #[error("resource-limit-exceeded: journal full on {queue}: {detail}")]
    JournalFull { queue: String, detail: String },

    #[error("entity-conflict: {0}")]
    EntityConflict(String),

    #[error("not-found: {0}")]
    NotFound(String),

    #[error("invalid-argument: {0}")]
    InvalidArgument(String),

    /// Commit failed and was fully rolled back.
    #[error("internal-error: {0}")]
    Internal(String),

    /// The named entity can no longer be served safely.
    #[error("store-corruption: {entity}: {detail}")]
    StoreCorruption { entity: String, detail: String },

    #[error("store not ready (state: {0:?})")]
    NotReady(RecoveryState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corruption(entity: impl Into<String>, detail: impl fmt::Display) -> Self {
        StoreError::StoreCorruption {
            entity: entity.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn commit_failed(cause: impl fmt::Display) -> Self {
        StoreError::Internal(format!("Commit failed: {cause}"))
    }

    /// Map a journal error raised while serving `queue`.
    ///
    /// A full journal is a recoverable condition; anything else means the
    /// queue's durable state can no longer be trusted.
    pub(crate) fn from_journal(queue: &str, err: JournalError) -> Self {
        match err {
            JournalError::Full(detail) => StoreError::JournalFull {
                queue: queue.to_string(),
                detail,
            },
            other => StoreError::corruption(queue, other),
        }
    }

    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            StoreError::ResourceLimitExceeded { .. } | StoreError::JournalFull { .. }
        )
    }
}
