//! Error types for lock coordination, schema merging and DAG compaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BranchStatus, LockType};

/// The lock currently standing in the way of an acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub lock_id: String,
    pub locked_by: String,
    pub lock_type: LockType,
    pub scope_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Errors raised by the lock coordinator.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Scope overlap with an active lock, or the advisory lock could not be
    /// obtained before the timeout. Callers retry with backoff or narrow the scope.
    #[error("lock conflict on branch '{branch}' for {scope_key}: {detail}")]
    Conflict {
        branch: String,
        scope_key: String,
        holder: Option<LockHolder>,
        detail: String,
    },

    /// The request failed validation before touching the store.
    #[error("invalid lock request: {0}")]
    InvalidRequest(String),

    /// The branch state machine does not allow the requested move.
    #[error("branch '{branch}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        branch: String,
        from: BranchStatus,
        to: BranchStatus,
    },

    #[error("branch '{0}' has no recorded state")]
    UnknownBranch(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl LockError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LockError::Conflict { .. })
    }
}

/// Errors raised by the merge engine. Data conflicts are never errors; they
/// are reported through `MergeResult`.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("malformed {side} schema: {reason}")]
    MalformedSchema { side: &'static str, reason: String },
}

/// Errors raised while validating or compacting a commit graph.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    #[error("duplicate commit: {0}")]
    DuplicateCommit(String),

    #[error("dangling parent reference: commit {commit} references missing parent {parent}")]
    DanglingParent { commit: String, parent: String },

    #[error("cycle detected involving commit {0}")]
    Cycle(String),

    #[error("temporal ordering violation: commit {child} is older than its parent {parent}")]
    TemporalViolation { child: String, parent: String },

    /// A branch point, merge point or protected head was about to be rewritten.
    #[error("DAG integrity violation at {commit_id}: {reason}")]
    IntegrityViolation { commit_id: String, reason: String },
}

pub type LockResult<T> = Result<T, LockError>;
pub type DagResult<T> = Result<T, DagError>;
