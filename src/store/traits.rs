use anyhow::Result;
use std::time::Duration;

use crate::logic::CompactionOutcome;
use crate::model::{
    BranchHead, BranchLock, BranchState, CommitNode, IndexedCommit, LockAuditEntry,
};

/// Mode of the store's advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryMode {
    Exclusive,
    Shared,
}

/// A store transaction holding an advisory lock. Dropping it without calling
/// `commit` rolls back every staged write and releases the advisory lock.
#[async_trait::async_trait]
pub trait LockTransaction: Send {
    async fn get_branch_state(&mut self, branch_name: &str) -> Result<Option<BranchState>>;
    async fn put_branch_state(&mut self, state: &BranchState) -> Result<()>;
    async fn append_audit(&mut self, entry: &LockAuditEntry) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Persistence for branch lock state and the lock audit trail
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Open a transaction under the advisory lock `key`, waiting at most
    /// `timeout`. Returns `None` when the lock could not be obtained in time.
    async fn begin_locked(
        &self,
        key: &str,
        mode: AdvisoryMode,
        timeout: Duration,
    ) -> Result<Option<Box<dyn LockTransaction>>>;

    /// Read a branch state outside any transaction
    async fn get_branch_state(&self, branch_name: &str) -> Result<Option<BranchState>>;
    async fn list_branch_states(&self) -> Result<Vec<BranchState>>;
    /// Find a granted lock by id, across all branches
    async fn find_lock(&self, lock_id: &str) -> Result<Option<BranchLock>>;
    async fn audit_trail(&self, branch_name: &str) -> Result<Vec<LockAuditEntry>>;
}

/// Persistence for the commit DAG and branch heads
#[async_trait::async_trait]
pub trait CommitStore: Send + Sync {
    async fn list_commits(&self) -> Result<Vec<CommitNode>>;
    async fn insert_commit(&self, commit: CommitNode) -> Result<()>;
    /// Branch lookup by name: head commit and parent branch
    async fn get_branch_head(&self, branch_name: &str) -> Result<Option<BranchHead>>;
    async fn list_branch_heads(&self) -> Result<Vec<BranchHead>>;
    async fn upsert_branch_head(&self, head: BranchHead) -> Result<()>;
    /// Atomically replace compacted commits and record the compaction index
    async fn apply_compaction(&self, outcome: &CompactionOutcome) -> Result<()>;
    /// Time-travel lookup for a commit that may have been compacted away
    async fn resolve_commit(&self, commit_id: &str) -> Result<Option<IndexedCommit>>;
}

pub trait Store: LockStore + CommitStore + Send + Sync {}
impl<T: LockStore + CommitStore> Store for T {}
