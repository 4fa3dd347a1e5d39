use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::logic::CompactionOutcome;
use crate::model::{
    BranchHead, BranchLock, BranchState, CommitNode, CompactionIndex, IndexedCommit,
    LockAuditEntry,
};
use crate::store::traits::{AdvisoryMode, CommitStore, LockStore, LockTransaction};

#[derive(Debug, Default)]
struct MemoryState {
    branch_states: HashMap<String, BranchState>,
    audit: Vec<LockAuditEntry>,
    commits: HashMap<String, CommitNode>,
    heads: BTreeMap<String, BranchHead>,
    index: CompactionIndex,
}

/// Process-local store. Clones share the same data, so one instance can be
/// handed to several coordinators to simulate multiple service instances.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    advisory: Arc<Mutex<AdvisoryTable>>,
}

type AdvisoryTable = HashMap<String, Arc<tokio::sync::RwLock<()>>>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn advisory_lock(&self, key: &str) -> Arc<tokio::sync::RwLock<()>> {
        let mut table = self.advisory.lock();
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone()
    }
}

enum AdvisoryGuard {
    Exclusive(OwnedRwLockWriteGuard<()>),
    Shared(OwnedRwLockReadGuard<()>),
}

/// A held advisory lock. The table entry is dropped with the last holder.
struct AdvisoryHold {
    key: String,
    table: Arc<Mutex<AdvisoryTable>>,
    guard: Option<AdvisoryGuard>,
}

impl Drop for AdvisoryHold {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune_advisory(&self.table, &self.key);
    }
}

fn prune_advisory(table: &Mutex<AdvisoryTable>, key: &str) {
    let mut table = table.lock();
    // Holders and waiters each keep a clone; the table's own is the last
    if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        table.remove(key);
    }
}

/// Writes are staged locally and only become visible on commit
struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    staged_states: HashMap<String, BranchState>,
    staged_audit: Vec<LockAuditEntry>,
    _hold: AdvisoryHold,
}

#[async_trait::async_trait]
impl LockTransaction for MemoryTransaction {
    async fn get_branch_state(&mut self, branch_name: &str) -> Result<Option<BranchState>> {
        if let Some(staged) = self.staged_states.get(branch_name) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.read().branch_states.get(branch_name).cloned())
    }

    async fn put_branch_state(&mut self, state: &BranchState) -> Result<()> {
        self.staged_states
            .insert(state.branch_name.clone(), state.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entry: &LockAuditEntry) -> Result<()> {
        self.staged_audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            state,
            staged_states,
            staged_audit,
            _hold,
        } = *self;

        let mut state = state.write();
        state.branch_states.extend(staged_states);
        state.audit.extend(staged_audit);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryStore {
    async fn begin_locked(
        &self,
        key: &str,
        mode: AdvisoryMode,
        timeout: Duration,
    ) -> Result<Option<Box<dyn LockTransaction>>> {
        let lock = self.advisory_lock(key);
        let guard = match mode {
            AdvisoryMode::Exclusive => tokio::time::timeout(timeout, lock.write_owned())
                .await
                .ok()
                .map(AdvisoryGuard::Exclusive),
            AdvisoryMode::Shared => tokio::time::timeout(timeout, lock.read_owned())
                .await
                .ok()
                .map(AdvisoryGuard::Shared),
        };
        let Some(guard) = guard else {
            prune_advisory(&self.advisory, key);
            return Ok(None);
        };

        Ok(Some(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged_states: HashMap::new(),
            staged_audit: Vec::new(),
            _hold: AdvisoryHold {
                key: key.to_string(),
                table: self.advisory.clone(),
                guard: Some(guard),
            },
        })))
    }

    async fn get_branch_state(&self, branch_name: &str) -> Result<Option<BranchState>> {
        Ok(self.state.read().branch_states.get(branch_name).cloned())
    }

    async fn list_branch_states(&self) -> Result<Vec<BranchState>> {
        let mut states: Vec<_> = self.state.read().branch_states.values().cloned().collect();
        states.sort_by(|a, b| a.branch_name.cmp(&b.branch_name));
        Ok(states)
    }

    async fn find_lock(&self, lock_id: &str) -> Result<Option<BranchLock>> {
        let state = self.state.read();
        Ok(state
            .branch_states
            .values()
            .find_map(|s| s.find_lock(lock_id).cloned()))
    }

    async fn audit_trail(&self, branch_name: &str) -> Result<Vec<LockAuditEntry>> {
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|e| e.branch_name == branch_name)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl CommitStore for MemoryStore {
    async fn list_commits(&self) -> Result<Vec<CommitNode>> {
        let mut commits: Vec<_> = self.state.read().commits.values().cloned().collect();
        commits.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.commit_id.cmp(&b.commit_id))
        });
        Ok(commits)
    }

    async fn insert_commit(&self, commit: CommitNode) -> Result<()> {
        let mut state = self.state.write();
        if state.commits.contains_key(&commit.commit_id) {
            bail!("Commit '{}' already exists", commit.commit_id);
        }
        if let Some(parent) = commit
            .parent_ids
            .iter()
            .find(|p| !state.commits.contains_key(p.as_str()))
        {
            bail!(
                "Commit '{}' names unknown parent '{}'",
                commit.commit_id,
                parent
            );
        }
        state.commits.insert(commit.commit_id.clone(), commit);
        Ok(())
    }

    async fn get_branch_head(&self, branch_name: &str) -> Result<Option<BranchHead>> {
        Ok(self.state.read().heads.get(branch_name).cloned())
    }

    async fn list_branch_heads(&self) -> Result<Vec<BranchHead>> {
        Ok(self.state.read().heads.values().cloned().collect())
    }

    async fn upsert_branch_head(&self, head: BranchHead) -> Result<()> {
        self.state
            .write()
            .heads
            .insert(head.branch_name.clone(), head);
        Ok(())
    }

    async fn apply_compaction(&self, outcome: &CompactionOutcome) -> Result<()> {
        if outcome.dry_run {
            bail!("Refusing to apply a dry-run compaction");
        }

        let mut state = self.state.write();
        for removed in &outcome.removed_commits {
            if !state.commits.contains_key(removed) {
                bail!("Compaction removes unknown commit '{}'", removed);
            }
        }
        let removed: HashSet<&str> = outcome.removed_commits.iter().map(String::as_str).collect();
        let replaced: HashSet<&str> = outcome.new_commits.iter().map(|c| c.commit_id.as_str()).collect();
        // Commits written after the outcome was computed must not lose their parent
        if let Some((child, parent)) = state
            .commits
            .values()
            .filter(|c| !removed.contains(c.commit_id.as_str()))
            .filter(|c| !replaced.contains(c.commit_id.as_str()))
            .find_map(|c| {
                c.parent_ids
                    .iter()
                    .find(|p| removed.contains(p.as_str()))
                    .map(|p| (c.commit_id.clone(), p.clone()))
            })
        {
            bail!(
                "Stale compaction: commit '{}' still references removed commit '{}'",
                child,
                parent
            );
        }

        for removed in &outcome.removed_commits {
            state.commits.remove(removed);
        }
        for commit in &outcome.new_commits {
            state.commits.insert(commit.commit_id.clone(), commit.clone());
        }
        state.index.extend(outcome.index.clone());
        Ok(())
    }

    async fn resolve_commit(&self, commit_id: &str) -> Result<Option<IndexedCommit>> {
        let state = self.state.read();
        if let Some(commit) = state.commits.get(commit_id) {
            return Ok(Some(IndexedCommit {
                original_commit_id: commit.commit_id.clone(),
                compacted_into: commit.commit_id.clone(),
                timestamp: commit.timestamp,
                schema_hash: commit.schema_hash.clone(),
            }));
        }
        Ok(state.index.resolve(commit_id))
    }
}
