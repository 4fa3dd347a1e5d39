use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::model::{BranchLock, LockScope, LockType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchStatus {
    Active,         // Branch accepts writes
    LockedForWrite, // A branch-wide lock blocks writes
    Ready,          // Indexing completed, waiting for the auto-merge check
    Merged,         // Branch has been merged into its parent
}

impl BranchStatus {
    pub fn can_transition_to(self, next: BranchStatus) -> bool {
        use BranchStatus::*;
        match (self, next) {
            (Active, LockedForWrite) | (LockedForWrite, Active) => true,
            (Active, Ready) => true,
            (Ready, Merged) | (Ready, Active) => true,
            // A branch-wide write lock cancels a pending auto-merge
            (Ready, LockedForWrite) => true,
            (Merged, _) => false,
            (Active, Active)
            | (Active, Merged)
            | (LockedForWrite, LockedForWrite)
            | (LockedForWrite, Ready)
            | (LockedForWrite, Merged)
            | (Ready, Ready) => false,
        }
    }
}

/// Lock and lifecycle state of one branch, stored as a document keyed by branch name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchState {
    pub branch_name: String,
    pub current_state: BranchStatus,
    /// Ordered by grant time, then id
    pub active_locks: Vec<BranchLock>,
    pub state_changed_by: String,
    pub state_change_reason: Option<String>,
    pub auto_merge_enabled: bool,
    pub indexing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

impl BranchState {
    pub fn new(branch_name: impl Into<String>, created_by: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            branch_name: branch_name.into(),
            current_state: BranchStatus::Active,
            active_locks: Vec::new(),
            state_changed_by: created_by.into(),
            state_change_reason: Some("Branch state created".to_string()),
            auto_merge_enabled: false,
            indexing_completed_at: None,
            created_at: now,
            updated_at: now,
            state_changed_at: now,
        }
    }

    /// Move to `next`, validating the transition. Moving to the current state is a no-op.
    pub fn transition(
        &mut self,
        next: BranchStatus,
        changed_by: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        if self.current_state == next {
            return Ok(());
        }
        if !self.current_state.can_transition_to(next) {
            return Err(LockError::InvalidTransition {
                branch: self.branch_name.clone(),
                from: self.current_state,
                to: next,
            });
        }
        self.current_state = next;
        self.state_changed_by = changed_by.to_string();
        self.state_change_reason = Some(reason.into());
        self.state_changed_at = now;
        self.updated_at = now;
        Ok(())
    }

    pub fn add_lock(&mut self, lock: BranchLock, now: DateTime<Utc>) {
        let position = self
            .active_locks
            .iter()
            .position(|l| (l.created_at, &l.id) > (lock.created_at, &lock.id))
            .unwrap_or(self.active_locks.len());
        self.active_locks.insert(position, lock);
        self.updated_at = now;
    }

    pub fn find_lock(&self, lock_id: &str) -> Option<&BranchLock> {
        self.active_locks.iter().find(|l| l.id == lock_id)
    }

    pub fn find_lock_mut(&mut self, lock_id: &str) -> Option<&mut BranchLock> {
        self.active_locks.iter_mut().find(|l| l.id == lock_id)
    }

    pub fn remove_lock(&mut self, lock_id: &str, now: DateTime<Utc>) -> Option<BranchLock> {
        let index = self.active_locks.iter().position(|l| l.id == lock_id)?;
        self.updated_at = now;
        Some(self.active_locks.remove(index))
    }

    /// Remove and return every lock matching `predicate`
    pub fn take_locks_where<F>(&mut self, now: DateTime<Utc>, predicate: F) -> Vec<BranchLock>
    where
        F: Fn(&BranchLock) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active_locks)
            .into_iter()
            .partition(|l| predicate(l));
        self.active_locks = kept;
        if !taken.is_empty() {
            self.updated_at = now;
        }
        taken
    }

    /// Locks that are neither TTL- nor heartbeat-expired at `now`
    pub fn live_locks(&self, now: DateTime<Utc>, grace_multiplier: f64) -> impl Iterator<Item = &BranchLock> {
        self.active_locks
            .iter()
            .filter(move |l| !l.is_expired(now, grace_multiplier))
    }

    pub fn holds_branch_wide_lock(&self) -> bool {
        self.active_locks
            .iter()
            .any(|l| l.scope() == LockScope::Branch)
    }

    pub fn has_lock_of_type(&self, lock_type: LockType) -> bool {
        self.active_locks.iter().any(|l| l.lock_type == lock_type)
    }

    /// Reconcile `current_state` with the branch-wide locks currently held
    pub fn sync_write_state(&mut self, changed_by: &str, now: DateTime<Utc>) -> Result<(), LockError> {
        match (self.current_state, self.holds_branch_wide_lock()) {
            (BranchStatus::Active | BranchStatus::Ready, true) => self.transition(
                BranchStatus::LockedForWrite,
                changed_by,
                "Branch-wide lock acquired",
                now,
            ),
            (BranchStatus::LockedForWrite, false) => self.transition(
                BranchStatus::Active,
                changed_by,
                "Branch-wide locks released",
                now,
            ),
            (BranchStatus::Active, false)
            | (BranchStatus::Ready, false)
            | (BranchStatus::LockedForWrite, true)
            | (BranchStatus::Merged, _) => Ok(()),
        }
    }
}
