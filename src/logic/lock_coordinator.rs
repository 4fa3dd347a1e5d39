//! Scoped, self-healing locks over branches and their resources.
//!
//! Every mutation of a [`BranchState`] is a read-modify-write inside a store
//! transaction that holds the branch's advisory lock, so concurrent
//! acquisitions on one branch are serialized across service instances: one
//! caller wins and the other sees [`LockError::Conflict`].
//!
//! Locks expire two ways. TTL is a hard deadline. Heartbeats are optional;
//! a holder that stays silent for more than `heartbeat_grace_multiplier`
//! intervals is presumed dead and its lock is released, provided the lock
//! was granted with auto release enabled. Expired locks are ignored by every
//! check immediately, and physically removed by the periodic sweeps.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::model::{
    checked_after, generate_id, AuditAction, BranchLock, BranchState, BranchStatus, Id, LockAuditEntry,
    LockHealth, LockRequest, LockTarget, LockType, WritePermission,
};
use crate::store::traits::{AdvisoryMode, LockStore, LockTransaction};

/// Name recorded on state changes made by the sweeps
const SWEEPER: &str = "lock-coordinator";

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub default_manual_ttl: Duration,
    pub default_indexing_ttl: Duration,
    pub default_maintenance_ttl: Duration,
    pub heartbeat_grace_multiplier: f64,
    pub acquire_timeout: Duration,
}

impl LockSettings {
    pub fn default_ttl(&self, lock_type: LockType) -> Duration {
        match lock_type {
            LockType::Manual => self.default_manual_ttl,
            LockType::Indexing => self.default_indexing_ttl,
            LockType::Maintenance => self.default_maintenance_ttl,
        }
    }
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            default_manual_ttl: Duration::from_secs(config.default_manual_ttl_secs),
            default_indexing_ttl: Duration::from_secs(config.default_indexing_ttl_secs),
            default_maintenance_ttl: Duration::from_secs(config.default_maintenance_ttl_secs),
            heartbeat_grace_multiplier: config.heartbeat_grace_multiplier,
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepKind {
    Ttl,
    Heartbeat,
}

impl SweepKind {
    fn matches(self, lock: &BranchLock, now: DateTime<Utc>, grace: f64) -> bool {
        match self {
            SweepKind::Ttl => lock.is_ttl_expired(now),
            SweepKind::Heartbeat => lock.is_heartbeat_expired(now, grace),
        }
    }

    fn label(self) -> &'static str {
        match self {
            SweepKind::Ttl => "TTL",
            SweepKind::Heartbeat => "heartbeat",
        }
    }
}

pub struct LockCoordinator<S: LockStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: LockSettings,
}

impl<S: LockStore> LockCoordinator<S> {
    pub fn new(store: Arc<S>, settings: LockSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, settings: LockSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    fn grace(&self) -> f64 {
        self.settings.heartbeat_grace_multiplier
    }

    /// Open a transaction holding the branch-level advisory lock
    async fn begin_branch(&self, branch_name: &str) -> LockResult<Box<dyn LockTransaction>> {
        self.begin_branch_within(branch_name, self.settings.acquire_timeout).await
    }

    async fn begin_branch_within(
        &self,
        branch_name: &str,
        timeout: Duration,
    ) -> LockResult<Box<dyn LockTransaction>> {
        let key = LockTarget::Branch.scope_key(branch_name);
        self.store
            .begin_locked(&key, AdvisoryMode::Exclusive, timeout)
            .await?
            .ok_or_else(|| LockError::Conflict {
                branch: branch_name.to_string(),
                scope_key: key,
                holder: None,
                detail: format!(
                    "timed out after {}ms waiting for the branch advisory lock",
                    timeout.as_millis()
                ),
            })
    }

    /// Remove locks matched by `kind` from `state`, returning their audit entries
    fn take_expired(
        &self,
        state: &mut BranchState,
        now: DateTime<Utc>,
        kind: SweepKind,
    ) -> Vec<LockAuditEntry> {
        let grace = self.grace();
        state
            .take_locks_where(now, |lock| kind.matches(lock, now, grace))
            .iter()
            .map(|lock| expiry_audit(lock, now))
            .collect()
    }

    /// Grant a lock, or fail with `LockError::Conflict` when an active lock
    /// with an overlapping scope exists on the branch.
    pub async fn acquire_lock(&self, request: LockRequest) -> LockResult<Id> {
        let branch = request.branch_name.clone();
        let scope_key = request.target.scope_key(&branch);
        let timeout = request
            .acquire_timeout
            .unwrap_or(self.settings.acquire_timeout);

        let mut tx = self.begin_branch_within(&branch, timeout).await?;
        let now = self.clock.now();
        let mut state = tx
            .get_branch_state(&branch)
            .await?
            .unwrap_or_else(|| BranchState::new(&branch, &request.locked_by, now));

        if state.current_state == BranchStatus::Merged {
            return Err(LockError::InvalidRequest(format!(
                "branch '{}' has been merged and no longer accepts locks",
                branch
            )));
        }

        if let Some(existing) = state
            .live_locks(now, self.grace())
            .find(|lock| lock.target.overlaps(&request.target))
        {
            let holder = existing.holder();
            debug!(
                "Lock request {} by {} conflicts with lock {}",
                scope_key, request.locked_by, holder.lock_id
            );
            return Err(LockError::Conflict {
                branch,
                detail: format!(
                    "{} is held by '{}' ({:?} lock {}) until {}",
                    holder.scope_key,
                    holder.locked_by,
                    holder.lock_type,
                    holder.lock_id,
                    holder.expires_at.to_rfc3339()
                ),
                scope_key,
                holder: Some(holder),
            });
        }

        // Dead locks still in the document go before the new grant
        let mut audit = self.take_expired(&mut state, now, SweepKind::Ttl);
        audit.extend(self.take_expired(&mut state, now, SweepKind::Heartbeat));

        let ttl = request
            .ttl
            .unwrap_or_else(|| self.settings.default_ttl(request.lock_type));
        let lock = BranchLock::grant(request, generate_id(), now, ttl)?;
        let lock_id = lock.id.clone();
        let locked_by = lock.locked_by.clone();

        audit.push(LockAuditEntry::for_lock(
            &lock,
            AuditAction::Acquired,
            now,
            json!({
                "scope_key": scope_key,
                "reason": lock.reason,
                "expires_at": lock.expires_at,
                "heartbeat_interval_ms": lock.heartbeat_interval_ms,
                "auto_release_enabled": lock.auto_release_enabled,
            }),
        ));
        let lock_type = lock.lock_type;
        let expires_at = lock.expires_at;

        state.add_lock(lock, now);
        state.sync_write_state(&locked_by, now)?;

        tx.put_branch_state(&state).await?;
        for entry in &audit {
            tx.append_audit(entry).await?;
        }
        tx.commit().await?;

        info!(
            "Acquired {:?} lock {} on {} for '{}' (expires {})",
            lock_type,
            lock_id,
            scope_key,
            locked_by,
            expires_at.to_rfc3339()
        );
        Ok(lock_id)
    }

    /// Release a lock. Returns false, without error, if it is already gone.
    pub async fn release_lock(&self, lock_id: &str, released_by: &str) -> LockResult<bool> {
        let Some(found) = self.store.find_lock(lock_id).await? else {
            debug!("Release of unknown lock {} by '{}' ignored", lock_id, released_by);
            return Ok(false);
        };
        let branch = found.branch_name;

        let mut tx = self.begin_branch(&branch).await?;
        let now = self.clock.now();
        let Some(mut state) = tx.get_branch_state(&branch).await? else {
            return Ok(false);
        };
        // Another caller may have released it while we waited
        let Some(lock) = state.remove_lock(lock_id, now) else {
            return Ok(false);
        };
        state.sync_write_state(released_by, now)?;

        let entry = LockAuditEntry::for_lock(
            &lock,
            AuditAction::Released,
            now,
            json!({
                "released_by": released_by,
                "held_for_seconds": crate::model::seconds_between(lock.created_at, now),
            }),
        );
        tx.put_branch_state(&state).await?;
        tx.append_audit(&entry).await?;
        tx.commit().await?;

        info!("Released lock {} on {} by '{}'", lock_id, lock.scope_key(), released_by);
        Ok(true)
    }

    /// Record a liveness signal from the lock holder. Unknown or already
    /// expired locks return false.
    pub async fn send_heartbeat(
        &self,
        lock_id: &str,
        service_name: &str,
        status: &str,
        progress_info: Option<serde_json::Value>,
    ) -> LockResult<bool> {
        let Some(found) = self.store.find_lock(lock_id).await? else {
            return Ok(false);
        };
        let branch = found.branch_name;

        let mut tx = self.begin_branch(&branch).await?;
        let now = self.clock.now();
        let grace = self.grace();
        let Some(mut state) = tx.get_branch_state(&branch).await? else {
            return Ok(false);
        };
        let Some(lock) = state.find_lock_mut(lock_id) else {
            return Ok(false);
        };
        if lock.is_expired(now, grace) {
            debug!("Heartbeat from '{}' for expired lock {} ignored", service_name, lock_id);
            return Ok(false);
        }

        lock.last_heartbeat = Some(now);
        lock.heartbeat_source = Some(service_name.to_string());
        lock.heartbeat_status = Some(status.to_string());
        if progress_info.is_some() {
            lock.progress_info = progress_info;
        }
        state.updated_at = now;

        tx.put_branch_state(&state).await?;
        tx.commit().await?;

        debug!("Heartbeat for lock {} from '{}': {}", lock_id, service_name, status);
        Ok(true)
    }

    /// Push `expires_at` forward by exactly `extension`
    pub async fn extend_lock_ttl(
        &self,
        lock_id: &str,
        extension: Duration,
        extended_by: &str,
        reason: &str,
    ) -> LockResult<bool> {
        if extension.is_zero() {
            return Err(LockError::InvalidRequest(
                "TTL extension must be positive".to_string(),
            ));
        }
        let Some(found) = self.store.find_lock(lock_id).await? else {
            return Ok(false);
        };
        let branch = found.branch_name;

        let mut tx = self.begin_branch(&branch).await?;
        let now = self.clock.now();
        let grace = self.grace();
        let Some(mut state) = tx.get_branch_state(&branch).await? else {
            return Ok(false);
        };
        let Some(lock) = state.find_lock_mut(lock_id) else {
            return Ok(false);
        };
        if lock.is_expired(now, grace) {
            return Ok(false);
        }

        let previous = lock.expires_at;
        lock.expires_at = checked_after(previous, extension).ok_or_else(|| {
            LockError::InvalidRequest(format!(
                "Extending lock {} by {}s puts its expiry out of range",
                lock_id,
                extension.as_secs()
            ))
        })?;
        let entry = LockAuditEntry::for_lock(
            lock,
            AuditAction::Extended,
            now,
            json!({
                "extended_by": extended_by,
                "reason": reason,
                "extension_seconds": extension.as_secs_f64(),
                "previous_expires_at": previous,
                "new_expires_at": lock.expires_at,
            }),
        );
        state.updated_at = now;

        tx.put_branch_state(&state).await?;
        tx.append_audit(&entry).await?;
        tx.commit().await?;

        info!(
            "Extended lock {} by {}s for '{}': {}",
            lock_id,
            extension.as_secs(),
            extended_by,
            reason
        );
        Ok(true)
    }

    /// Remove every lock whose TTL has passed. Returns how many were removed.
    pub async fn cleanup_expired_locks(&self) -> LockResult<usize> {
        self.sweep(SweepKind::Ttl).await
    }

    /// Remove auto-release locks whose holder stopped sending heartbeats
    pub async fn cleanup_heartbeat_expired_locks(&self) -> LockResult<usize> {
        self.sweep(SweepKind::Heartbeat).await
    }

    async fn sweep(&self, kind: SweepKind) -> LockResult<usize> {
        let now = self.clock.now();
        let grace = self.grace();
        let candidates: Vec<String> = self
            .store
            .list_branch_states()
            .await?
            .into_iter()
            .filter(|state| {
                state
                    .active_locks
                    .iter()
                    .any(|lock| kind.matches(lock, now, grace))
            })
            .map(|state| state.branch_name)
            .collect();

        let mut removed = 0;
        for branch in candidates {
            match self.sweep_branch(&branch, kind).await {
                Ok(count) => removed += count,
                // Picked up again on the next cycle
                Err(e) => warn!(
                    "{} sweep skipped branch '{}': {}",
                    kind.label(),
                    branch,
                    e
                ),
            }
        }
        Ok(removed)
    }

    async fn sweep_branch(&self, branch: &str, kind: SweepKind) -> LockResult<usize> {
        let mut tx = self.begin_branch(branch).await?;
        let now = self.clock.now();
        let Some(mut state) = tx.get_branch_state(branch).await? else {
            return Ok(0);
        };
        let expired = self.take_expired(&mut state, now, kind);
        if expired.is_empty() {
            return Ok(0);
        }
        state.sync_write_state(SWEEPER, now)?;

        tx.put_branch_state(&state).await?;
        for entry in &expired {
            tx.append_audit(entry).await?;
        }
        tx.commit().await?;

        for entry in &expired {
            info!(
                "Auto-released {:?} lock {} on branch '{}' held by '{}' ({:?})",
                entry.lock_type, entry.lock_id, entry.branch_name, entry.locked_by, entry.action
            );
        }
        Ok(expired.len())
    }

    pub async fn get_lock_health_status(&self, lock_id: &str) -> LockResult<Option<LockHealth>> {
        let now = self.clock.now();
        Ok(self
            .store
            .find_lock(lock_id)
            .await?
            .map(|lock| lock.health(now, self.grace())))
    }

    /// Whether `action` may write to the branch (or to one resource type of
    /// it). Expired locks never block, even before a sweep removes them.
    pub async fn check_write_permission(
        &self,
        branch_name: &str,
        action: &str,
        resource_type: Option<&str>,
    ) -> LockResult<WritePermission> {
        let now = self.clock.now();
        let Some(state) = self.store.get_branch_state(branch_name).await? else {
            return Ok(WritePermission::allowed(format!(
                "No locks held on branch '{}'",
                branch_name
            )));
        };

        if state.current_state == BranchStatus::Merged {
            return Ok(WritePermission::denied(format!(
                "Branch '{}' has been merged",
                branch_name
            )));
        }

        let target = match resource_type {
            Some(resource_type) => LockTarget::ResourceType {
                resource_type: resource_type.to_string(),
            },
            None => LockTarget::Branch,
        };

        let blocking = state
            .live_locks(now, self.grace())
            .find(|lock| lock.target.overlaps(&target));

        Ok(match blocking {
            Some(lock) => WritePermission::denied(format!(
                "{} on branch '{}' is blocked by {:?} lock {} held by '{}' until {} ({})",
                action,
                branch_name,
                lock.lock_type,
                lock.id,
                lock.locked_by,
                lock.expires_at.to_rfc3339(),
                lock.reason
            )),
            None => WritePermission::allowed(format!(
                "No active lock blocks {} on branch '{}'",
                action, branch_name
            )),
        })
    }

    /// Indexing finished: drop the branch's indexing locks and, when
    /// auto-merge is enabled, mark the branch READY for the merge check.
    pub async fn complete_indexing(&self, branch_name: &str, completed_by: &str) -> LockResult<BranchStatus> {
        let mut tx = self.begin_branch(branch_name).await?;
        let now = self.clock.now();
        let mut state = tx
            .get_branch_state(branch_name)
            .await?
            .ok_or_else(|| LockError::UnknownBranch(branch_name.to_string()))?;

        let released = state.take_locks_where(now, |lock| lock.lock_type == LockType::Indexing);
        state.indexing_completed_at = Some(now);
        state.updated_at = now;
        state.sync_write_state(completed_by, now)?;

        if state.auto_merge_enabled && state.current_state == BranchStatus::Active {
            state.transition(
                BranchStatus::Ready,
                completed_by,
                "Indexing completed; awaiting auto-merge check",
                now,
            )?;
        }

        tx.put_branch_state(&state).await?;
        for lock in &released {
            let entry = LockAuditEntry::for_lock(
                lock,
                AuditAction::Released,
                now,
                json!({ "released_by": completed_by, "reason": "indexing completed" }),
            );
            tx.append_audit(&entry).await?;
        }
        tx.commit().await?;

        info!(
            "Indexing completed on branch '{}' by '{}' ({} indexing locks released, now {:?})",
            branch_name,
            completed_by,
            released.len(),
            state.current_state
        );
        Ok(state.current_state)
    }

    pub async fn set_auto_merge(&self, branch_name: &str, enabled: bool, changed_by: &str) -> LockResult<()> {
        let mut tx = self.begin_branch(branch_name).await?;
        let now = self.clock.now();
        let mut state = tx
            .get_branch_state(branch_name)
            .await?
            .unwrap_or_else(|| BranchState::new(branch_name, changed_by, now));

        state.auto_merge_enabled = enabled;
        state.updated_at = now;

        tx.put_branch_state(&state).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Finish the auto-merge check of a READY branch: MERGED on success,
    /// back to ACTIVE otherwise.
    pub async fn record_auto_merge_outcome(
        &self,
        branch_name: &str,
        merged: bool,
        decided_by: &str,
        reason: &str,
    ) -> LockResult<BranchStatus> {
        let next = if merged {
            BranchStatus::Merged
        } else {
            BranchStatus::Active
        };

        let mut tx = self.begin_branch(branch_name).await?;
        let now = self.clock.now();
        let mut state = tx
            .get_branch_state(branch_name)
            .await?
            .ok_or_else(|| LockError::UnknownBranch(branch_name.to_string()))?;

        if state.current_state != BranchStatus::Ready {
            return Err(LockError::InvalidTransition {
                branch: branch_name.to_string(),
                from: state.current_state,
                to: next,
            });
        }
        state.transition(next, decided_by, reason, now)?;

        tx.put_branch_state(&state).await?;
        tx.commit().await?;

        info!("Auto-merge check on branch '{}': {:?} ({})", branch_name, next, reason);
        Ok(next)
    }

    pub async fn get_branch_state(&self, branch_name: &str) -> LockResult<Option<BranchState>> {
        Ok(self.store.get_branch_state(branch_name).await?)
    }

    /// Locks on the branch that are neither TTL- nor heartbeat-expired
    pub async fn list_active_locks(&self, branch_name: &str) -> LockResult<Vec<BranchLock>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_branch_state(branch_name)
            .await?
            .map(|state| state.live_locks(now, self.grace()).cloned().collect())
            .unwrap_or_default())
    }

    pub async fn audit_trail(&self, branch_name: &str) -> LockResult<Vec<LockAuditEntry>> {
        Ok(self.store.audit_trail(branch_name).await?)
    }
}

fn expiry_audit(lock: &BranchLock, now: DateTime<Utc>) -> LockAuditEntry {
    let action = if lock.is_ttl_expired(now) {
        AuditAction::Expired
    } else {
        AuditAction::HeartbeatExpired
    };
    LockAuditEntry::for_lock(
        lock,
        action,
        now,
        json!({
            "expires_at": lock.expires_at,
            "last_heartbeat": lock.last_heartbeat,
            "heartbeat_source": lock.heartbeat_source,
            "seconds_since_heartbeat": lock.seconds_since_heartbeat(now),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::LockScope;
    use crate::store::MemoryStore;

    fn coordinator() -> (LockCoordinator<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let settings = LockSettings {
            acquire_timeout: Duration::from_millis(200),
            ..LockSettings::default()
        };
        let coordinator =
            LockCoordinator::with_clock(Arc::new(MemoryStore::new()), settings, clock.clone());
        (coordinator, clock)
    }

    fn branch_lock(branch: &str, by: &str) -> LockRequest {
        LockRequest::builder(branch, LockType::Manual, by)
            .reason("schema edit")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_ttl_depends_on_lock_type() {
        let (coordinator, clock) = coordinator();
        let indexing = LockRequest::builder("main", LockType::Indexing, "indexer")
            .scope(LockScope::ResourceType)
            .resource_type("object_type")
            .build()
            .unwrap();
        let id = coordinator.acquire_lock(indexing).await.unwrap();

        let lock = coordinator.store().find_lock(&id).await.unwrap().unwrap();
        assert_eq!(
            lock.expires_at - clock.now(),
            chrono::Duration::from_std(coordinator.settings().default_indexing_ttl).unwrap()
        );
    }

    #[tokio::test]
    async fn test_conflict_reports_holder_and_expiry() {
        let (coordinator, _clock) = coordinator();
        let first = coordinator.acquire_lock(branch_lock("main", "alice")).await.unwrap();

        let err = coordinator
            .acquire_lock(branch_lock("main", "bob"))
            .await
            .unwrap_err();
        match err {
            LockError::Conflict { holder: Some(holder), detail, .. } => {
                assert_eq!(holder.lock_id, first);
                assert_eq!(holder.locked_by, "alice");
                assert!(detail.contains("alice"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_branch_lock_moves_state_to_locked_for_write_and_back() {
        let (coordinator, _clock) = coordinator();
        let id = coordinator.acquire_lock(branch_lock("main", "alice")).await.unwrap();
        let state = coordinator.get_branch_state("main").await.unwrap().unwrap();
        assert_eq!(state.current_state, BranchStatus::LockedForWrite);

        assert!(coordinator.release_lock(&id, "alice").await.unwrap());
        let state = coordinator.get_branch_state("main").await.unwrap().unwrap();
        assert_eq!(state.current_state, BranchStatus::Active);
        assert_eq!(state.state_changed_by, "alice");
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_liveness() {
        let (coordinator, clock) = coordinator();
        let request = LockRequest::builder("main", LockType::Indexing, "indexer")
            .heartbeat_interval(Duration::from_secs(10))
            .build()
            .unwrap();
        let id = coordinator.acquire_lock(request).await.unwrap();

        clock.advance(Duration::from_secs(25));
        assert!(coordinator
            .send_heartbeat(&id, "indexer-1", "running", Some(json!({"done": 40})))
            .await
            .unwrap());

        clock.advance(Duration::from_secs(25));
        let health = coordinator.get_lock_health_status(&id).await.unwrap().unwrap();
        assert!(!health.heartbeat_expired);
        assert_eq!(health.seconds_since_heartbeat, Some(25.0));

        let lock = coordinator.store().find_lock(&id).await.unwrap().unwrap();
        assert_eq!(lock.heartbeat_source.as_deref(), Some("indexer-1"));
        assert_eq!(lock.progress_info, Some(json!({"done": 40})));
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_or_dead_lock_returns_false() {
        let (coordinator, clock) = coordinator();
        assert!(!coordinator
            .send_heartbeat("missing", "svc", "running", None)
            .await
            .unwrap());

        let request = LockRequest::builder("main", LockType::Indexing, "indexer")
            .heartbeat_interval(Duration::from_secs(10))
            .build()
            .unwrap();
        let id = coordinator.acquire_lock(request).await.unwrap();
        clock.advance(Duration::from_secs(31));
        assert!(!coordinator.send_heartbeat(&id, "svc", "running", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_respects_auto_release_flag() {
        let (coordinator, clock) = coordinator();
        let pinned = LockRequest::builder("main", LockType::Maintenance, "ops")
            .heartbeat_interval(Duration::from_secs(10))
            .auto_release(false)
            .build()
            .unwrap();
        let id = coordinator.acquire_lock(pinned).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(coordinator.cleanup_heartbeat_expired_locks().await.unwrap(), 0);
        assert!(coordinator.store().find_lock(&id).await.unwrap().is_some());

        let health = coordinator.get_lock_health_status(&id).await.unwrap().unwrap();
        assert!(!health.heartbeat_expired);
        assert_eq!(health.health, crate::model::HealthLevel::Critical);
    }

    #[tokio::test]
    async fn test_extend_rejects_zero_and_ignores_unknown() {
        let (coordinator, _clock) = coordinator();
        let err = coordinator
            .extend_lock_ttl("x", Duration::ZERO, "alice", "more time")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));
        assert!(!coordinator
            .extend_lock_ttl("x", Duration::from_secs(5), "alice", "more time")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_rejected_without_side_effects() {
        let (coordinator, _clock) = coordinator();
        let far = Duration::from_secs(300_000 * 365 * 24 * 3600);

        let request = LockRequest::builder("main", LockType::Manual, "alice")
            .ttl(far)
            .build()
            .unwrap();
        let err = coordinator.acquire_lock(request).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));
        assert!(coordinator.list_active_locks("main").await.unwrap().is_empty());

        let id = coordinator.acquire_lock(branch_lock("main", "alice")).await.unwrap();
        let before = coordinator.store().find_lock(&id).await.unwrap().unwrap();
        let err = coordinator
            .extend_lock_ttl(&id, far, "alice", "forever")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let after = coordinator.store().find_lock(&id).await.unwrap().unwrap();
        assert_eq!(after.expires_at, before.expires_at);
        let actions: Vec<_> = coordinator
            .audit_trail("main")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::Acquired]);
    }

    #[tokio::test]
    async fn test_request_timeout_overrides_setting() {
        let clock = Arc::new(ManualClock::default());
        let settings = LockSettings {
            acquire_timeout: Duration::from_secs(30),
            ..LockSettings::default()
        };
        let store = Arc::new(MemoryStore::new());
        let coordinator = LockCoordinator::with_clock(store.clone(), settings, clock);

        let _held = store
            .begin_locked("branch:main", AdvisoryMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        let request = LockRequest::builder("main", LockType::Manual, "alice")
            .acquire_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), coordinator.acquire_lock(request))
            .await
            .expect("per-request timeout applies instead of the 30s setting");
        assert!(matches!(result, Err(LockError::Conflict { holder: None, .. })));
    }

    #[tokio::test]
    async fn test_check_write_permission_scopes() {
        let (coordinator, _clock) = coordinator();
        let request = LockRequest::builder("main", LockType::Indexing, "indexer")
            .scope(LockScope::ResourceType)
            .resource_type("object_type")
            .reason("reindex")
            .build()
            .unwrap();
        coordinator.acquire_lock(request).await.unwrap();

        let blocked = coordinator
            .check_write_permission("main", "update", Some("object_type"))
            .await
            .unwrap();
        assert!(!blocked.allowed);
        assert!(blocked.reason.contains("indexer"));

        let free = coordinator
            .check_write_permission("main", "update", Some("link_type"))
            .await
            .unwrap();
        assert!(free.allowed);

        let other_branch = coordinator
            .check_write_permission("feature", "update", None)
            .await
            .unwrap();
        assert!(other_branch.allowed);
    }

    #[tokio::test]
    async fn test_indexing_completion_drives_auto_merge_states() {
        let (coordinator, _clock) = coordinator();
        coordinator.set_auto_merge("feature", true, "alice").await.unwrap();
        let request = LockRequest::builder("feature", LockType::Indexing, "indexer")
            .build()
            .unwrap();
        let id = coordinator.acquire_lock(request).await.unwrap();

        let status = coordinator.complete_indexing("feature", "indexer").await.unwrap();
        assert_eq!(status, BranchStatus::Ready);
        assert!(coordinator.store().find_lock(&id).await.unwrap().is_none());

        let state = coordinator.get_branch_state("feature").await.unwrap().unwrap();
        assert!(state.indexing_completed_at.is_some());

        let status = coordinator
            .record_auto_merge_outcome("feature", true, "auto-merge", "clean merge")
            .await
            .unwrap();
        assert_eq!(status, BranchStatus::Merged);

        let err = coordinator
            .acquire_lock(branch_lock("feature", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_indexing_completion_without_auto_merge_stays_active() {
        let (coordinator, _clock) = coordinator();
        let request = LockRequest::builder("feature", LockType::Indexing, "indexer")
            .scope(LockScope::ResourceType)
            .resource_type("object_type")
            .build()
            .unwrap();
        coordinator.acquire_lock(request).await.unwrap();

        let status = coordinator.complete_indexing("feature", "indexer").await.unwrap();
        assert_eq!(status, BranchStatus::Active);

        let err = coordinator
            .record_auto_merge_outcome("feature", true, "auto-merge", "clean")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_audit_trail_records_lifecycle() {
        let (coordinator, clock) = coordinator();
        let id = coordinator.acquire_lock(branch_lock("main", "alice")).await.unwrap();
        coordinator
            .extend_lock_ttl(&id, Duration::from_secs(60), "alice", "long edit")
            .await
            .unwrap();
        coordinator.release_lock(&id, "alice").await.unwrap();

        let request = LockRequest::builder("main", LockType::Manual, "bob")
            .ttl(Duration::from_secs(5))
            .build()
            .unwrap();
        coordinator.acquire_lock(request).await.unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(coordinator.cleanup_expired_locks().await.unwrap(), 1);

        let actions: Vec<_> = coordinator
            .audit_trail("main")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Acquired,
                AuditAction::Extended,
                AuditAction::Released,
                AuditAction::Acquired,
                AuditAction::Expired,
            ]
        );
    }
}
