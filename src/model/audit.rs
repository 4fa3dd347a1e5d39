use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BranchLock, Id, LockScope, LockType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Acquired,
    Released,
    Extended,
    /// Removed by the TTL sweep
    Expired,
    /// Removed because the holder stopped sending heartbeats
    HeartbeatExpired,
}

/// One row of the append-only lock audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAuditEntry {
    pub lock_id: Id,
    pub branch_name: String,
    pub lock_type: LockType,
    pub lock_scope: LockScope,
    pub locked_by: String,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl LockAuditEntry {
    pub fn for_lock(
        lock: &BranchLock,
        action: AuditAction,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            lock_id: lock.id.clone(),
            branch_name: lock.branch_name.clone(),
            lock_type: lock.lock_type,
            lock_scope: lock.scope(),
            locked_by: lock.locked_by.clone(),
            action,
            timestamp,
            metadata,
        }
    }
}
