use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockError, LockHolder};
use crate::model::{checked_after, seconds_between, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Manual,
    Indexing,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockScope {
    Branch,
    ResourceType,
    Resource,
}

/// What a lock covers on its branch. Each variant carries exactly the
/// identifiers its scope needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "lock_scope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockTarget {
    Branch,
    ResourceType {
        resource_type: String,
    },
    Resource {
        resource_type: String,
        resource_id: String,
    },
}

impl LockTarget {
    pub fn scope(&self) -> LockScope {
        match self {
            LockTarget::Branch => LockScope::Branch,
            LockTarget::ResourceType { .. } => LockScope::ResourceType,
            LockTarget::Resource { .. } => LockScope::Resource,
        }
    }

    pub fn resource_type(&self) -> Option<&str> {
        match self {
            LockTarget::Branch => None,
            LockTarget::ResourceType { resource_type }
            | LockTarget::Resource { resource_type, .. } => Some(resource_type),
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            LockTarget::Resource { resource_id, .. } => Some(resource_id),
            LockTarget::Branch | LockTarget::ResourceType { .. } => None,
        }
    }

    /// Advisory-lock key for this target, e.g. `branch:main:type:object_type:id:42`
    pub fn scope_key(&self, branch_name: &str) -> String {
        match self {
            LockTarget::Branch => format!("branch:{}", branch_name),
            LockTarget::ResourceType { resource_type } => {
                format!("branch:{}:type:{}", branch_name, resource_type)
            }
            LockTarget::Resource {
                resource_type,
                resource_id,
            } => format!(
                "branch:{}:type:{}:id:{}",
                branch_name, resource_type, resource_id
            ),
        }
    }

    /// Two targets on the same branch overlap when they could touch the same data.
    /// Disjoint resource types never overlap.
    pub fn overlaps(&self, other: &LockTarget) -> bool {
        match (self, other) {
            (LockTarget::Branch, _) | (_, LockTarget::Branch) => true,
            (
                LockTarget::ResourceType { resource_type: a },
                LockTarget::ResourceType { resource_type: b },
            )
            | (
                LockTarget::ResourceType { resource_type: a },
                LockTarget::Resource {
                    resource_type: b, ..
                },
            )
            | (
                LockTarget::Resource {
                    resource_type: a, ..
                },
                LockTarget::ResourceType { resource_type: b },
            ) => a == b,
            (
                LockTarget::Resource {
                    resource_type: a,
                    resource_id: x,
                },
                LockTarget::Resource {
                    resource_type: b,
                    resource_id: y,
                },
            ) => a == b && x == y,
        }
    }
}

/// A validated request to acquire a lock. Build with [`LockRequest::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    pub branch_name: String,
    pub lock_type: LockType,
    pub target: LockTarget,
    pub locked_by: String,
    pub reason: String,
    pub ttl: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    pub auto_release_enabled: bool,
    /// How long to wait for the branch advisory lock; the coordinator's
    /// setting applies when unset
    pub acquire_timeout: Option<Duration>,
}

impl LockRequest {
    pub fn builder(
        branch_name: impl Into<String>,
        lock_type: LockType,
        locked_by: impl Into<String>,
    ) -> LockRequestBuilder {
        LockRequestBuilder {
            branch_name: branch_name.into(),
            lock_type,
            locked_by: locked_by.into(),
            scope: LockScope::Branch,
            resource_type: None,
            resource_id: None,
            reason: None,
            ttl: None,
            heartbeat_interval: None,
            auto_release_enabled: true,
            acquire_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRequestBuilder {
    branch_name: String,
    lock_type: LockType,
    locked_by: String,
    scope: LockScope,
    resource_type: Option<String>,
    resource_id: Option<String>,
    reason: Option<String>,
    ttl: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    auto_release_enabled: bool,
    acquire_timeout: Option<Duration>,
}

impl LockRequestBuilder {
    pub fn scope(mut self, scope: LockScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn auto_release(mut self, enabled: bool) -> Self {
        self.auto_release_enabled = enabled;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Validate every field and produce the request
    pub fn build(self) -> Result<LockRequest, LockError> {
        let invalid = |msg: &str| Err(LockError::InvalidRequest(msg.to_string()));

        if self.branch_name.trim().is_empty() {
            return invalid("branch name must not be empty");
        }
        if self.locked_by.trim().is_empty() {
            return invalid("locked_by must not be empty");
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return invalid("ttl must be positive");
        }
        if self.heartbeat_interval.is_some_and(|i| i.is_zero()) {
            return invalid("heartbeat interval must be positive");
        }
        if self.acquire_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("acquire timeout must be positive");
        }

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let target = match (
            self.scope,
            non_empty(self.resource_type),
            non_empty(self.resource_id),
        ) {
            (LockScope::Branch, None, None) => LockTarget::Branch,
            (LockScope::Branch, _, _) => {
                return invalid("BRANCH scope takes no resource_type or resource_id")
            }
            (LockScope::ResourceType, Some(resource_type), None) => {
                LockTarget::ResourceType { resource_type }
            }
            (LockScope::ResourceType, None, _) => {
                return invalid("RESOURCE_TYPE scope requires resource_type")
            }
            (LockScope::ResourceType, Some(_), Some(_)) => {
                return invalid("RESOURCE_TYPE scope takes no resource_id")
            }
            (LockScope::Resource, Some(resource_type), Some(resource_id)) => {
                LockTarget::Resource {
                    resource_type,
                    resource_id,
                }
            }
            (LockScope::Resource, _, _) => {
                return invalid("RESOURCE scope requires resource_type and resource_id")
            }
        };

        let reason = self
            .reason
            .unwrap_or_else(|| format!("{:?} lock", self.lock_type));

        Ok(LockRequest {
            branch_name: self.branch_name,
            lock_type: self.lock_type,
            target,
            locked_by: self.locked_by,
            reason,
            ttl: self.ttl,
            heartbeat_interval: self.heartbeat_interval,
            auto_release_enabled: self.auto_release_enabled,
            acquire_timeout: self.acquire_timeout,
        })
    }
}

/// A granted lock, persisted inside its branch's `BranchState`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchLock {
    pub id: Id,
    pub branch_name: String,
    pub lock_type: LockType,
    #[serde(flatten)]
    pub target: LockTarget,
    pub locked_by: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_info: Option<serde_json::Value>,
    pub auto_release_enabled: bool,
}

impl BranchLock {
    /// Grant a lock for a request. `ttl` is the effective TTL after defaults
    /// and must not push `expires_at` out of range.
    pub fn grant(
        request: LockRequest,
        id: Id,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let expires_at = checked_after(now, ttl).ok_or_else(|| {
            LockError::InvalidRequest(format!(
                "TTL of {}s puts the lock expiry out of range",
                ttl.as_secs()
            ))
        })?;
        let heartbeat_interval_ms = request
            .heartbeat_interval
            .map(|i| i.as_millis().min(u64::MAX as u128) as u64);

        Ok(Self {
            id,
            branch_name: request.branch_name,
            lock_type: request.lock_type,
            target: request.target,
            locked_by: request.locked_by,
            reason: request.reason,
            created_at: now,
            expires_at,
            heartbeat_interval_ms,
            // A fresh grant counts as the first sign of life
            last_heartbeat: heartbeat_interval_ms.map(|_| now),
            heartbeat_source: None,
            heartbeat_status: None,
            progress_info: None,
            auto_release_enabled: request.auto_release_enabled,
        })
    }

    pub fn scope(&self) -> LockScope {
        self.target.scope()
    }

    pub fn scope_key(&self) -> String {
        self.target.scope_key(&self.branch_name)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn is_ttl_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> Option<f64> {
        let last = self.last_heartbeat.unwrap_or(self.created_at);
        self.heartbeat_interval_ms
            .map(|_| seconds_between(last, now).max(0.0))
    }

    /// Heartbeat silence longer than `multiplier` intervals
    fn heartbeat_overdue(&self, now: DateTime<Utc>, multiplier: f64) -> bool {
        match (self.heartbeat_interval_ms, self.seconds_since_heartbeat(now)) {
            (Some(interval_ms), Some(elapsed)) => {
                elapsed * 1000.0 > interval_ms as f64 * multiplier
            }
            _ => false,
        }
    }

    /// Heartbeat expiry only applies to locks that opted into auto release
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, grace_multiplier: f64) -> bool {
        self.auto_release_enabled && self.heartbeat_overdue(now, grace_multiplier)
    }

    /// Expired by either TTL or heartbeat; expired locks are treated as absent
    pub fn is_expired(&self, now: DateTime<Utc>, grace_multiplier: f64) -> bool {
        self.is_ttl_expired(now) || self.is_heartbeat_expired(now, grace_multiplier)
    }

    pub fn health(&self, now: DateTime<Utc>, grace_multiplier: f64) -> LockHealth {
        let ttl_expired = self.is_ttl_expired(now);
        let heartbeat_expired = self.is_heartbeat_expired(now, grace_multiplier);

        let health = if ttl_expired || self.heartbeat_overdue(now, grace_multiplier) {
            HealthLevel::Critical
        } else if self.heartbeat_overdue(now, 1.0) {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        LockHealth {
            lock_id: self.id.clone(),
            ttl_expired,
            heartbeat_expired,
            seconds_since_heartbeat: self.seconds_since_heartbeat(now),
            ttl_remaining_seconds: seconds_between(now, self.expires_at).max(0.0),
            health,
        }
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder {
            lock_id: self.id.clone(),
            locked_by: self.locked_by.clone(),
            lock_type: self.lock_type,
            scope_key: self.scope_key(),
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHealth {
    pub lock_id: Id,
    pub ttl_expired: bool,
    pub heartbeat_expired: bool,
    pub seconds_since_heartbeat: Option<f64>,
    pub ttl_remaining_seconds: f64,
    pub health: HealthLevel,
}

/// Outcome of a write-permission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritePermission {
    pub allowed: bool,
    pub reason: String,
}

impl WritePermission {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_type(rt: &str) -> LockTarget {
        LockTarget::ResourceType {
            resource_type: rt.to_string(),
        }
    }

    fn resource(rt: &str, id: &str) -> LockTarget {
        LockTarget::Resource {
            resource_type: rt.to_string(),
            resource_id: id.to_string(),
        }
    }

    #[test]
    fn test_branch_scope_overlaps_everything() {
        let targets = [
            LockTarget::Branch,
            resource_type("object_type"),
            resource("object_type", "Product"),
        ];
        for target in &targets {
            assert!(LockTarget::Branch.overlaps(target));
            assert!(target.overlaps(&LockTarget::Branch));
        }
    }

    #[test]
    fn test_resource_scopes_overlap_only_on_matching_type_or_id() {
        assert!(resource_type("object_type").overlaps(&resource_type("object_type")));
        assert!(!resource_type("object_type").overlaps(&resource_type("link_type")));
        assert!(resource_type("object_type").overlaps(&resource("object_type", "a")));
        assert!(resource("object_type", "a").overlaps(&resource_type("object_type")));
        assert!(!resource("link_type", "a").overlaps(&resource_type("object_type")));
        assert!(resource("object_type", "a").overlaps(&resource("object_type", "a")));
        assert!(!resource("object_type", "a").overlaps(&resource("object_type", "b")));
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(LockTarget::Branch.scope_key("main"), "branch:main");
        assert_eq!(
            resource_type("object_type").scope_key("main"),
            "branch:main:type:object_type"
        );
        assert_eq!(
            resource("object_type", "42").scope_key("main"),
            "branch:main:type:object_type:id:42"
        );
    }

    #[test]
    fn test_builder_rejects_inconsistent_scope() {
        let err = LockRequest::builder("main", LockType::Manual, "alice")
            .scope(LockScope::Resource)
            .resource_type("object_type")
            .build()
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let err = LockRequest::builder("main", LockType::Manual, "alice")
            .resource_type("object_type")
            .build()
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let err = LockRequest::builder("", LockType::Manual, "alice")
            .build()
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let err = LockRequest::builder("main", LockType::Manual, "alice")
            .ttl(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let err = LockRequest::builder("main", LockType::Manual, "alice")
            .acquire_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));
    }

    #[test]
    fn test_builder_produces_typed_target() {
        let request = LockRequest::builder("feature", LockType::Indexing, "indexer")
            .scope(LockScope::ResourceType)
            .resource_type("link_type")
            .reason("reindex links")
            .build()
            .unwrap();
        assert_eq!(request.target, resource_type("link_type"));
        assert_eq!(request.reason, "reindex links");
        assert!(request.auto_release_enabled);
    }

    #[test]
    fn test_lock_serializes_flat_scope_fields() {
        let request = LockRequest::builder("main", LockType::Manual, "alice")
            .scope(LockScope::Resource)
            .resource_type("object_type")
            .resource_id("Product")
            .build()
            .unwrap();
        let lock = BranchLock::grant(request, "l1".into(), Utc::now(), Duration::from_secs(60)).unwrap();
        let json = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["lock_scope"], "RESOURCE");
        assert_eq!(json["resource_type"], "object_type");
        assert_eq!(json["resource_id"], "Product");
        assert_eq!(json["lock_type"], "MANUAL");

        let back: BranchLock = serde_json::from_value(json).unwrap();
        assert_eq!(back, lock);
    }

    #[test]
    fn test_health_levels_follow_heartbeat_age() {
        let start = Utc::now();
        let request = LockRequest::builder("main", LockType::Indexing, "indexer")
            .heartbeat_interval(Duration::from_secs(10))
            .build()
            .unwrap();
        let lock = BranchLock::grant(request, "l1".into(), start, Duration::from_secs(3600)).unwrap();

        let at = |secs: i64| start + chrono::Duration::seconds(secs);
        assert_eq!(lock.health(at(5), 3.0).health, HealthLevel::Healthy);
        assert_eq!(lock.health(at(15), 3.0).health, HealthLevel::Warning);
        assert_eq!(lock.health(at(31), 3.0).health, HealthLevel::Critical);
        assert!(lock.health(at(31), 3.0).heartbeat_expired);
        assert_eq!(lock.health(at(4000), 3.0).health, HealthLevel::Critical);
        assert!(lock.health(at(4000), 3.0).ttl_expired);
    }
}
