use ontology_vcs::logic::{LockCoordinator, LockSettings};
use ontology_vcs::model::{BranchStatus, LockRequest, LockScope, LockType};
use ontology_vcs::store::{LockStore, MemoryStore};
use ontology_vcs::{LockError, ManualClock};
use std::sync::Arc;
use std::time::Duration;

// Two coordinators over one store stand in for two service instances
struct Cluster {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    a: Arc<LockCoordinator<MemoryStore>>,
    b: Arc<LockCoordinator<MemoryStore>>,
}

impl Cluster {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let settings = LockSettings {
            acquire_timeout: Duration::from_secs(1),
            ..LockSettings::default()
        };
        let a = Arc::new(LockCoordinator::with_clock(
            store.clone(),
            settings.clone(),
            clock.clone(),
        ));
        let b = Arc::new(LockCoordinator::with_clock(store.clone(), settings, clock.clone()));
        Self { store, clock, a, b }
    }
}

fn resource_type_lock(branch: &str, resource_type: &str, by: &str) -> LockRequest {
    LockRequest::builder(branch, LockType::Indexing, by)
        .scope(LockScope::ResourceType)
        .resource_type(resource_type)
        .reason("reindex")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_overlapping_scope_conflicts_until_ttl_expires() {
    let cluster = Cluster::new();
    let branch_lock = LockRequest::builder("main", LockType::Manual, "alice")
        .ttl(Duration::from_secs(60))
        .build()
        .unwrap();
    cluster.a.acquire_lock(branch_lock).await.unwrap();

    let err = cluster
        .b
        .acquire_lock(resource_type_lock("main", "object_type", "indexer"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    cluster.clock.advance(Duration::from_secs(61));
    cluster
        .b
        .acquire_lock(resource_type_lock("main", "object_type", "indexer"))
        .await
        .expect("expired lock no longer blocks");

    // The dead lock was swept during acquisition and the branch is writable again
    let state = cluster.a.get_branch_state("main").await.unwrap().unwrap();
    assert_eq!(state.active_locks.len(), 1);
    assert_eq!(state.current_state, BranchStatus::Active);
}

#[tokio::test]
async fn test_heartbeat_grace_boundary() {
    let cluster = Cluster::new();
    let request = LockRequest::builder("main", LockType::Indexing, "indexer")
        .heartbeat_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    let id = cluster.a.acquire_lock(request).await.unwrap();

    cluster.clock.advance(Duration::from_millis(29_000));
    let health = cluster.a.get_lock_health_status(&id).await.unwrap().unwrap();
    assert!(!health.heartbeat_expired);
    assert_eq!(cluster.a.cleanup_heartbeat_expired_locks().await.unwrap(), 0);

    cluster.clock.advance(Duration::from_millis(2_000));
    let health = cluster.a.get_lock_health_status(&id).await.unwrap().unwrap();
    assert!(health.heartbeat_expired);

    // Expired locks are ignored before the sweep runs
    cluster
        .b
        .acquire_lock(LockRequest::builder("main", LockType::Manual, "bob").build().unwrap())
        .await
        .unwrap();
    assert!(cluster.store.find_lock(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_heartbeat_sweep_releases_silent_holder() {
    let cluster = Cluster::new();
    let request = LockRequest::builder("main", LockType::Indexing, "indexer")
        .heartbeat_interval(Duration::from_secs(5))
        .build()
        .unwrap();
    let id = cluster.a.acquire_lock(request).await.unwrap();

    cluster.clock.advance(Duration::from_secs(16));
    assert_eq!(cluster.b.cleanup_heartbeat_expired_locks().await.unwrap(), 1);
    assert!(cluster.a.get_lock_health_status(&id).await.unwrap().is_none());

    let state = cluster.a.get_branch_state("main").await.unwrap().unwrap();
    assert_eq!(state.current_state, BranchStatus::Active);
}

#[tokio::test]
async fn test_disjoint_resource_types_acquire_concurrently() {
    let cluster = Cluster::new();
    let (first, second) = tokio::join!(
        cluster.a.acquire_lock(resource_type_lock("main", "object_type", "indexer-1")),
        cluster.b.acquire_lock(resource_type_lock("main", "link_type", "indexer-2")),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(cluster.a.list_active_locks("main").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_overlapping_acquisitions_have_one_winner() {
    let cluster = Cluster::new();
    let (first, second) = tokio::join!(
        cluster.a.acquire_lock(resource_type_lock("main", "object_type", "indexer-1")),
        cluster.b.acquire_lock(resource_type_lock("main", "object_type", "indexer-2")),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(LockError::Conflict { holder: Some(_), .. }))));
}

#[tokio::test]
async fn test_extend_lock_ttl_adds_exact_duration() {
    let cluster = Cluster::new();
    let request = LockRequest::builder("main", LockType::Manual, "alice")
        .ttl(Duration::from_secs(60))
        .build()
        .unwrap();
    let id = cluster.a.acquire_lock(request).await.unwrap();
    let before = cluster.store.find_lock(&id).await.unwrap().unwrap().expires_at;

    assert!(cluster
        .b
        .extend_lock_ttl(&id, Duration::from_secs(90), "alice", "migration running long")
        .await
        .unwrap());

    let after = cluster.store.find_lock(&id).await.unwrap().unwrap().expires_at;
    assert_eq!(after - before, chrono::Duration::seconds(90));
}

#[tokio::test]
async fn test_release_twice_is_not_an_error() {
    let cluster = Cluster::new();
    let request = LockRequest::builder("main", LockType::Manual, "alice").build().unwrap();
    let id = cluster.a.acquire_lock(request).await.unwrap();

    assert!(cluster.a.release_lock(&id, "alice").await.unwrap());
    assert!(!cluster.b.release_lock(&id, "alice").await.unwrap());
}

#[tokio::test]
async fn test_write_blocked_message_names_holder_and_expiry() {
    let cluster = Cluster::new();
    let request = LockRequest::builder("main", LockType::Maintenance, "ops")
        .reason("vacuum")
        .build()
        .unwrap();
    let id = cluster.a.acquire_lock(request).await.unwrap();
    let lock = cluster.store.find_lock(&id).await.unwrap().unwrap();

    let permission = cluster
        .b
        .check_write_permission("main", "create_entity", Some("object_type"))
        .await
        .unwrap();
    assert!(!permission.allowed);
    assert!(permission.reason.contains("ops"));
    assert!(permission.reason.contains(&lock.expires_at.to_rfc3339()));
}
