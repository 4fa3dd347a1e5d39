//! Background maintenance: lock expiry sweeps and periodic DAG compaction.

use anyhow::Result;
use log::{debug, error, info};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{CompactionConfig, LockConfig};
use crate::logic::dag_compactor::{CommitGraph, CompactionOutcome, DagCompactor};
use crate::logic::lock_coordinator::LockCoordinator;
use crate::model::Id;
use crate::store::traits::{CommitStore, Store};

pub struct MaintenanceRunner<S: Store> {
    store: Arc<S>,
    coordinator: Arc<LockCoordinator<S>>,
    locks: LockConfig,
    compaction: CompactionConfig,
}

/// Running maintenance tasks. Dropping the handle also stops them, but
/// without waiting for an in-flight cycle to finish.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MaintenanceHandle {
    /// Signal every task to stop and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Maintenance task '{}' ended abnormally: {}", name, e);
            }
        }
        info!("Maintenance tasks stopped");
    }
}

impl<S: Store + 'static> MaintenanceRunner<S> {
    pub fn new(
        store: Arc<S>,
        coordinator: Arc<LockCoordinator<S>>,
        locks: LockConfig,
        compaction: CompactionConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            locks,
            compaction,
        }
    }

    pub fn start(self: Arc<Self>) -> MaintenanceHandle {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = Vec::new();

        let runner = self.clone();
        tasks.push((
            "ttl-sweep",
            spawn_periodic("ttl-sweep", self.locks.ttl_sweep_interval(), signal.clone(), move || {
                let runner = runner.clone();
                async move {
                    match runner.coordinator.cleanup_expired_locks().await {
                        Ok(0) => {}
                        Ok(n) => info!("TTL sweep released {} locks", n),
                        Err(e) => error!("TTL sweep failed: {}", e),
                    }
                }
            }),
        ));

        let runner = self.clone();
        tasks.push((
            "heartbeat-sweep",
            spawn_periodic(
                "heartbeat-sweep",
                self.locks.heartbeat_sweep_interval(),
                signal.clone(),
                move || {
                    let runner = runner.clone();
                    async move {
                        match runner.coordinator.cleanup_heartbeat_expired_locks().await {
                            Ok(0) => {}
                            Ok(n) => info!("Heartbeat sweep released {} locks", n),
                            Err(e) => error!("Heartbeat sweep failed: {}", e),
                        }
                    }
                },
            ),
        ));

        if self.compaction.enabled {
            let runner = self.clone();
            tasks.push((
                "compaction",
                spawn_periodic("compaction", self.compaction.interval(), signal, move || {
                    let runner = runner.clone();
                    async move {
                        if let Err(e) = runner.run_compaction(false).await {
                            error!("DAG compaction failed: {:#}", e);
                        }
                    }
                }),
            ));
        }

        info!("Started {} maintenance tasks", tasks.len());
        MaintenanceHandle { shutdown, tasks }
    }

    /// One compaction cycle over the whole commit store. Branch heads are
    /// protected and every root commit seeds the traversal.
    pub async fn run_compaction(&self, dry_run: bool) -> Result<Option<CompactionOutcome>> {
        let commits = self.store.list_commits().await?;
        if commits.is_empty() {
            return Ok(None);
        }

        let graph = CommitGraph::from_commits(commits)?;
        let roots: Vec<Id> = graph
            .commits()
            .filter(|c| c.is_root())
            .map(|c| c.commit_id.clone())
            .collect();
        let heads = CommitStore::list_branch_heads(self.store.as_ref()).await?;

        let compactor = DagCompactor::new(self.compaction.min_chain_length)
            .protect(heads.into_iter().map(|h| h.head_commit));
        let outcome = compactor.compact_dag(&graph, &roots, dry_run)?;

        if !dry_run && outcome.nodes_removed > 0 {
            self.store.apply_compaction(&outcome).await?;
        }
        Ok(Some(outcome))
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => job().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Maintenance task '{}' stopped", name);
    })
}
