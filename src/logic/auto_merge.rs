use itertools::Itertools;
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{LockError, LockResult};
use crate::logic::lock_coordinator::LockCoordinator;
use crate::logic::merge::{MergeEngine, MergeOptions};
use crate::model::{BranchStatus, MergeResult, MergeStatus};
use crate::store::traits::LockStore;

const AUTO_MERGE_ACTOR: &str = "auto-merge";

#[derive(Debug, Clone)]
pub struct AutoMergeReport {
    pub branch_name: String,
    /// MERGED or ACTIVE after the check
    pub status: BranchStatus,
    pub merge: MergeResult,
}

/// Runs the merge check for a branch that finished indexing with auto-merge
/// enabled, then moves it to MERGED or back to ACTIVE.
pub struct AutoMergeCheck<S: LockStore> {
    coordinator: Arc<LockCoordinator<S>>,
}

impl<S: LockStore> AutoMergeCheck<S> {
    pub fn new(coordinator: Arc<LockCoordinator<S>>) -> Self {
        Self { coordinator }
    }

    /// `source` is the branch schema, `target` its parent's, `base` the
    /// schema at the fork point when known.
    pub async fn run(
        &self,
        branch_name: &str,
        source: &Value,
        target: &Value,
        base: Option<&Value>,
    ) -> LockResult<AutoMergeReport> {
        let state = self
            .coordinator
            .get_branch_state(branch_name)
            .await?
            .ok_or_else(|| LockError::UnknownBranch(branch_name.to_string()))?;
        if state.current_state != BranchStatus::Ready {
            return Err(LockError::InvalidTransition {
                branch: branch_name.to_string(),
                from: state.current_state,
                to: BranchStatus::Merged,
            });
        }

        let merge = match MergeEngine::merge_branches(source, target, base, MergeOptions::default()) {
            Ok(result) => result,
            Err(e) => {
                warn!("Auto-merge of '{}' could not read schemas: {}", branch_name, e);
                MergeResult::error(e.to_string(), 0)
            }
        };

        let reason = describe(&merge);
        let status = self
            .coordinator
            .record_auto_merge_outcome(branch_name, merge.is_success(), AUTO_MERGE_ACTOR, &reason)
            .await?;
        info!("Auto-merge check for '{}' finished: {}", branch_name, reason);

        Ok(AutoMergeReport {
            branch_name: branch_name.to_string(),
            status,
            merge,
        })
    }
}

fn describe(merge: &MergeResult) -> String {
    match merge.status {
        MergeStatus::Success if merge.auto_resolved => format!(
            "Merged after auto-resolving {} conflicts",
            merge.resolution_log.len()
        ),
        MergeStatus::Success => "Merged cleanly".to_string(),
        MergeStatus::Conflict => format!(
            "Blocked by conflicts at {}",
            merge.blocking_conflicts().map(|c| c.location()).join(", ")
        ),
        MergeStatus::Error => format!(
            "Merge failed: {}",
            merge.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
