use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Id;

/// A node of the commit DAG. Replaced, never mutated, by compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitNode {
    pub commit_id: Id,
    /// Empty for a root, two or more for a merge
    pub parent_ids: Vec<Id>,
    pub branch_id: String,
    pub timestamp: DateTime<Utc>,
    pub schema_hash: String,
    /// Original commits folded into this one by compaction
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compacted_from: Vec<Id>,
}

impl CommitNode {
    pub fn new(
        commit_id: impl Into<Id>,
        parent_ids: Vec<Id>,
        branch_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        schema_hash: impl Into<String>,
    ) -> Self {
        Self {
            commit_id: commit_id.into(),
            parent_ids,
            branch_id: branch_id.into(),
            timestamp,
            schema_hash: schema_hash.into(),
            compacted_from: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    pub fn is_synthetic(&self) -> bool {
        !self.compacted_from.is_empty()
    }

    /// Approximate persisted size, used for space estimates
    pub fn approximate_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Branch lookup result: head commit and the branch it was forked from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchHead {
    pub branch_name: String,
    pub head_commit: Id,
    pub parent_branch: Option<String>,
}

/// Where an original commit lives after compaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedCommit {
    pub original_commit_id: Id,
    pub compacted_into: Id,
    pub timestamp: DateTime<Utc>,
    pub schema_hash: String,
}

/// Maps compacted commit ids to the synthetic commits that absorbed them, so
/// time-travel queries can still address intermediate points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionIndex {
    entries: BTreeMap<Id, IndexedCommit>,
}

impl CompactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: IndexedCommit) {
        self.entries.insert(entry.original_commit_id.clone(), entry);
    }

    pub fn get(&self, commit_id: &str) -> Option<&IndexedCommit> {
        self.entries.get(commit_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexedCommit> {
        self.entries.values()
    }

    pub fn extend(&mut self, other: CompactionIndex) {
        self.entries.extend(other.entries);
    }

    /// Resolve an original commit to the live commit holding it, following
    /// repeated compactions. The schema hash and timestamp are those recorded
    /// for the original commit. Returns `None` for ids never compacted.
    pub fn resolve(&self, commit_id: &str) -> Option<IndexedCommit> {
        let first = self.entries.get(commit_id)?;
        let mut live = first.compacted_into.clone();
        let mut hops = 0;
        while let Some(next) = self.entries.get(&live) {
            live = next.compacted_into.clone();
            hops += 1;
            if hops > self.entries.len() {
                break;
            }
        }
        Some(IndexedCommit {
            compacted_into: live,
            ..first.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(original: &str, into: &str) -> IndexedCommit {
        IndexedCommit {
            original_commit_id: original.to_string(),
            compacted_into: into.to_string(),
            timestamp: Utc::now(),
            schema_hash: format!("hash-{}", original),
        }
    }

    #[test]
    fn test_resolve_follows_repeated_compactions() {
        let mut index = CompactionIndex::new();
        index.insert(indexed("c2", "syn-1"));
        index.insert(indexed("syn-1", "syn-2"));

        let resolved = index.resolve("c2").unwrap();
        assert_eq!(resolved.compacted_into, "syn-2");
        assert_eq!(resolved.schema_hash, "hash-c2");
        assert!(index.resolve("c9").is_none());
    }
}
