//! Commit DAG compaction.
//!
//! Long unbranched runs of commits carry no structural information: every
//! intermediate commit has exactly one parent and one child. The compactor
//! folds each such run into a single synthetic commit and records a
//! [`CompactionIndex`] so the folded commits stay resolvable.
//!
//! # Invariants
//!
//! - Branch points, merge points, roots and heads are never rewritten.
//! - The schema hash of every head is the same before and after.
//! - Every removed commit id resolves through the index to a live commit.

use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{DagError, DagResult};
use crate::model::{CommitNode, CompactionIndex, Id, IndexedCommit};

/// Validated commit graph with a forward-edge index
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    nodes: HashMap<Id, CommitNode>,
    children: HashMap<Id, Vec<Id>>,
    /// Topological order, oldest first
    order: Vec<Id>,
}

impl CommitGraph {
    /// Build a graph, rejecting duplicate ids, dangling parents, children
    /// older than their parents, and cycles.
    pub fn from_commits(commits: impl IntoIterator<Item = CommitNode>) -> DagResult<Self> {
        let mut nodes: HashMap<Id, CommitNode> = HashMap::new();
        for commit in commits {
            if nodes.contains_key(&commit.commit_id) {
                return Err(DagError::DuplicateCommit(commit.commit_id));
            }
            nodes.insert(commit.commit_id.clone(), commit);
        }

        let mut sorted: Vec<&CommitNode> = nodes.values().collect();
        sorted.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.commit_id.cmp(&b.commit_id))
        });

        let mut children: HashMap<Id, Vec<Id>> = HashMap::new();
        for node in &sorted {
            for parent_id in &node.parent_ids {
                let parent = nodes.get(parent_id).ok_or_else(|| DagError::DanglingParent {
                    commit: node.commit_id.clone(),
                    parent: parent_id.clone(),
                })?;
                if node.timestamp < parent.timestamp {
                    return Err(DagError::TemporalViolation {
                        child: node.commit_id.clone(),
                        parent: parent_id.clone(),
                    });
                }
                children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(node.commit_id.clone());
            }
        }

        // Kahn's algorithm; anything left unvisited sits on a cycle
        let mut in_degree: HashMap<&str, usize> = sorted
            .iter()
            .map(|n| (n.commit_id.as_str(), n.parent_ids.len()))
            .collect();
        let mut queue: VecDeque<&str> = sorted
            .iter()
            .filter(|n| n.parent_ids.is_empty())
            .map(|n| n.commit_id.as_str())
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for child in children.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }
        if order.len() != nodes.len() {
            let visited: HashSet<&String> = order.iter().collect();
            let stuck = sorted
                .iter()
                .find(|n| !visited.contains(&n.commit_id))
                .map(|n| n.commit_id.clone())
                .unwrap_or_default();
            return Err(DagError::Cycle(stuck));
        }

        Ok(Self {
            nodes,
            children,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, commit_id: &str) -> Option<&CommitNode> {
        self.nodes.get(commit_id)
    }

    pub fn contains(&self, commit_id: &str) -> bool {
        self.nodes.contains_key(commit_id)
    }

    pub fn children(&self, commit_id: &str) -> &[Id] {
        self.children
            .get(commit_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Commits in topological order, oldest first
    pub fn commits(&self) -> impl Iterator<Item = &CommitNode> {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    /// Commits without children
    pub fn heads(&self) -> impl Iterator<Item = &CommitNode> {
        self.commits()
            .filter(move |c| self.children(&c.commit_id).is_empty())
    }

    /// Everything reachable from `roots` by following child edges, roots included
    pub fn reachable_from(&self, roots: &[Id]) -> DagResult<HashSet<Id>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if !self.nodes.contains_key(root) {
                return Err(DagError::UnknownCommit(root.clone()));
            }
            if seen.insert(root.clone()) {
                queue.push_back(root.clone());
            }
        }
        while let Some(id) = queue.pop_front() {
            for child in self.children(&id) {
                if seen.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        Ok(seen)
    }

    pub fn into_commits(self) -> Vec<CommitNode> {
        let Self {
            mut nodes, order, ..
        } = self;
        order.into_iter().filter_map(|id| nodes.remove(&id)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DagAnalysis {
    /// Every commit with exactly one parent and one child, in topological order
    pub compactable_nodes: Vec<Id>,
    /// Maximal linear runs long enough to be collapsed
    pub chains: Vec<Vec<Id>>,
    /// Approximate bytes freed by collapsing `chains`
    pub estimated_space_savings: usize,
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub success: bool,
    pub dry_run: bool,
    pub space_saved: usize,
    pub nodes_removed: usize,
    /// Original commits folded away
    pub removed_commits: Vec<Id>,
    /// Synthetic commits plus the successors rewritten to point at them
    pub new_commits: Vec<CommitNode>,
    /// The whole compacted graph, topological order
    pub commits: Vec<CommitNode>,
    pub index: CompactionIndex,
}

#[derive(Debug, Clone)]
pub struct DagCompactor {
    min_chain_length: usize,
    protected: HashSet<Id>,
}

impl Default for DagCompactor {
    fn default() -> Self {
        Self::new(2)
    }
}

impl DagCompactor {
    pub fn new(min_chain_length: usize) -> Self {
        Self {
            min_chain_length: min_chain_length.max(1),
            protected: HashSet::new(),
        }
    }

    /// Commits that must survive compaction, e.g. branch heads that point
    /// into the middle of a chain
    pub fn protect(mut self, commit_ids: impl IntoIterator<Item = Id>) -> Self {
        self.protected.extend(commit_ids);
        self
    }

    fn is_compactable(&self, graph: &CommitGraph, node: &CommitNode, roots: &HashSet<&Id>) -> bool {
        node.parent_ids.len() == 1
            && graph.children(&node.commit_id).len() == 1
            && !roots.contains(&node.commit_id)
            && !self.protected.contains(&node.commit_id)
    }

    pub fn analyze_dag(&self, graph: &CommitGraph, root_commits: &[Id]) -> DagResult<DagAnalysis> {
        let reachable = graph.reachable_from(root_commits)?;
        let roots: HashSet<&Id> = root_commits.iter().collect();

        let compactable: Vec<Id> = graph
            .commits()
            .filter(|c| reachable.contains(&c.commit_id))
            .filter(|c| self.is_compactable(graph, c, &roots))
            .map(|c| c.commit_id.clone())
            .collect();
        let compactable_set: HashSet<&Id> = compactable.iter().collect();

        let mut chains = Vec::new();
        for id in &compactable {
            let Some(node) = graph.get(id) else { continue };
            // Only start walking at the head of a run
            if compactable_set.contains(&node.parent_ids[0]) {
                continue;
            }
            let mut chain = vec![id.clone()];
            let mut current = id;
            while let [next] = graph.children(current) {
                if !compactable_set.contains(next) {
                    break;
                }
                chain.push(next.clone());
                current = next;
            }
            if chain.len() >= self.min_chain_length {
                chains.push(chain);
            }
        }

        let estimated_space_savings = chains
            .iter()
            .map(|chain| chain_savings(graph, chain))
            .sum();

        debug!(
            "DAG analysis: {} commits, {} compactable, {} chains",
            graph.len(),
            compactable.len(),
            chains.len()
        );

        Ok(DagAnalysis {
            compactable_nodes: compactable,
            chains,
            estimated_space_savings,
        })
    }

    /// Collapse every chain found by [`analyze_dag`](Self::analyze_dag).
    /// With `dry_run` the outcome is computed and verified but flagged so
    /// stores refuse to apply it.
    pub fn compact_dag(
        &self,
        graph: &CommitGraph,
        root_commits: &[Id],
        dry_run: bool,
    ) -> DagResult<CompactionOutcome> {
        let analysis = self.analyze_dag(graph, root_commits)?;

        let mut working: HashMap<Id, CommitNode> = graph
            .commits()
            .map(|c| (c.commit_id.clone(), c.clone()))
            .collect();
        let mut removed_commits = Vec::new();
        let mut synthetic_ids = Vec::new();
        let mut rewritten: BTreeSet<Id> = BTreeSet::new();
        let mut index = CompactionIndex::new();
        let mut space_saved = 0;

        for chain in &analysis.chains {
            self.verify_chain(graph, chain)?;
            let synthetic = synthesize(graph, chain)?;

            let last = &chain[chain.len() - 1];
            let successor_id = graph.children(last)[0].clone();
            let successor = working
                .get_mut(&successor_id)
                .ok_or_else(|| DagError::UnknownCommit(successor_id.clone()))?;
            for parent in successor.parent_ids.iter_mut() {
                if parent == last {
                    *parent = synthetic.commit_id.clone();
                }
            }
            rewritten.insert(successor_id);

            for original in chain {
                if let Some(node) = working.remove(original) {
                    index.insert(IndexedCommit {
                        original_commit_id: node.commit_id.clone(),
                        compacted_into: synthetic.commit_id.clone(),
                        timestamp: node.timestamp,
                        schema_hash: node.schema_hash,
                    });
                }
                removed_commits.push(original.clone());
            }

            space_saved += chain_savings(graph, chain);
            synthetic_ids.push(synthetic.commit_id.clone());
            working.insert(synthetic.commit_id.clone(), synthetic);
        }

        let compacted = CommitGraph::from_commits(working.into_values())?;
        verify_compaction(graph, &compacted, &index)?;

        let new_commits = synthetic_ids
            .iter()
            .chain(rewritten.iter())
            .filter_map(|id| compacted.get(id).cloned())
            .collect();

        info!(
            "{} DAG: {} chains, {} commits removed, ~{} bytes saved",
            if dry_run { "Dry-run compaction of" } else { "Compacted" },
            analysis.chains.len(),
            removed_commits.len(),
            space_saved
        );

        Ok(CompactionOutcome {
            success: true,
            dry_run,
            space_saved,
            nodes_removed: removed_commits.len(),
            removed_commits,
            new_commits,
            commits: compacted.into_commits(),
            index,
        })
    }

    fn verify_chain(&self, graph: &CommitGraph, chain: &[Id]) -> DagResult<()> {
        for id in chain {
            let node = graph
                .get(id)
                .ok_or_else(|| DagError::UnknownCommit(id.clone()))?;
            let violation = if node.parent_ids.len() != 1 {
                Some(format!("has {} parents", node.parent_ids.len()))
            } else if graph.children(id).len() != 1 {
                Some(format!("has {} children", graph.children(id).len()))
            } else if self.protected.contains(id) {
                Some("is a protected branch head".to_string())
            } else {
                None
            };
            if let Some(reason) = violation {
                return Err(DagError::IntegrityViolation {
                    commit_id: id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// Synthetic commit standing in for `chain`, keyed by a hash of the chain's ids
fn synthesize(graph: &CommitGraph, chain: &[Id]) -> DagResult<CommitNode> {
    let first = graph
        .get(&chain[0])
        .ok_or_else(|| DagError::UnknownCommit(chain[0].clone()))?;
    let last_id = &chain[chain.len() - 1];
    let last = graph
        .get(last_id)
        .ok_or_else(|| DagError::UnknownCommit(last_id.clone()))?;

    let mut hasher = Sha256::new();
    for id in chain {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }

    Ok(CommitNode {
        commit_id: hex::encode(hasher.finalize()),
        parent_ids: first.parent_ids.clone(),
        branch_id: last.branch_id.clone(),
        timestamp: last.timestamp,
        schema_hash: last.schema_hash.clone(),
        compacted_from: chain.to_vec(),
    })
}

fn chain_savings(graph: &CommitGraph, chain: &[Id]) -> usize {
    let original: usize = chain
        .iter()
        .filter_map(|id| graph.get(id))
        .map(CommitNode::approximate_size)
        .sum();
    let replacement = synthesize(graph, chain)
        .map(|c| c.approximate_size())
        .unwrap_or(0);
    original.saturating_sub(replacement)
}

fn verify_compaction(before: &CommitGraph, after: &CommitGraph, index: &CompactionIndex) -> DagResult<()> {
    for head in before.heads() {
        match after.get(&head.commit_id) {
            Some(kept) if kept.schema_hash == head.schema_hash => {}
            Some(_) => {
                return Err(DagError::IntegrityViolation {
                    commit_id: head.commit_id.clone(),
                    reason: "head schema hash changed".to_string(),
                })
            }
            None => {
                return Err(DagError::IntegrityViolation {
                    commit_id: head.commit_id.clone(),
                    reason: "head was removed".to_string(),
                })
            }
        }
    }
    for entry in index.entries() {
        if !after.contains(&entry.compacted_into) {
            return Err(DagError::IntegrityViolation {
                commit_id: entry.original_commit_id.clone(),
                reason: format!("compacted into missing commit {}", entry.compacted_into),
            });
        }
    }
    Ok(())
}
