use chrono::{Duration, TimeZone, Utc};
use ontology_vcs::logic::{CommitGraph, DagCompactor};
use ontology_vcs::model::CommitNode;
use ontology_vcs::store::{CommitStore, MemoryStore};
use ontology_vcs::DagError;

fn commit(id: &str, parents: &[&str], minute: i64, branch: &str) -> CommitNode {
    CommitNode::new(
        id,
        parents.iter().map(|p| p.to_string()).collect(),
        branch,
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minute),
        format!("schema-{}", id),
    )
}

fn chain(len: usize) -> Vec<CommitNode> {
    let mut commits = vec![commit("n0", &[], 0, "main")];
    for i in 1..len {
        let parent = format!("n{}", i - 1);
        commits.push(commit(&format!("n{}", i), &[parent.as_str()], i as i64, "main"));
    }
    commits
}

#[test]
fn test_ten_commit_chain() {
    let graph = CommitGraph::from_commits(chain(10)).unwrap();
    let roots = vec!["n0".to_string()];
    let compactor = DagCompactor::default();

    let analysis = compactor.analyze_dag(&graph, &roots).unwrap();
    assert_eq!(analysis.compactable_nodes.len(), 8);

    let outcome = compactor.compact_dag(&graph, &roots, false).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.space_saved, analysis.estimated_space_savings);

    let head = outcome.commits.iter().find(|c| c.commit_id == "n9").unwrap();
    assert_eq!(head.schema_hash, "schema-n9");
    for i in 1..9 {
        let original = format!("n{}", i);
        let entry = outcome.index.resolve(&original).unwrap();
        assert_eq!(entry.schema_hash, format!("schema-{}", original));
    }
}

#[test]
fn test_branch_and_merge_points_are_untouched() {
    // main: r - m1 - m2 - m3 - m4 - merge - h
    // dev:        \- d1 - d2 - d3 -/
    let commits = vec![
        commit("r", &[], 0, "main"),
        commit("m1", &["r"], 1, "main"),
        commit("m2", &["m1"], 2, "main"),
        commit("m3", &["m2"], 3, "main"),
        commit("m4", &["m3"], 4, "main"),
        commit("d1", &["m1"], 2, "dev"),
        commit("d2", &["d1"], 3, "dev"),
        commit("d3", &["d2"], 4, "dev"),
        commit("merge", &["m4", "d3"], 5, "main"),
        commit("h", &["merge"], 6, "main"),
    ];
    let graph = CommitGraph::from_commits(commits).unwrap();
    let outcome = DagCompactor::default()
        .compact_dag(&graph, &["r".to_string()], false)
        .unwrap();

    let ids: Vec<&str> = outcome.commits.iter().map(|c| c.commit_id.as_str()).collect();
    for structural in ["r", "m1", "merge", "h"] {
        assert!(ids.contains(&structural), "{} was compacted", structural);
    }
    let merge = outcome.commits.iter().find(|c| c.commit_id == "merge").unwrap();
    assert_eq!(merge.parent_ids.len(), 2);
    assert_eq!(outcome.nodes_removed, 6);

    // The compacted graph is itself a valid DAG
    CommitGraph::from_commits(outcome.commits.clone()).unwrap();
}

#[test]
fn test_invalid_history_is_rejected() {
    let mut commits = chain(3);
    commits[2].parent_ids = vec!["ghost".to_string()];
    assert!(matches!(
        CommitGraph::from_commits(commits),
        Err(DagError::DanglingParent { .. })
    ));
}

#[tokio::test]
async fn test_repeated_compaction_keeps_old_ids_resolvable() {
    let store = MemoryStore::new();
    for c in chain(5) {
        store.insert_commit(c).await.unwrap();
    }
    let compactor = DagCompactor::default();

    let graph = CommitGraph::from_commits(store.list_commits().await.unwrap()).unwrap();
    let first = compactor.compact_dag(&graph, &["n0".to_string()], false).unwrap();
    store.apply_compaction(&first).await.unwrap();

    // History grows again behind the head
    for (i, id) in ["n5", "n6", "n7"].iter().enumerate() {
        let parent = if i == 0 { "n4".to_string() } else { format!("n{}", 4 + i) };
        store
            .insert_commit(commit(id, &[parent.as_str()], 5 + i as i64, "main"))
            .await
            .unwrap();
    }

    let graph = CommitGraph::from_commits(store.list_commits().await.unwrap()).unwrap();
    let second = compactor.compact_dag(&graph, &["n0".to_string()], false).unwrap();
    store.apply_compaction(&second).await.unwrap();

    let resolved = store.resolve_commit("n2").await.unwrap().unwrap();
    assert_eq!(resolved.schema_hash, "schema-n2");
    let live = store.list_commits().await.unwrap();
    assert!(live.iter().any(|c| c.commit_id == resolved.compacted_into));
    assert_eq!(live.len(), 3);
}

#[test]
fn test_dry_run_is_flagged() {
    let graph = CommitGraph::from_commits(chain(6)).unwrap();
    let outcome = DagCompactor::default()
        .compact_dag(&graph, &["n0".to_string()], true)
        .unwrap();
    assert!(outcome.dry_run);
    assert_eq!(outcome.nodes_removed, 4);
}

#[tokio::test]
async fn test_stale_compaction_is_refused_after_history_grows() {
    let store = MemoryStore::new();
    for c in chain(6) {
        store.insert_commit(c).await.unwrap();
    }
    let compactor = DagCompactor::default();
    let graph = CommitGraph::from_commits(store.list_commits().await.unwrap()).unwrap();
    let stale = compactor.compact_dag(&graph, &["n0".to_string()], false).unwrap();
    assert!(stale.removed_commits.contains(&"n3".to_string()));

    // A new branch forks from a commit the outcome is about to remove
    store
        .insert_commit(commit("x", &["n3"], 10, "feature"))
        .await
        .unwrap();

    let err = store.apply_compaction(&stale).await.unwrap_err();
    assert!(err.to_string().contains("'x'"));
    assert_eq!(store.list_commits().await.unwrap().len(), 7);

    // The history is still valid and a fresh cycle keeps the fork point
    let graph = CommitGraph::from_commits(store.list_commits().await.unwrap()).unwrap();
    let fresh = compactor.compact_dag(&graph, &["n0".to_string()], false).unwrap();
    store.apply_compaction(&fresh).await.unwrap();
    let live = store.list_commits().await.unwrap();
    assert!(live.iter().any(|c| c.commit_id == "n3"));
    assert!(CommitGraph::from_commits(live).is_ok());
}

#[tokio::test]
async fn test_insert_onto_compacted_commit_is_rejected() {
    let store = MemoryStore::new();
    for c in chain(6) {
        store.insert_commit(c).await.unwrap();
    }
    let graph = CommitGraph::from_commits(store.list_commits().await.unwrap()).unwrap();
    let outcome = DagCompactor::default()
        .compact_dag(&graph, &["n0".to_string()], false)
        .unwrap();
    store.apply_compaction(&outcome).await.unwrap();

    assert!(store
        .insert_commit(commit("x", &["n3"], 10, "feature"))
        .await
        .is_err());
    assert!(CommitGraph::from_commits(store.list_commits().await.unwrap()).is_ok());
}
