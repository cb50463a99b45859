//! Optimizer behaviour over whole graphs
//!
//! - index-search: first match wins, unusable results skipped, deadline
//! - skip-unless-changed: pattern matching, untracked runs
//! - removal chains and the keep veto
//! - existing-tasks / do-not-optimize overrides
//! - backend failures
//! - surviving-edge invariant (property test)

mod common;

use async_trait::async_trait;
use common::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use taskgraph_core::{
    ChangedFiles, Decision, IndexLookup, IndexedResult, OptimizeParams, Optimizer, PrefetchedIndex,
    SequentialTaskIds, StrategyRegistry, TaskGraph, TaskState,
};

fn optimizer(index: impl IndexLookup + 'static) -> Optimizer {
    Optimizer::new(Arc::new(StrategyRegistry::with_defaults()), Arc::new(index))
        .with_task_ids(Arc::new(SequentialTaskIds::new("NEW")))
}

fn replaced(id: &str) -> Decision {
    Decision::Replaced {
        task_id: id.to_string(),
    }
}

fn tracked(files: &[&str]) -> OptimizeParams {
    OptimizeParams {
        changed_files: ChangedFiles::tracked(strings(files)),
        ..OptimizeParams::default()
    }
}

#[tokio::test]
async fn test_index_search_first_match_wins() {
    let graph = TaskGraph::from_nodes(vec![node("build", &[], index_search(&["p1", "p2"]))]).unwrap();
    let mut index = PrefetchedIndex::new();
    index
        .insert("p1", "FIRST", TaskState::Completed, far_future())
        .insert("p2", "SECOND", TaskState::Completed, far_future());

    let result = optimizer(index)
        .optimize(&graph, &OptimizeParams::default())
        .await
        .unwrap();
    assert_eq!(result.decisions["build"], replaced("FIRST"));
}

#[tokio::test]
async fn test_failed_and_exception_never_selected() {
    let graph = TaskGraph::from_nodes(vec![
        node("a", &[], index_search(&["failed"])),
        node("b", &[], index_search(&["exception"])),
        node("c", &[], index_search(&["failed", "ok"])),
    ])
    .unwrap();
    let mut index = PrefetchedIndex::new();
    index
        .insert("failed", "F", TaskState::Failed, far_future())
        .insert("exception", "E", TaskState::Exception, far_future())
        .insert("ok", "OK", TaskState::Completed, far_future());

    let result = optimizer(index)
        .optimize(&graph, &OptimizeParams::default())
        .await
        .unwrap();
    assert_eq!(result.decisions["a"], Decision::Keep);
    assert_eq!(result.decisions["b"], Decision::Keep);
    assert_eq!(result.decisions["c"], replaced("OK"));
}

#[tokio::test]
async fn test_deadline() {
    let graph = TaskGraph::from_nodes(vec![node("build", &[], index_search(&["p"]))]).unwrap();
    let index = || {
        let mut index = PrefetchedIndex::new();
        index.insert("p", "OLD", TaskState::Completed, day(5));
        index
    };

    let no_deadline = optimizer(index())
        .optimize(&graph, &OptimizeParams::default())
        .await
        .unwrap();
    assert_eq!(no_deadline.decisions["build"], replaced("OLD"));

    let before = OptimizeParams {
        deadline: Some(day(4)),
        ..OptimizeParams::default()
    };
    let result = optimizer(index()).optimize(&graph, &before).await.unwrap();
    assert_eq!(result.decisions["build"], replaced("OLD"));

    let after = OptimizeParams {
        deadline: Some(day(6)),
        ..OptimizeParams::default()
    };
    let result = optimizer(index()).optimize(&graph, &after).await.unwrap();
    assert_eq!(result.decisions["build"], Decision::Keep);
}

#[tokio::test]
async fn test_skip_unless_changed() {
    let graph = TaskGraph::from_nodes(vec![node("lint", &[], skip_unless_changed(&["src/**"]))]).unwrap();

    let docs_only = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["docs/readme.md"]))
        .await
        .unwrap();
    assert_eq!(docs_only.decisions["lint"], Decision::Removed);
    assert!(docs_only.graph.is_empty());

    let src = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["src/main.c"]))
        .await
        .unwrap();
    assert_eq!(src.decisions["lint"], Decision::Keep);
}

#[tokio::test]
async fn test_skip_unless_changed_directory() {
    let graph = TaskGraph::from_nodes(vec![node("decision", &[], skip_unless_changed(&["taskcluster"]))]).unwrap();

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["taskcluster/ci/kind.yml"]))
        .await
        .unwrap();
    assert_eq!(result.decisions["decision"], Decision::Keep);

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["docs/readme.md"]))
        .await
        .unwrap();
    assert_eq!(result.decisions["decision"], Decision::Removed);
}

#[tokio::test]
async fn test_untracked_changes_never_remove() {
    let graph = TaskGraph::from_nodes(vec![node("lint", &[], skip_unless_changed(&["src/**"]))]).unwrap();
    let params = OptimizeParams {
        changed_files: ChangedFiles::untracked(),
        ..OptimizeParams::default()
    };

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &params)
        .await
        .unwrap();
    assert_eq!(result.decisions["lint"], Decision::Keep);
}

#[tokio::test]
async fn test_removal_chain() {
    let graph = TaskGraph::from_nodes(vec![
        node("build", &[], skip_unless_changed(&["src/**"])),
        node("test", &["build"], skip_unless_changed(&["src/**"])),
        node("report", &["test"], skip_unless_changed(&["tests/**"])),
    ])
    .unwrap();

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["docs/readme.md"]))
        .await
        .unwrap();
    assert_eq!(result.removed(), 3);
    assert!(result.graph.is_empty());
}

#[tokio::test]
async fn test_kept_dependent_vetoes_removal() {
    let graph = TaskGraph::from_nodes(vec![
        node("build", &[], skip_unless_changed(&["src/**"])),
        node("test", &["build"], None),
    ])
    .unwrap();

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["docs/readme.md"]))
        .await
        .unwrap();
    assert_eq!(result.decisions["build"], Decision::Keep);
    assert_eq!(result.decisions["test"], Decision::Keep);
    assert_eq!(
        result.dependency_ids("test").unwrap()["build"],
        result.task_id("build").unwrap()
    );
}

#[tokio::test]
async fn test_partial_chain_stops_at_kept_task() {
    let graph = TaskGraph::from_nodes(vec![
        node("build", &[], skip_unless_changed(&["src/**"])),
        node("test", &["build"], skip_unless_changed(&["docs/**"])),
    ])
    .unwrap();

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &tracked(&["docs/readme.md"]))
        .await
        .unwrap();
    assert_eq!(result.decisions["test"], Decision::Keep);
    assert_eq!(result.decisions["build"], Decision::Keep);
}

#[tokio::test]
async fn test_existing_tasks_replace() {
    let graph = TaskGraph::from_nodes(vec![
        node("image", &[], None),
        node("build", &["image"], None),
    ])
    .unwrap();
    let params = OptimizeParams {
        existing_tasks: [("image".to_string(), "PREVIOUS".to_string())]
            .into_iter()
            .collect(),
        ..OptimizeParams::default()
    };

    let result = optimizer(PrefetchedIndex::new())
        .optimize(&graph, &params)
        .await
        .unwrap();
    assert_eq!(result.decisions["image"], replaced("PREVIOUS"));
    assert_eq!(result.dependency_ids("build").unwrap()["image"], "PREVIOUS");
    assert_eq!(result.graph.len(), 1);
}

#[tokio::test]
async fn test_do_not_optimize() {
    let graph = TaskGraph::from_nodes(vec![
        node("lint", &[], skip_unless_changed(&["src/**"])),
        node("build", &[], index_search(&["p"])),
    ])
    .unwrap();
    let mut index = PrefetchedIndex::new();
    index.insert("p", "OLD", TaskState::Completed, far_future());
    let mut params = tracked(&["docs/readme.md"]);
    params.do_not_optimize = ["lint", "build"].iter().map(|s| s.to_string()).collect();

    let result = optimizer(index).optimize(&graph, &params).await.unwrap();
    assert_eq!(result.kept(), 2);
}

struct BrokenIndex;

#[async_trait]
impl IndexLookup for BrokenIndex {
    async fn lookup(&self, _path: &str) -> anyhow::Result<Option<IndexedResult>> {
        anyhow::bail!("connection refused")
    }
}

#[tokio::test]
async fn test_lookup_failure_is_strategy_error() {
    let graph = TaskGraph::from_nodes(vec![node("build", &[], index_search(&["p"]))]).unwrap();

    let err = optimizer(BrokenIndex)
        .optimize(&graph, &OptimizeParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STRATEGY_ERROR");
    assert!(err.to_string().contains("build"));
    assert!(err.to_string().contains("connection refused"));
}

struct CountingIndex {
    inner: PrefetchedIndex,
    calls: AtomicUsize,
}

#[async_trait]
impl IndexLookup for CountingIndex {
    async fn lookup(&self, path: &str) -> anyhow::Result<Option<IndexedResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(path).await
    }
}

#[tokio::test]
async fn test_shared_paths_queried_once() {
    let graph = TaskGraph::from_nodes(vec![
        node("a", &[], index_search(&["shared", "a-only"])),
        node("b", &[], index_search(&["shared"])),
        node("c", &["a"], index_search(&["shared"])),
    ])
    .unwrap();
    let index = Arc::new(CountingIndex {
        inner: PrefetchedIndex::new(),
        calls: AtomicUsize::new(0),
    });
    let optimizer = Optimizer::new(Arc::new(StrategyRegistry::with_defaults()), index.clone());

    let result = optimizer
        .optimize(&graph, &OptimizeParams::default())
        .await
        .unwrap();
    assert_eq!(result.kept(), 3);
    // c depends on a kept task, so it never gets to look anything up
    assert_eq!(index.calls.load(Ordering::SeqCst), 2);
}

/// Random DAG: task `i` may depend on any task `j < i`
fn arb_graph() -> impl Strategy<Value = (Vec<(Vec<usize>, u8)>, Vec<bool>, bool)> {
    (1usize..10)
        .prop_flat_map(|n| {
            (
                (0..n)
                    .map(|i| (prop::collection::vec(0..i.max(1), 0..=i.min(3)), 0u8..3))
                    .collect::<Vec<_>>(),
                prop::collection::vec(any::<bool>(), n),
                any::<bool>(),
            )
        })
}

proptest! {
    #[test]
    fn test_surviving_edges_point_at_survivors((layout, indexed, src_changed) in arb_graph()) {
        let labels: Vec<String> = (0..layout.len()).map(|i| format!("t{}", i)).collect();
        let mut index = PrefetchedIndex::new();
        let nodes: Vec<_> = layout
            .iter()
            .enumerate()
            .map(|(i, (deps, directive))| {
                let deps: BTreeSet<&str> = deps
                    .iter()
                    .filter(|&&d| d < i)
                    .map(|&d| labels[d].as_str())
                    .collect();
                let deps: Vec<&str> = deps.into_iter().collect();
                let path = format!("index.{}", labels[i]);
                if indexed[i] {
                    index.insert(path.clone(), format!("OLD-{}", i), TaskState::Completed, far_future());
                }
                let optimization = match directive {
                    0 => None,
                    1 => index_search(&[path.as_str()]),
                    _ => skip_unless_changed(&["src/**"]),
                };
                node(&labels[i], &deps, optimization)
            })
            .collect();
        let graph = TaskGraph::from_nodes(nodes).unwrap();
        let files = if src_changed { ["src/lib.rs"] } else { ["docs/index.md"] };

        let result = futures::executor::block_on(
            optimizer(index).optimize(&graph, &tracked(&files)),
        )
        .unwrap();

        prop_assert_eq!(result.decisions.len(), graph.len());
        let survivors: BTreeSet<&String> = result.graph.labels().collect();
        for edge in result.graph.graph().edges() {
            prop_assert!(survivors.contains(&edge.from));
            prop_assert!(survivors.contains(&edge.to));
        }
        for label in &survivors {
            prop_assert_eq!(&result.decisions[label.as_str()], &Decision::Keep);
            let original = graph.get(label).unwrap();
            let ids = result.dependency_ids(label).unwrap();
            for (name, dependency) in &original.dependencies {
                match &result.decisions[dependency] {
                    Decision::Removed => prop_assert!(false, "{} kept but {} removed", label, dependency),
                    Decision::Replaced { task_id } => prop_assert_eq!(&ids[name.as_str()], task_id),
                    Decision::Keep => prop_assert_eq!(Some(ids[name.as_str()].as_str()), result.task_id(dependency)),
                }
            }
        }
    }
}
