//! Sanity checks run over a task graph at named phases
//!
//! Each check sees every task in turn, then the graph as a whole, with a
//! scratch pad that lives for one run of that check.

use crate::config::GraphConfig;
use crate::error::{Result, TaskgraphError};
use crate::job::{TaskNode, WorkerKind};
use crate::taskgraph::TaskGraph;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Phase run on the graph as generated
pub const FULL_GRAPH: &str = "full";
/// Phase run on the graph left after optimization
pub const OPTIMIZED_GRAPH: &str = "optimized";

pub type ScratchPad = BTreeMap<String, Value>;

pub trait Verification: Send + Sync {
    fn name(&self) -> &str;

    fn verify_task(
        &self,
        _task: &TaskNode,
        _graph: &TaskGraph,
        _config: &GraphConfig,
        _scratch: &mut ScratchPad,
    ) -> Result<()> {
        Ok(())
    }

    fn verify_graph(&self, _graph: &TaskGraph, _config: &GraphConfig, _scratch: &mut ScratchPad) -> Result<()> {
        Ok(())
    }
}

fn failure(check: &str, message: String) -> TaskgraphError {
    TaskgraphError::Verification {
        name: check.to_string(),
        message,
    }
}

fn treeherder(task: &TaskNode) -> Option<&Value> {
    task.task.get("extra").and_then(|extra| extra.get("treeherder"))
}

/// No two tasks may share an index route
pub struct UniqueIndexRoutes;

impl Verification for UniqueIndexRoutes {
    fn name(&self) -> &str {
        "unique-index-routes"
    }

    fn verify_task(
        &self,
        task: &TaskNode,
        _graph: &TaskGraph,
        config: &GraphConfig,
        scratch: &mut ScratchPad,
    ) -> Result<()> {
        let prefix = format!("{}.{}.v2", config.index_prefix, config.trust_domain);
        let routes = task
            .task
            .get("routes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);

        for route in routes.filter(|r| r.starts_with(&prefix)) {
            if let Some(other) = scratch.get(route) {
                return Err(failure(
                    self.name(),
                    format!("conflict between {}:{} for route: {}", task.label, other, route),
                ));
            }
            scratch.insert(route.to_string(), Value::String(task.label.clone()));
        }
        Ok(())
    }
}

/// No two tasks may share a treeherder symbol on the same platform
pub struct UniqueTreeherderSymbols;

impl Verification for UniqueTreeherderSymbols {
    fn name(&self) -> &str {
        "unique-treeherder-symbols"
    }

    fn verify_task(
        &self,
        task: &TaskNode,
        _graph: &TaskGraph,
        _config: &GraphConfig,
        scratch: &mut ScratchPad,
    ) -> Result<()> {
        let th = match treeherder(task) {
            Some(th) => th,
            None => return Ok(()),
        };
        let mut collection: Vec<&str> = th
            .get("collection")
            .and_then(Value::as_object)
            .map(|c| c.keys().map(String::as_str).collect())
            .unwrap_or_default();
        collection.sort_unstable();

        let field = |path: &[&str]| {
            path.iter()
                .try_fold(th, |v, k| v.get(*k))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let key = format!(
            "{}/{}/{}/{}",
            collection.join(","),
            field(&["machine", "platform"]),
            field(&["groupSymbol"]),
            field(&["symbol"])
        );

        if let Some(other) = scratch.get(&key) {
            return Err(failure(
                self.name(),
                format!("conflict between `{}`:`{}` for values `{}`", task.label, other, key),
            ));
        }
        scratch.insert(key, Value::String(task.label.clone()));
        Ok(())
    }
}

/// A task may not depend on a task of a higher (less reliable) tier.
/// Tasks without a tier count as the highest tier. Dependencies on
/// `dummy` kinds are not checked.
pub struct DependencyTiers;

impl DependencyTiers {
    fn tier(task: &TaskNode) -> u64 {
        treeherder(task)
            .and_then(|th| th.get("tier"))
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX)
    }

    fn printable(tier: u64) -> String {
        if tier == u64::MAX {
            "unknown".to_string()
        } else {
            tier.to_string()
        }
    }
}

impl Verification for DependencyTiers {
    fn name(&self) -> &str {
        "dependency-tiers"
    }

    fn verify_graph(&self, graph: &TaskGraph, _config: &GraphConfig, _scratch: &mut ScratchPad) -> Result<()> {
        let tiers: HashMap<&str, u64> = graph
            .tasks()
            .map(|t| (t.label.as_str(), Self::tier(t)))
            .collect();

        for task in graph.tasks() {
            let tier = tiers.get(task.label.as_str()).copied().unwrap_or(u64::MAX);
            for dependency in graph.task_dependencies(&task.label).values() {
                if graph.get(dependency).map_or(false, |d| d.kind.contains("dummy")) {
                    continue;
                }
                let dep_tier = tiers.get(dependency.as_str()).copied().unwrap_or(u64::MAX);
                if tier < dep_tier {
                    return Err(failure(
                        self.name(),
                        format!(
                            "{} (tier {}) cannot depend on {} (tier {})",
                            task.label,
                            Self::printable(tier),
                            dependency,
                            Self::printable(dep_tier)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Warn about placeholder tasks that survived optimization
pub struct AlwaysOptimizedSurvivors;

impl Verification for AlwaysOptimizedSurvivors {
    fn name(&self) -> &str {
        "always-optimized-survivors"
    }

    fn verify_task(
        &self,
        task: &TaskNode,
        _graph: &TaskGraph,
        _config: &GraphConfig,
        _scratch: &mut ScratchPad,
    ) -> Result<()> {
        if task.worker.kind() == WorkerKind::AlwaysOptimized {
            warn!("{} uses {} but was not optimized away", task.label, WorkerKind::AlwaysOptimized);
        }
        Ok(())
    }
}

/// Checks grouped by the phase they run at
#[derive(Clone, Default)]
pub struct VerificationSequence {
    phases: BTreeMap<String, Vec<Arc<dyn Verification>>>,
}

impl VerificationSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut seq = Self::new();
        seq.add(FULL_GRAPH, UniqueTreeherderSymbols)
            .add(FULL_GRAPH, UniqueIndexRoutes)
            .add(FULL_GRAPH, DependencyTiers)
            .add(OPTIMIZED_GRAPH, AlwaysOptimizedSurvivors);
        seq
    }

    pub fn add<V: Verification + 'static>(&mut self, phase: &str, verification: V) -> &mut Self {
        self.phases
            .entry(phase.to_string())
            .or_default()
            .push(Arc::new(verification));
        self
    }

    pub fn names(&self, phase: &str) -> Vec<&str> {
        self.phases
            .get(phase)
            .map(|checks| checks.iter().map(|c| c.name()).collect())
            .unwrap_or_default()
    }

    /// Run every check registered for `phase`, stopping at the first failure
    pub fn run(&self, phase: &str, graph: &TaskGraph, config: &GraphConfig) -> Result<()> {
        for check in self.phases.get(phase).into_iter().flatten() {
            let mut scratch = ScratchPad::new();
            for task in graph.tasks() {
                check.verify_task(task, graph, config, &mut scratch)?;
            }
            check.verify_graph(graph, config, &mut scratch)?;
            debug!("Verification {} passed on {} graph", check.name(), phase);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DockerWorker, WorkerSpec};
    use serde_json::json;

    fn task(label: &str, deps: &[&str], task: Value) -> TaskNode {
        TaskNode {
            label: label.to_string(),
            kind: "test".to_string(),
            attributes: BTreeMap::new(),
            dependencies: deps.iter().map(|d| (d.to_string(), d.to_string())).collect(),
            optimization: None,
            worker: WorkerSpec::DockerWorker(DockerWorker {
                docker_image: json!("ubuntu"),
                command: vec![],
                env: BTreeMap::new(),
                max_run_time: 600,
                artifacts: vec![],
            }),
            task,
        }
    }

    fn config() -> GraphConfig {
        GraphConfig::new("gecko", "https://ci.example.net")
    }

    fn tier(symbol: &str, n: u64) -> Value {
        json!({"extra": {"treeherder": {
            "tier": n, "symbol": symbol, "machine": {"platform": "linux64"}
        }}})
    }

    #[test]
    fn test_duplicate_routes() {
        let route = json!({"routes": ["index.gecko.v2.try.latest.firefox.linux64"]});
        let graph = TaskGraph::from_nodes(vec![
            task("a", &[], route.clone()),
            task("b", &[], route),
        ])
        .unwrap();
        let err = VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &graph, &config())
            .unwrap_err();
        assert_eq!(err.code(), "VERIFICATION_ERROR");
        assert!(err.to_string().contains("index.gecko.v2.try.latest.firefox.linux64"));
    }

    #[test]
    fn test_routes_outside_prefix_may_repeat() {
        let route = json!({"routes": ["notify.email.dev@example.com.on-failed"]});
        let graph = TaskGraph::from_nodes(vec![
            task("a", &[], route.clone()),
            task("b", &[], route),
        ])
        .unwrap();
        assert!(VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &graph, &config())
            .is_ok());
    }

    #[test]
    fn test_dependency_tiers() {
        let ok = TaskGraph::from_nodes(vec![task("build", &[], tier("B", 1)), task("test", &["build"], tier("T", 2))])
            .unwrap();
        assert!(VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &ok, &config())
            .is_ok());

        let bad = TaskGraph::from_nodes(vec![task("build", &[], tier("B", 2)), task("test", &["build"], tier("T", 1))])
            .unwrap();
        let err = VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &bad, &config())
            .unwrap_err();
        assert!(err.to_string().contains("test (tier 1) cannot depend on build (tier 2)"));

        let unknown = TaskGraph::from_nodes(vec![task("build", &[], json!({})), task("test", &["build"], tier("T", 3))])
            .unwrap();
        let err = VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &unknown, &config())
            .unwrap_err();
        assert!(err.to_string().contains("tier unknown"));
    }

    #[test]
    fn test_dummy_dependencies_skip_tier_check() {
        let mut placeholder = task("fetch", &[], json!({}));
        placeholder.kind = "dummy-fetch".to_string();
        let graph = TaskGraph::from_nodes(vec![placeholder, task("test", &["fetch"], tier("T", 1))]).unwrap();

        let mut tiers = VerificationSequence::new();
        tiers.add(FULL_GRAPH, DependencyTiers);
        assert!(tiers.run(FULL_GRAPH, &graph, &config()).is_ok());
    }

    #[test]
    fn test_tier_only_blocks_share_a_symbol() {
        let th = json!({"extra": {"treeherder": {"tier": 1}}});
        let graph = TaskGraph::from_nodes(vec![task("a", &[], th.clone()), task("b", &[], th)]).unwrap();
        let err = VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &graph, &config())
            .unwrap_err();
        assert!(err.to_string().contains("unique-treeherder-symbols"));
    }

    #[test]
    fn test_duplicate_symbols() {
        let th = json!({"extra": {"treeherder": {
            "symbol": "B", "machine": {"platform": "linux64"}, "collection": {"opt": true}
        }}});
        let graph = TaskGraph::from_nodes(vec![task("a", &[], th.clone()), task("b", &[], th)]).unwrap();
        assert!(VerificationSequence::with_defaults()
            .run(FULL_GRAPH, &graph, &config())
            .is_err());
    }

    #[test]
    fn test_unknown_phase_is_noop() {
        let graph = TaskGraph::from_nodes(vec![task("a", &[], json!({}))]).unwrap();
        assert!(VerificationSequence::with_defaults()
            .run("target", &graph, &config())
            .is_ok());
        assert_eq!(
            VerificationSequence::with_defaults().names(FULL_GRAPH),
            vec!["unique-treeherder-symbols", "unique-index-routes", "dependency-tiers"]
        );
    }
}
