use crate::error::{Result, TaskgraphError};
use crate::graph::{Edge, Graph};
use crate::job::TaskNode;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Task nodes keyed by label, plus the dependency graph between them.
///
/// Dependencies on tasks that were replaced during optimization are kept as
/// concrete task ids, per dependent, outside the label graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    tasks: BTreeMap<String, TaskNode>,
    graph: Graph,
    external: BTreeMap<String, BTreeMap<String, String>>,
}

impl TaskGraph {
    /// Assemble from pipeline output. Labels must be unique and every
    /// declared dependency must name a task in the set.
    pub fn from_nodes(nodes: Vec<TaskNode>) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for node in nodes {
            if tasks.contains_key(&node.label) {
                return Err(TaskgraphError::graph(
                    format!("duplicate task label '{}'", node.label),
                    vec![node.label.clone()],
                ));
            }
            tasks.insert(node.label.clone(), node);
        }

        let labels: BTreeSet<String> = tasks.keys().cloned().collect();
        let edges: BTreeSet<Edge> = tasks
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |(name, target)| Edge::new(&node.label, target, name))
            })
            .collect();

        let graph = Graph::new(labels, edges)?;
        debug!(
            "Built task graph with {} tasks and {} edges",
            graph.len(),
            graph.edges().len()
        );

        Ok(Self {
            tasks,
            graph,
            external: BTreeMap::new(),
        })
    }

    pub fn get(&self, label: &str) -> Option<&TaskNode> {
        self.tasks.get(label)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.tasks.values()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }

    /// Tasks in dependency order: a task comes after everything it depends on
    pub fn iter_postorder(&self) -> impl Iterator<Item = &TaskNode> + '_ {
        self.graph
            .visit_postorder()
            .into_iter()
            .filter_map(move |label| self.tasks.get(&label))
    }

    /// Dependency name → label, for dependencies still in the graph
    pub fn task_dependencies(&self, label: &str) -> BTreeMap<String, String> {
        self.graph
            .edges()
            .iter()
            .filter(|e| e.from == label)
            .map(|e| (e.name.clone(), e.to.clone()))
            .collect()
    }

    /// Dependency name → task id, for dependencies replaced by existing tasks
    pub fn external_dependencies(&self, label: &str) -> BTreeMap<String, String> {
        self.external.get(label).cloned().unwrap_or_default()
    }

    fn take(&mut self, label: &str) -> Result<TaskNode> {
        let node = self.tasks.remove(label).ok_or_else(|| {
            TaskgraphError::graph(format!("no task labelled '{}'", label), vec![label.to_string()])
        })?;
        self.external.remove(label);
        Ok(node)
    }

    /// Delete a task. Dependents lose their edge to it; the dependency is
    /// treated as satisfied.
    pub(crate) fn remove_task(&mut self, label: &str) -> Result<TaskNode> {
        let node = self.take(label)?;
        self.graph.remove_node(label);
        Ok(node)
    }

    /// Swap a task for an existing one. Dependents keep the dependency, now
    /// pointing at `task_id`.
    pub(crate) fn replace_task(&mut self, label: &str, task_id: &str) -> Result<TaskNode> {
        let dependents: Vec<Edge> = self
            .graph
            .edges()
            .iter()
            .filter(|e| e.to == label)
            .cloned()
            .collect();

        let node = self.take(label)?;
        for edge in dependents {
            self.external
                .entry(edge.from)
                .or_default()
                .insert(edge.name, task_id.to_string());
        }
        self.graph.remove_node(label);
        Ok(node)
    }

    /// The graph restricted to `labels` and their transitive dependencies
    pub fn subgraph(&self, labels: &BTreeSet<String>) -> Result<TaskGraph> {
        let graph = self.graph.transitive_closure(labels)?;
        let tasks = graph
            .nodes()
            .iter()
            .filter_map(|l| self.tasks.get(l).map(|t| (l.clone(), t.clone())))
            .collect();
        let external = self
            .external
            .iter()
            .filter(|(l, _)| graph.contains(l))
            .map(|(l, deps)| (l.clone(), deps.clone()))
            .collect();
        Ok(TaskGraph {
            tasks,
            graph,
            external,
        })
    }

    /// JSON form: a mapping from label to the serialized task node
    pub fn to_json(&self) -> Result<Value> {
        let mut out = Map::new();
        for (label, node) in &self.tasks {
            out.insert(label.clone(), serde_json::to_value(node)?);
        }
        Ok(Value::Object(out))
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let entries = match value {
            Value::Object(entries) => entries,
            other => {
                return Err(TaskgraphError::config(format!(
                    "task graph JSON must be a mapping, got {}",
                    other
                )))
            }
        };

        let mut nodes = Vec::with_capacity(entries.len());
        for (label, mut entry) in entries {
            if let Value::Object(fields) = &mut entry {
                fields
                    .entry("label")
                    .or_insert_with(|| Value::String(label.clone()));
            }
            let node: TaskNode = serde_json::from_value(entry)?;
            if node.label != label {
                return Err(TaskgraphError::graph(
                    format!("entry '{}' carries label '{}'", label, node.label),
                    vec![label],
                ));
            }
            nodes.push(node);
        }
        Self::from_nodes(nodes)
    }
}
