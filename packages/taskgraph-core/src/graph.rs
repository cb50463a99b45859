//! Label graph with named edges
//!
//! An edge `(from, to, name)` means `from` depends on `to` under the logical
//! dependency name `name`. "Postorder" visits dependencies before the tasks
//! that depend on them; "preorder" is the reverse.

use crate::error::{Result, TaskgraphError};
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The dependent task
    pub from: String,
    /// The task depended upon
    pub to: String,
    /// Logical dependency name
    pub name: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            name: name.into(),
        }
    }
}

/// Immutable set of labels and named dependency edges.
///
/// Construction checks that every edge endpoint is a node and that the
/// dependency relation is acyclic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<Edge>,
}

impl Graph {
    pub fn new(nodes: BTreeSet<String>, edges: BTreeSet<Edge>) -> Result<Self> {
        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !nodes.contains(endpoint) {
                    return Err(TaskgraphError::graph(
                        format!("unknown label '{}' in dependency '{}'", endpoint, edge.name),
                        vec![edge.from.clone(), edge.to.clone()],
                    ));
                }
            }
        }

        let graph = Self { nodes, edges };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    pub fn contains(&self, label: &str) -> bool {
        self.nodes.contains(label)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// petgraph view with edges pointing from dependency to dependent
    fn as_digraph(&self) -> DiGraphMap<&str, ()> {
        let mut g = DiGraphMap::new();
        for node in &self.nodes {
            g.add_node(node.as_str());
        }
        for edge in &self.edges {
            g.add_edge(edge.to.as_str(), edge.from.as_str(), ());
        }
        g
    }

    fn check_acyclic(&self) -> Result<()> {
        let g = self.as_digraph();
        let start = match toposort(&g, None) {
            Ok(_) => return Ok(()),
            Err(cycle) => cycle.node_id(),
        };

        let component: BTreeSet<&str> = kosaraju_scc(&g)
            .into_iter()
            .find(|scc| scc.contains(&start))
            .unwrap_or_default()
            .into_iter()
            .collect();

        Err(TaskgraphError::graph(
            "dependency cycle detected",
            cycle_chain(&g, start, &component),
        ))
    }

    /// The subgraph of `labels` and everything they (transitively) depend
    /// on, keeping every edge between retained nodes
    pub fn transitive_closure(&self, labels: &BTreeSet<String>) -> Result<Graph> {
        if let Some(missing) = labels.iter().find(|l| !self.nodes.contains(*l)) {
            return Err(TaskgraphError::graph(
                format!("unknown label '{}'", missing),
                vec![missing.clone()],
            ));
        }

        let links = self.links_dict();
        let mut nodes = BTreeSet::new();
        let mut queue: VecDeque<&String> = labels.iter().collect();
        while let Some(label) = queue.pop_front() {
            if !nodes.insert(label.clone()) {
                continue;
            }
            if let Some(deps) = links.get(label) {
                queue.extend(deps.iter());
            }
        }

        let edges = self
            .edges
            .iter()
            .filter(|e| nodes.contains(&e.from) && nodes.contains(&e.to))
            .cloned()
            .collect();

        Ok(Graph { nodes, edges })
    }

    /// Drop `label` and every edge touching it. Removing a node can never
    /// introduce a cycle, so no re-check is needed.
    pub(crate) fn remove_node(&mut self, label: &str) -> bool {
        if !self.nodes.remove(label) {
            return false;
        }
        self.edges.retain(|e| e.from != label && e.to != label);
        true
    }

    /// Topological generations, dependencies first. Every node in a layer
    /// depends only on nodes in earlier layers; each layer is sorted.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let links = self.links_dict();
        let reverse = self.reverse_links_dict();

        let mut remaining: HashMap<&str, usize> = links
            .iter()
            .map(|(label, deps)| (label.as_str(), deps.len()))
            .collect();
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&label, _)| label)
            .collect();

        let mut layers = Vec::new();
        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();
            for label in &ready {
                remaining.remove(label);
                for dependent in reverse.get(*label).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            layers.push(ready.iter().map(|l| l.to_string()).collect());
            ready = next;
        }
        layers
    }

    /// Dependencies before dependents
    pub fn visit_postorder(&self) -> Vec<String> {
        self.layers().into_iter().flatten().collect()
    }

    /// Dependents before dependencies
    pub fn visit_preorder(&self) -> Vec<String> {
        let mut order = self.visit_postorder();
        order.reverse();
        order
    }

    /// label → labels it depends on (every node has an entry)
    pub fn links_dict(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut links: BTreeMap<String, BTreeSet<String>> =
            self.nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for edge in &self.edges {
            links
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.to.clone());
        }
        links
    }

    /// label → (dependency name → label depended upon)
    pub fn named_links_dict(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut links: BTreeMap<String, BTreeMap<String, String>> =
            self.nodes.iter().map(|n| (n.clone(), BTreeMap::new())).collect();
        for edge in &self.edges {
            links
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.name.clone(), edge.to.clone());
        }
        links
    }

    /// label → labels that depend on it (every node has an entry)
    pub fn reverse_links_dict(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut links: BTreeMap<String, BTreeSet<String>> =
            self.nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for edge in &self.edges {
            links
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
        }
        links
    }
}

/// Shortest cycle through `start` inside `component`, listed dependent first
fn cycle_chain(g: &DiGraphMap<&str, ()>, start: &str, component: &BTreeSet<&str>) -> Vec<String> {
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::new();

    for next in g.neighbors(start) {
        if next == start {
            return vec![start.to_string(), start.to_string()];
        }
        if component.contains(next) && !parent.contains_key(next) {
            parent.insert(next, start);
            queue.push_back(next);
        }
    }

    while let Some(node) = queue.pop_front() {
        for next in g.neighbors(node) {
            if next == start {
                let mut chain = vec![start.to_string(), node.to_string()];
                let mut cursor = node;
                while let Some(&prev) = parent.get(cursor) {
                    if prev == start {
                        break;
                    }
                    chain.push(prev.to_string());
                    cursor = prev;
                }
                chain.push(start.to_string());
                return chain;
            }
            if component.contains(next) && !parent.contains_key(next) {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }

    vec![start.to_string()]
}
