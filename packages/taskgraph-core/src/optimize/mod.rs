//! Optimization: decide per task whether to keep, replace or remove it
//!
//! Two passes over the graph:
//!
//! 1. Removal, dependents first. A task is removed only once every task
//!    depending on it has been removed, so no surviving task loses a real
//!    prerequisite.
//! 2. Replacement, one topological layer at a time. A task is only
//!    considered once all of its dependencies are replaced or removed;
//!    index paths for the whole layer are looked up concurrently first.
//!
//! Everything left is kept and gets a fresh task id.

pub mod lookup;
pub mod strategies;

use crate::config::Parameters;
use crate::error::{Result, TaskgraphError};
use crate::job::TaskNode;
use crate::taskgraph::TaskGraph;
use chrono::{DateTime, Utc};
use lookup::{IndexLookup, LookupCache};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strategies::{StrategyContext, StrategyRegistry};
use tracing::{debug, info};

/// Files changed by the push being built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangedFiles {
    pub files: Vec<String>,
    /// False when the run has no meaningful change information (cron,
    /// manual triggers); nothing is removed for lack of changes then
    pub tracked: bool,
}

impl ChangedFiles {
    pub fn tracked(files: Vec<String>) -> Self {
        Self {
            files,
            tracked: true,
        }
    }

    pub fn untracked() -> Self {
        Self::default()
    }
}

/// Optimizer inputs supplied per run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OptimizeParams {
    /// Indexed results must expire strictly after this instant
    pub deadline: Option<DateTime<Utc>>,
    pub changed_files: ChangedFiles,
    /// Labels that are always kept
    pub do_not_optimize: BTreeSet<String>,
    /// Label → task id of an existing task to use instead
    pub existing_tasks: BTreeMap<String, String>,
    pub params: Parameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "decision")]
pub enum Decision {
    Keep,
    Replaced { task_id: String },
    Removed,
}

/// Hands out ids for kept tasks
pub trait TaskIdSource: Send + Sync {
    fn next_id(&self, label: &str) -> String;
}

#[derive(Debug, Default)]
pub struct RandomTaskIds;

impl TaskIdSource for RandomTaskIds {
    fn next_id(&self, _label: &str) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `{prefix}0`, `{prefix}1`, ... in assignment order
#[derive(Debug)]
pub struct SequentialTaskIds {
    prefix: String,
    counter: AtomicUsize,
}

impl SequentialTaskIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl TaskIdSource for SequentialTaskIds {
    fn next_id(&self, _label: &str) -> String {
        format!("{}{}", self.prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

/// The surviving tasks plus the decision taken for every input task
#[derive(Debug, Clone)]
pub struct OptimizedGraph {
    pub graph: TaskGraph,
    pub decisions: BTreeMap<String, Decision>,
    /// Final id of every kept or replaced task
    pub label_to_taskid: BTreeMap<String, String>,
}

impl OptimizedGraph {
    pub fn task_id(&self, label: &str) -> Option<&str> {
        self.label_to_taskid.get(label).map(String::as_str)
    }

    /// Dependency name → final task id for a surviving task
    pub fn dependency_ids(&self, label: &str) -> Result<BTreeMap<String, String>> {
        let mut ids = self.graph.external_dependencies(label);
        for (name, dependency) in self.graph.task_dependencies(label) {
            let task_id = self.label_to_taskid.get(&dependency).ok_or_else(|| {
                TaskgraphError::graph(
                    format!("'{}' depends on '{}', which has no task id", label, dependency),
                    vec![label.to_string(), dependency.clone()],
                )
            })?;
            ids.insert(name, task_id.clone());
        }
        Ok(ids)
    }

    fn count(&self, pred: impl Fn(&Decision) -> bool) -> usize {
        self.decisions.values().filter(|d| pred(d)).count()
    }

    pub fn kept(&self) -> usize {
        self.count(|d| matches!(d, Decision::Keep))
    }

    pub fn replaced(&self) -> usize {
        self.count(|d| matches!(d, Decision::Replaced { .. }))
    }

    pub fn removed(&self) -> usize {
        self.count(|d| matches!(d, Decision::Removed))
    }
}

/// A replacement candidate with what its strategy gets to see
struct Candidate<'g> {
    task: &'g TaskNode,
    dependency_ids: BTreeMap<String, String>,
    removed_dependencies: BTreeSet<String>,
}

pub struct Optimizer {
    registry: Arc<StrategyRegistry>,
    index: Arc<dyn IndexLookup>,
    ids: Arc<dyn TaskIdSource>,
}

impl Optimizer {
    pub fn new(registry: Arc<StrategyRegistry>, index: Arc<dyn IndexLookup>) -> Self {
        Self {
            registry,
            index,
            ids: Arc::new(RandomTaskIds),
        }
    }

    pub fn with_task_ids(mut self, ids: Arc<dyn TaskIdSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub async fn optimize(&self, input: &TaskGraph, params: &OptimizeParams) -> Result<OptimizedGraph> {
        for task in input.tasks() {
            self.registry.check_task(task)?;
        }

        let lookups = LookupCache::new();
        let removed = self.removal_pass(input, params, &lookups)?;
        let replaced = self
            .replacement_pass(input, params, &lookups, &removed)
            .await?;

        let mut decisions = BTreeMap::new();
        let mut label_to_taskid = BTreeMap::new();
        for label in input.graph().visit_postorder() {
            let decision = if removed.contains(&label) {
                Decision::Removed
            } else if let Some(task_id) = replaced.get(&label) {
                label_to_taskid.insert(label.clone(), task_id.clone());
                Decision::Replaced {
                    task_id: task_id.clone(),
                }
            } else {
                label_to_taskid.insert(label.clone(), self.ids.next_id(&label));
                Decision::Keep
            };
            decisions.insert(label, decision);
        }

        let mut graph = input.clone();
        for label in &removed {
            graph.remove_task(label)?;
        }
        for (label, task_id) in &replaced {
            graph.replace_task(label, task_id)?;
        }

        let optimized = OptimizedGraph {
            graph,
            decisions,
            label_to_taskid,
        };
        info!(
            "Optimized {} tasks: {} kept, {} replaced, {} removed",
            input.len(),
            optimized.kept(),
            optimized.replaced(),
            optimized.removed()
        );
        Ok(optimized)
    }

    fn strategy_error(task: &TaskNode, source: anyhow::Error) -> TaskgraphError {
        TaskgraphError::Strategy {
            label: task.label.clone(),
            strategy: task.directive_tag().to_string(),
            source,
        }
    }

    fn removal_pass(
        &self,
        input: &TaskGraph,
        params: &OptimizeParams,
        lookups: &LookupCache,
    ) -> Result<BTreeSet<String>> {
        let dependents = input.graph().reverse_links_dict();
        let no_ids = BTreeMap::new();
        let none_removed = BTreeSet::new();
        let ctx = StrategyContext {
            params,
            registry: &self.registry,
            index: self.index.as_ref(),
            lookups,
            dependency_ids: &no_ids,
            removed_dependencies: &none_removed,
        };

        let mut removed = BTreeSet::new();
        for label in input.graph().visit_preorder() {
            if params.do_not_optimize.contains(&label) || params.existing_tasks.contains_key(&label) {
                continue;
            }
            let all_dependents_removed = dependents
                .get(&label)
                .map_or(true, |deps| deps.iter().all(|d| removed.contains(d)));
            if !all_dependents_removed {
                continue;
            }

            let task = match input.get(&label) {
                Some(task) => task,
                None => continue,
            };
            let directive = match &task.optimization {
                Some(directive) => directive,
                None => continue,
            };
            let strategy = self.registry.get_or_config_err(directive.tag())?;
            if strategy
                .should_remove(task, directive, &ctx)
                .map_err(|e| Self::strategy_error(task, e))?
            {
                debug!("Removing {} ({})", label, directive.tag());
                removed.insert(label);
            }
        }
        Ok(removed)
    }

    async fn replacement_pass(
        &self,
        input: &TaskGraph,
        params: &OptimizeParams,
        lookups: &LookupCache,
        removed: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        let named_links = input.graph().named_links_dict();
        let mut replaced: BTreeMap<String, String> = BTreeMap::new();

        for layer in input.graph().layers() {
            let mut candidates = Vec::new();
            for label in layer {
                if removed.contains(&label) {
                    continue;
                }
                if let Some(task_id) = params.existing_tasks.get(&label) {
                    debug!("Using existing task {} for {}", task_id, label);
                    replaced.insert(label, task_id.clone());
                    continue;
                }
                if params.do_not_optimize.contains(&label) {
                    continue;
                }
                let task = match input.get(&label) {
                    Some(task) if task.optimization.is_some() => task,
                    _ => continue,
                };

                let mut dependency_ids = BTreeMap::new();
                let mut removed_dependencies = BTreeSet::new();
                let mut finalized = true;
                for (name, dependency) in named_links.get(&label).into_iter().flatten() {
                    if let Some(task_id) = replaced.get(dependency) {
                        dependency_ids.insert(name.clone(), task_id.clone());
                    } else if removed.contains(dependency) {
                        removed_dependencies.insert(name.clone());
                    } else {
                        finalized = false;
                        break;
                    }
                }
                if finalized {
                    candidates.push(Candidate {
                        task,
                        dependency_ids,
                        removed_dependencies,
                    });
                }
            }

            let contexts: Vec<StrategyContext<'_>> = candidates
                .iter()
                .map(|c| StrategyContext {
                    params,
                    registry: &self.registry,
                    index: self.index.as_ref(),
                    lookups,
                    dependency_ids: &c.dependency_ids,
                    removed_dependencies: &c.removed_dependencies,
                })
                .collect();

            let mut paths = BTreeSet::new();
            for (candidate, ctx) in candidates.iter().zip(&contexts) {
                if let Some(directive) = &candidate.task.optimization {
                    let strategy = self.registry.get_or_config_err(directive.tag())?;
                    paths.extend(strategy.lookup_paths(directive, ctx));
                }
            }
            lookups.prefetch(self.index.as_ref(), paths).await;

            for (candidate, ctx) in candidates.iter().zip(&contexts) {
                let task = candidate.task;
                let directive = match &task.optimization {
                    Some(directive) => directive,
                    None => continue,
                };
                let strategy = self.registry.get_or_config_err(directive.tag())?;
                let found = strategy
                    .should_replace(task, directive, ctx)
                    .await
                    .map_err(|e| Self::strategy_error(task, e))?;
                if let Some(task_id) = found {
                    debug!("Replacing {} with {}", task.label, task_id);
                    replaced.insert(task.label.clone(), task_id);
                }
            }
        }
        Ok(replaced)
    }
}
