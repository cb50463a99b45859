//! End-to-end graph generation
//!
//! kinds → transforms → full graph → target graph → optimized graph →
//! resolved, submittable tasks. Every phase either completes for the whole
//! graph or fails the run.

use crate::config::{GraphConfig, RunParameters};
use crate::error::{Result, TaskgraphError};
use crate::graph::{Edge, Graph};
use crate::job::{Job, TaskNode, WorkerSpec};
use crate::optimize::lookup::IndexLookup;
use crate::optimize::strategies::StrategyRegistry;
use crate::optimize::{OptimizedGraph, Optimizer};
use crate::parameterization::ReferenceResolver;
use crate::payload::{PayloadBuilders, PayloadContext, SubmittableTask};
use crate::pipeline::{TransformConfig, TransformSequence};
use crate::stages::default_transforms;
use crate::taskgraph::TaskGraph;
use crate::verify::{VerificationSequence, FULL_GRAPH, OPTIMIZED_GRAPH};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Phase run on the graph restricted to target tasks
pub const TARGET_GRAPH: &str = "target";

/// Recursively merge `overlay` onto `base`; mappings merge, anything else
/// in `overlay` wins
fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut out = base.clone();
            for (key, value) in overlay {
                let merged = match out.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// A group of jobs sharing one transform sequence
#[derive(Debug, Clone)]
pub struct Kind {
    pub name: String,
    pub path: PathBuf,
    /// Kind configuration, minus the jobs themselves
    pub config: Map<String, Value>,
    /// Kinds whose tasks this kind may depend on
    pub kind_dependencies: Vec<String>,
    pub jobs: Vec<Job>,
    pub transforms: TransformSequence,
}

impl Kind {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            name: name.into(),
            path: PathBuf::new(),
            config: Map::new(),
            kind_dependencies: Vec::new(),
            jobs,
            transforms: default_transforms(),
        }
    }

    pub fn with_transforms(mut self, transforms: TransformSequence) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_kind_dependencies<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kind_dependencies = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a `kind.yml` document.
    ///
    /// `jobs` maps job names to descriptions; each job is merged over
    /// `job-defaults` and gets its `name` unless it has one.
    /// `kind-dependencies` lists kinds to generate first. Everything else is
    /// kept as the kind's configuration.
    pub fn from_yaml_str(name: impl Into<String>, path: impl Into<PathBuf>, content: &str) -> Result<Self> {
        let name = name.into();
        let mut config: Map<String, Value> = serde_yaml::from_str(content)?;

        let defaults = config.remove("job-defaults").unwrap_or_else(|| json!({}));
        let kind_dependencies = match config.remove("kind-dependencies") {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                TaskgraphError::config(format!("kind {}: bad kind-dependencies: {}", name, e))
            })?,
            None => Vec::new(),
        };
        let jobs = match config.remove("jobs") {
            Some(Value::Object(jobs)) => jobs,
            Some(other) => {
                return Err(TaskgraphError::config(format!(
                    "kind {}: jobs must be a mapping, got {}",
                    name, other
                )))
            }
            None => Map::new(),
        };

        let jobs = jobs
            .into_iter()
            .map(|(job_name, description)| {
                let mut job = Job::from_value(merge(&defaults, &description))?;
                if job.name().is_none() {
                    job.insert("name", Value::String(job_name));
                }
                Ok(job)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            path: path.into(),
            config,
            kind_dependencies,
            jobs,
            transforms: default_transforms(),
        })
    }

    /// Load `<dir>/kind.yml`; the kind is named after the directory
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TaskgraphError::config(format!("{} has no kind name", dir.display())))?;
        let content = std::fs::read_to_string(dir.join("kind.yml"))?;
        Self::from_yaml_str(name, dir, &content)
    }
}

/// Decides which tasks of the full graph a run wants
pub type TargetFilter = dyn Fn(&TaskNode, &RunParameters) -> bool + Send + Sync;

/// Tasks whose `run_on_projects` attribute contains `all` or the project
pub fn default_target_filter(task: &TaskNode, params: &RunParameters) -> bool {
    let projects = match task.attributes.get("run_on_projects").and_then(Value::as_array) {
        Some(projects) => projects,
        None => return true,
    };
    projects.iter().filter_map(Value::as_str).any(|p| {
        p == "all" || Some(p) == params.params().project()
    })
}

/// Everything a generation run produced
#[derive(Debug, Clone)]
pub struct GeneratedGraph {
    pub full: TaskGraph,
    pub target: TaskGraph,
    pub optimized: OptimizedGraph,
    /// Submittable tasks keyed by task id
    pub tasks: BTreeMap<String, SubmittableTask>,
}

impl GeneratedGraph {
    pub fn task_by_label(&self, label: &str) -> Option<&SubmittableTask> {
        self.optimized
            .task_id(label)
            .and_then(|task_id| self.tasks.get(task_id))
    }

    /// Task id → task definition, the form handed to the submission layer
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.tasks
                .iter()
                .map(|(task_id, task)| (task_id.clone(), task.task.clone()))
                .collect(),
        )
    }
}

pub struct TaskGraphGenerator {
    graph_config: GraphConfig,
    params: RunParameters,
    kinds: Vec<Kind>,
    optimizer: Optimizer,
    verifications: VerificationSequence,
    payloads: PayloadBuilders,
    target_filter: Arc<TargetFilter>,
}

impl TaskGraphGenerator {
    pub fn new(graph_config: GraphConfig, params: RunParameters, index: Arc<dyn IndexLookup>) -> Self {
        Self {
            graph_config,
            params,
            kinds: Vec::new(),
            optimizer: Optimizer::new(Arc::new(StrategyRegistry::with_defaults()), index),
            verifications: VerificationSequence::with_defaults(),
            payloads: PayloadBuilders::with_defaults(),
            target_filter: Arc::new(default_target_filter),
        }
    }

    pub fn add_kind(&mut self, kind: Kind) -> &mut Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_verifications(mut self, verifications: VerificationSequence) -> Self {
        self.verifications = verifications;
        self
    }

    pub fn with_payload_builders(mut self, payloads: PayloadBuilders) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn with_target_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TaskNode, &RunParameters) -> bool + Send + Sync + 'static,
    {
        self.target_filter = Arc::new(filter);
        self
    }

    /// Kinds ordered so that each comes after the kinds it depends on
    fn ordered_kinds(&self) -> Result<Vec<&Kind>> {
        let by_name: BTreeMap<&str, &Kind> = self.kinds.iter().map(|k| (k.name.as_str(), k)).collect();
        if by_name.len() != self.kinds.len() {
            return Err(TaskgraphError::config("duplicate kind names"));
        }

        let nodes: BTreeSet<String> = by_name.keys().map(|k| k.to_string()).collect();
        let edges: BTreeSet<Edge> = self
            .kinds
            .iter()
            .flat_map(|k| {
                k.kind_dependencies
                    .iter()
                    .map(move |dep| Edge::new(&k.name, dep, dep))
            })
            .collect();

        Ok(Graph::new(nodes, edges)?
            .visit_postorder()
            .iter()
            .filter_map(|name| by_name.get(name.as_str()).copied())
            .collect())
    }

    /// Run every kind through its transforms and assemble the full graph
    pub fn full_task_graph(&self) -> Result<TaskGraph> {
        let mut nodes = Vec::new();
        for kind in self.ordered_kinds()? {
            let config = Arc::new(TransformConfig {
                kind: kind.name.clone(),
                path: kind.path.clone(),
                config: kind.config.clone(),
                params: self.params.params().clone(),
                graph_config: self.graph_config.clone(),
            });
            let jobs = kind.transforms.run(config, kind.jobs.clone())?;
            for job in jobs {
                nodes.push(TaskNode::from_job(job)?);
            }
        }

        let full = TaskGraph::from_nodes(nodes)?;
        self.verifications.run(FULL_GRAPH, &full, &self.graph_config)?;
        info!("Full task graph: {} tasks", full.len());
        Ok(full)
    }

    /// The full graph restricted to target tasks and their dependencies
    pub fn target_task_graph(&self, full: &TaskGraph) -> Result<TaskGraph> {
        let targets: BTreeSet<String> = full
            .tasks()
            .filter(|t| (self.target_filter)(t, &self.params))
            .map(|t| t.label.clone())
            .collect();
        let target = full.subgraph(&targets)?;
        self.verifications.run(TARGET_GRAPH, &target, &self.graph_config)?;
        info!(
            "Target task graph: {} tasks ({} targeted)",
            target.len(),
            targets.len()
        );
        Ok(target)
    }

    fn submittable(
        &self,
        resolver: &ReferenceResolver,
        optimized: &OptimizedGraph,
        task: &TaskNode,
    ) -> Result<SubmittableTask> {
        let label = task.label.as_str();
        let task_id = optimized.task_id(label).ok_or_else(|| {
            TaskgraphError::graph(format!("surviving task '{}' has no task id", label), vec![label.to_string()])
        })?;
        let dependencies = optimized.dependency_ids(label)?;

        let task_def = resolver.resolve(label, task_id, &task.task, &dependencies)?;
        let worker = resolver.resolve(label, task_id, &serde_json::to_value(&task.worker)?, &dependencies)?;
        let worker: WorkerSpec = serde_json::from_value(worker).map_err(|e| TaskgraphError::Payload {
            label: label.to_string(),
            message: format!("resolved worker no longer valid: {}", e),
        })?;

        let ctx = PayloadContext {
            label,
            task_id,
            dependencies: &dependencies,
            task_def: &task_def,
        };
        let mut task_def = self.payloads.build(&worker, &ctx)?;

        let dependency_ids: BTreeSet<&String> = dependencies.values().collect();
        if let Value::Object(def) = &mut task_def {
            def.insert("dependencies".to_string(), json!(dependency_ids));
        }

        debug!("Resolved {} as {}", label, task_id);
        Ok(SubmittableTask {
            task_id: task_id.to_string(),
            label: label.to_string(),
            task: task_def,
            dependencies,
            attributes: task.attributes.clone(),
        })
    }

    /// Generate, optimize and resolve the whole graph
    pub async fn generate(&self) -> Result<GeneratedGraph> {
        let start = Instant::now();

        let full = self.full_task_graph()?;
        let target = self.target_task_graph(&full)?;

        let optimized = self.optimizer.optimize(&target, &self.params.optimize).await?;
        self.verifications
            .run(OPTIMIZED_GRAPH, &optimized.graph, &self.graph_config)?;

        let resolver = ReferenceResolver::new(self.params.generated_at, &self.graph_config.root_url);
        let mut tasks = BTreeMap::new();
        for task in optimized.graph.iter_postorder() {
            let submittable = self.submittable(&resolver, &optimized, task)?;
            tasks.insert(submittable.task_id.clone(), submittable);
        }

        info!(
            "Generated {} submittable tasks from {} in {}ms",
            tasks.len(),
            full.len(),
            start.elapsed().as_millis()
        );
        Ok(GeneratedGraph {
            full,
            target,
            optimized,
            tasks,
        })
    }
}
