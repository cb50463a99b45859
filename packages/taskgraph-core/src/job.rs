use crate::error::{Result, TaskgraphError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Placeholder label used in messages for jobs that have not been labelled yet
pub const UNLABELLED: &str = "?no-label?";

/// A job description as it flows through the transform pipeline.
///
/// Jobs are free-form mappings until the final stage turns them into
/// [`TaskNode`]s; the validation stages are what give them shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Job(Map<String, Value>);

impl Job {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a job from a JSON value, which must be a mapping
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TaskgraphError::config(format!(
                "job description must be a mapping, got {}",
                other
            ))),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.0.get("label").and_then(Value::as_str)
    }

    /// Label for error messages, even before one has been assigned
    pub fn display_label(&self) -> String {
        self.label().unwrap_or(UNLABELLED).to_string()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a dotted path such as `worker.max-run-time`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Replace the value at a dotted path. Returns false if an intermediate
    /// segment is missing or is not a mapping.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return false,
        };

        let mut current = &mut self.0;
        for part in parents {
            current = match current.get_mut(*part).and_then(Value::as_object_mut) {
                Some(map) => map,
                None => return false,
            };
        }
        current.insert((*last).to_string(), value);
        true
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Job {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Optimization directive attached to a task.
///
/// Serialized in the external-tag form used by job definitions, e.g.
/// `{"index-search": ["a.b.c"]}`. A task without a directive (`null`) is
/// never optimized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Optimization {
    /// Replace the task with the first usable indexed result, in path order
    IndexSearch(Vec<String>),
    /// Remove the task unless a changed file matches one of the patterns
    SkipUnlessChanged(Vec<String>),
    /// Remove if any sub-directive removes; replace with the first replacement
    AnyOf(Vec<Optimization>),
}

impl Optimization {
    pub fn tag(&self) -> &'static str {
        match self {
            Optimization::IndexSearch(_) => "index-search",
            Optimization::SkipUnlessChanged(_) => "skip-unless-changed",
            Optimization::AnyOf(_) => "any-of",
        }
    }

    /// All tags reachable from this directive, composites included
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags = vec![self.tag()];
        if let Optimization::AnyOf(inner) = self {
            for opt in inner {
                tags.extend(opt.tags());
            }
        }
        tags
    }
}

/// An artifact produced by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Artifact {
    pub name: String,
    pub path: String,
    #[serde(rename = "type", default = "default_artifact_type")]
    pub artifact_type: String,
}

fn default_artifact_type() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DockerWorker {
    /// Image reference; may be a task-reference placeholder to an image task
    pub docker_image: Value,
    #[serde(default)]
    pub command: Vec<Value>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
    pub max_run_time: u64,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GenericWorker {
    pub os: String,
    #[serde(default)]
    pub command: Vec<Value>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
    pub max_run_time: u64,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptWorker {
    #[serde(default)]
    pub upstream_artifacts: Vec<Value>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Executor-specific settings, one variant per worker implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "implementation", rename_all = "kebab-case")]
pub enum WorkerSpec {
    DockerWorker(DockerWorker),
    GenericWorker(GenericWorker),
    Scriptworker(ScriptWorker),
    /// Tasks that exist only to be optimized away
    AlwaysOptimized,
}

/// Worker implementation name, used to pick a payload builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    DockerWorker,
    GenericWorker,
    Scriptworker,
    AlwaysOptimized,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::DockerWorker => "docker-worker",
            WorkerKind::GenericWorker => "generic-worker",
            WorkerKind::Scriptworker => "scriptworker",
            WorkerKind::AlwaysOptimized => "always-optimized",
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = TaskgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker-worker" => Ok(WorkerKind::DockerWorker),
            "generic-worker" => Ok(WorkerKind::GenericWorker),
            "scriptworker" => Ok(WorkerKind::Scriptworker),
            "always-optimized" => Ok(WorkerKind::AlwaysOptimized),
            _ => Err(TaskgraphError::config(format!(
                "Invalid worker implementation: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl WorkerSpec {
    pub fn kind(&self) -> WorkerKind {
        match self {
            WorkerSpec::DockerWorker(_) => WorkerKind::DockerWorker,
            WorkerSpec::GenericWorker(_) => WorkerKind::GenericWorker,
            WorkerSpec::Scriptworker(_) => WorkerKind::Scriptworker,
            WorkerSpec::AlwaysOptimized => WorkerKind::AlwaysOptimized,
        }
    }
}

/// A fully transformed job, ready to become a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TaskNode {
    pub label: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Logical dependency name → label of the task depended upon
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub optimization: Option<Optimization>,
    pub worker: WorkerSpec,
    /// Task definition; may embed placeholders resolved after optimization
    #[serde(default)]
    pub task: Value,
}

impl TaskNode {
    /// Convert the output of the last transform into a node
    pub fn from_job(job: Job) -> Result<Self> {
        let label = job.display_label();
        serde_json::from_value(job.into_value()).map_err(|e| {
            TaskgraphError::pipeline("task-node", label, format!("malformed task: {}", e))
        })
    }

    pub fn directive_tag(&self) -> &'static str {
        self.optimization
            .as_ref()
            .map(Optimization::tag)
            .unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docker_job() -> Value {
        json!({
            "label": "build-linux64",
            "kind": "build",
            "attributes": {"build_platform": "linux64"},
            "dependencies": {"toolchain": "toolchain-clang"},
            "optimization": {"index-search": ["project.cache.build.linux64"]},
            "worker": {
                "implementation": "docker-worker",
                "docker-image": {"task-reference": "<docker-image>"},
                "max-run-time": 3600
            },
            "task": {"metadata": {"name": "build-linux64"}}
        })
    }

    #[test]
    fn test_job_dotted_paths() {
        let mut job = Job::from_value(json!({
            "label": "a",
            "worker": {"max-run-time": 10}
        }))
        .unwrap();

        assert_eq!(job.get_path("worker.max-run-time"), Some(&json!(10)));
        assert!(job.get_path("worker.missing").is_none());
        assert!(job.set_path("worker.max-run-time", json!(20)));
        assert_eq!(job.get_path("worker.max-run-time"), Some(&json!(20)));
        assert!(!job.set_path("nope.field", json!(1)));
    }

    #[test]
    fn test_job_requires_mapping() {
        assert!(Job::from_value(json!([1, 2])).is_err());
        assert_eq!(Job::new().display_label(), UNLABELLED);
    }

    #[test]
    fn test_task_node_from_job() {
        let node = TaskNode::from_job(Job::from_value(docker_job()).unwrap()).unwrap();
        assert_eq!(node.label, "build-linux64");
        assert_eq!(node.worker.kind(), WorkerKind::DockerWorker);
        assert_eq!(node.directive_tag(), "index-search");
        assert_eq!(node.dependencies["toolchain"], "toolchain-clang");
    }

    #[test]
    fn test_unknown_directive_is_rejected() {
        let mut value = docker_job();
        value["optimization"] = json!({"seta": null});
        let err = TaskNode::from_job(Job::from_value(value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("build-linux64"));
    }

    #[test]
    fn test_directive_missing_fields_is_rejected() {
        let mut value = docker_job();
        value["optimization"] = json!({"skip-unless-changed": null});
        assert!(TaskNode::from_job(Job::from_value(value).unwrap()).is_err());
    }

    #[test]
    fn test_composite_directive_tags() {
        let opt: Optimization = serde_json::from_value(json!({
            "any-of": [
                {"skip-unless-changed": ["src/**"]},
                {"index-search": ["a"]}
            ]
        }))
        .unwrap();
        assert_eq!(
            opt.tags(),
            vec!["any-of", "skip-unless-changed", "index-search"]
        );
    }

    #[test]
    fn test_worker_kind_roundtrip() {
        for kind in &[
            WorkerKind::DockerWorker,
            WorkerKind::GenericWorker,
            WorkerKind::Scriptworker,
            WorkerKind::AlwaysOptimized,
        ] {
            assert_eq!(kind.as_str().parse::<WorkerKind>().unwrap(), *kind);
        }
        assert!("buildbot-bridge".parse::<WorkerKind>().is_err());
    }
}
