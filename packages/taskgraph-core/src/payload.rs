//! Worker payloads and the final submittable task set
//!
//! One [`PayloadBuilder`] per worker implementation turns a resolved
//! [`WorkerSpec`] into the `payload` section of a task definition. Builders
//! run once per surviving task, after optimization and reference
//! resolution.

use crate::error::{Result, TaskgraphError};
use crate::job::{Artifact, DockerWorker, GenericWorker, ScriptWorker, WorkerKind, WorkerSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Location of a docker image tarball inside its producing task
pub const DOCKER_IMAGE_ARTIFACT: &str = "public/image.tar.zst";

/// What a builder sees besides the worker settings
pub struct PayloadContext<'a> {
    pub label: &'a str,
    pub task_id: &'a str,
    /// Dependency name → final task id
    pub dependencies: &'a BTreeMap<String, String>,
    /// The resolved task definition the payload will be attached to
    pub task_def: &'a Value,
}

impl PayloadContext<'_> {
    fn error(&self, message: impl Into<String>) -> TaskgraphError {
        TaskgraphError::Payload {
            label: self.label.to_string(),
            message: message.into(),
        }
    }

    fn expires(&self) -> Value {
        self.task_def.get("expires").cloned().unwrap_or(Value::Null)
    }
}

pub trait PayloadBuilder: Send + Sync {
    fn kind(&self) -> WorkerKind;

    fn build(&self, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> Result<Value>;
}

fn mismatch(builder: WorkerKind, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> TaskgraphError {
    ctx.error(format!(
        "{} payload builder cannot handle a {} worker",
        builder,
        worker.kind()
    ))
}

fn env_object(env: &BTreeMap<String, Value>) -> Value {
    Value::Object(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

pub struct DockerWorkerPayload;

impl DockerWorkerPayload {
    fn image(worker: &DockerWorker, ctx: &PayloadContext<'_>) -> Result<Value> {
        match &worker.docker_image {
            Value::String(_) => Ok(worker.docker_image.clone()),
            Value::Object(image) => {
                if image.contains_key("in-tree") {
                    let image_task = ctx.dependencies.get("docker-image").ok_or_else(|| {
                        ctx.error("in-tree docker image needs a 'docker-image' dependency")
                    })?;
                    Ok(json!({
                        "path": DOCKER_IMAGE_ARTIFACT,
                        "taskId": image_task,
                        "type": "task-image",
                    }))
                } else if let Some(namespace) = image.get("indexed") {
                    Ok(json!({
                        "path": DOCKER_IMAGE_ARTIFACT,
                        "namespace": namespace,
                        "type": "indexed-image",
                    }))
                } else {
                    Err(ctx.error(format!("unknown docker image type: {}", worker.docker_image)))
                }
            }
            other => Err(ctx.error(format!("unknown docker image type: {}", other))),
        }
    }

    fn artifacts(artifacts: &[Artifact], ctx: &PayloadContext<'_>) -> Value {
        let mut out = Map::new();
        for artifact in artifacts {
            out.insert(
                artifact.name.clone(),
                json!({
                    "path": artifact.path,
                    "type": artifact.artifact_type,
                    "expires": ctx.expires(),
                }),
            );
        }
        Value::Object(out)
    }
}

impl PayloadBuilder for DockerWorkerPayload {
    fn kind(&self) -> WorkerKind {
        WorkerKind::DockerWorker
    }

    fn build(&self, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> Result<Value> {
        let worker = match worker {
            WorkerSpec::DockerWorker(worker) => worker,
            other => return Err(mismatch(self.kind(), other, ctx)),
        };

        let mut payload = Map::new();
        payload.insert("image".to_string(), Self::image(worker, ctx)?);
        payload.insert("env".to_string(), env_object(&worker.env));
        if !worker.command.is_empty() {
            payload.insert("command".to_string(), Value::Array(worker.command.clone()));
        }
        payload.insert("maxRunTime".to_string(), json!(worker.max_run_time));
        if !worker.artifacts.is_empty() {
            payload.insert("artifacts".to_string(), Self::artifacts(&worker.artifacts, ctx));
        }
        Ok(Value::Object(payload))
    }
}

pub struct GenericWorkerPayload;

impl PayloadBuilder for GenericWorkerPayload {
    fn kind(&self) -> WorkerKind {
        WorkerKind::GenericWorker
    }

    fn build(&self, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> Result<Value> {
        let GenericWorker {
            command,
            env,
            max_run_time,
            artifacts,
            ..
        } = match worker {
            WorkerSpec::GenericWorker(worker) => worker,
            other => return Err(mismatch(self.kind(), other, ctx)),
        };

        let artifacts: Vec<Value> = artifacts
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "path": a.path,
                    "type": a.artifact_type,
                    "expires": ctx.expires(),
                })
            })
            .collect();

        Ok(json!({
            "command": command,
            "artifacts": artifacts,
            "env": env_object(env),
            "maxRunTime": max_run_time,
        }))
    }
}

pub struct ScriptworkerPayload;

impl PayloadBuilder for ScriptworkerPayload {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Scriptworker
    }

    fn build(&self, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> Result<Value> {
        let ScriptWorker {
            upstream_artifacts,
            payload,
        } = match worker {
            WorkerSpec::Scriptworker(worker) => worker,
            other => return Err(mismatch(self.kind(), other, ctx)),
        };

        let mut out = payload.clone();
        out.insert(
            "upstreamArtifacts".to_string(),
            Value::Array(upstream_artifacts.clone()),
        );
        Ok(Value::Object(out))
    }
}

/// Placeholder tasks get an empty payload
pub struct AlwaysOptimizedPayload;

impl PayloadBuilder for AlwaysOptimizedPayload {
    fn kind(&self) -> WorkerKind {
        WorkerKind::AlwaysOptimized
    }

    fn build(&self, _worker: &WorkerSpec, _ctx: &PayloadContext<'_>) -> Result<Value> {
        Ok(json!({}))
    }
}

/// Worker kind → payload builder
#[derive(Clone)]
pub struct PayloadBuilders {
    builders: HashMap<WorkerKind, Arc<dyn PayloadBuilder>>,
}

impl PayloadBuilders {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut builders = Self::empty();
        builders
            .register(DockerWorkerPayload)
            .register(GenericWorkerPayload)
            .register(ScriptworkerPayload)
            .register(AlwaysOptimizedPayload);
        builders
    }

    pub fn register<B: PayloadBuilder + 'static>(&mut self, builder: B) -> &mut Self {
        self.builders.insert(builder.kind(), Arc::new(builder));
        self
    }

    pub fn get(&self, kind: WorkerKind) -> Option<&Arc<dyn PayloadBuilder>> {
        self.builders.get(&kind)
    }

    /// Attach the payload for `worker` to `ctx.task_def`, returning the
    /// completed definition
    pub fn build(&self, worker: &WorkerSpec, ctx: &PayloadContext<'_>) -> Result<Value> {
        let builder = self
            .get(worker.kind())
            .ok_or_else(|| ctx.error(format!("no payload builder for {}", worker.kind())))?;
        let payload = builder.build(worker, ctx)?;

        let mut task_def = match ctx.task_def {
            Value::Object(map) => map.clone(),
            other => return Err(ctx.error(format!("task definition is not a mapping: {}", other))),
        };
        task_def.insert("payload".to_string(), payload);
        Ok(Value::Object(task_def))
    }
}

impl Default for PayloadBuilders {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A task ready for submission: every edge is a concrete task id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmittableTask {
    pub task_id: String,
    pub label: String,
    pub task: Value,
    /// Dependency name → task id
    pub dependencies: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, Value>,
}
