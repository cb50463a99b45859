//! Task descriptions and the transform that turns them into task nodes

use crate::config::Parameters;
use crate::error::{Result, TaskgraphError};
use crate::job::Job;
use crate::keyed_by::evaluate_keyed_by;
use crate::pipeline::TransformConfig;
use crate::schema::{Field, Shape};
use serde_json::{json, Map, Value};

/// Fields a task description may be keyed by
pub const KEYED_BY_KEYS: &[&str] = &["project", "level", "build-platform", "build-type", "kind"];

/// Fields resolved by the keyed-by stage of the default sequence
pub const KEYED_BY_FIELDS: &[&str] = &[
    "expires-after",
    "deadline-after",
    "priority",
    "run-on-projects",
    "worker.docker-image",
    "worker.env",
    "worker.max-run-time",
];

pub const PRIORITIES: &[&str] = &[
    "highest",
    "very-high",
    "high",
    "medium",
    "low",
    "very-low",
    "lowest",
];

fn keyed(inner: Shape) -> Shape {
    Shape::optionally_keyed_by(KEYED_BY_KEYS, inner)
}

pub fn optimization_shape() -> Shape {
    Shape::one_of(vec![
        Shape::Null,
        Shape::record(vec![Field::required("index-search", Shape::list(Shape::Str))]),
        Shape::record(vec![Field::required(
            "skip-unless-changed",
            Shape::list(Shape::Str),
        )]),
        Shape::record(vec![Field::required("any-of", Shape::list(Shape::Any))]),
    ])
}

fn artifacts_shape() -> Shape {
    Shape::list(Shape::record(vec![
        Field::required("name", Shape::Str),
        Field::required("path", Shape::Str),
        Field::with_default(
            "type",
            Shape::enumeration(&["file", "directory"]),
            json!("file"),
        ),
    ]))
}

pub fn worker_shape() -> Shape {
    Shape::one_of(vec![
        Shape::record(vec![
            Field::required("implementation", Shape::literal("docker-worker")),
            Field::required("docker-image", keyed(Shape::Any)),
            Field::with_default("command", Shape::list(Shape::Any), json!([])),
            Field::with_default("env", keyed(Shape::map(Shape::Any)), json!({})),
            Field::required("max-run-time", keyed(Shape::Int)),
            Field::with_default("artifacts", artifacts_shape(), json!([])),
        ]),
        Shape::record(vec![
            Field::required("implementation", Shape::literal("generic-worker")),
            Field::required("os", Shape::enumeration(&["linux", "macosx", "windows"])),
            Field::with_default("command", Shape::list(Shape::Any), json!([])),
            Field::with_default("env", keyed(Shape::map(Shape::Any)), json!({})),
            Field::required("max-run-time", keyed(Shape::Int)),
            Field::with_default("artifacts", artifacts_shape(), json!([])),
        ]),
        Shape::record(vec![
            Field::required("implementation", Shape::literal("scriptworker")),
            Field::with_default("upstream-artifacts", Shape::list(Shape::Any), json!([])),
            Field::with_default("payload", Shape::map(Shape::Any), json!({})),
        ]),
        Shape::record(vec![Field::required(
            "implementation",
            Shape::literal("always-optimized"),
        )]),
    ])
}

/// Shape of a task description, as accepted by [`build_task`]
pub fn task_description_shape() -> Shape {
    Shape::record(vec![
        Field::required("label", Shape::Str),
        Field::required("description", Shape::Str),
        Field::optional("name", Shape::Str),
        Field::with_default("attributes", Shape::map(Shape::Any), json!({})),
        Field::with_default("dependencies", Shape::map(Shape::Str), json!({})),
        Field::optional("expires-after", keyed(Shape::Str)),
        Field::optional("deadline-after", keyed(Shape::Str)),
        Field::with_default("routes", Shape::list(Shape::Str), json!([])),
        Field::with_default("scopes", Shape::list(Shape::Str), json!([])),
        Field::with_default("tags", Shape::map(Shape::Str), json!({})),
        Field::with_default("extra", Shape::map(Shape::Any), json!({})),
        Field::optional(
            "index",
            Shape::record(vec![
                Field::required("product", Shape::Str),
                Field::required("job-name", Shape::Str),
            ]),
        ),
        Field::optional("run-on-projects", keyed(Shape::list(Shape::Str))),
        Field::optional("priority", keyed(Shape::enumeration(PRIORITIES))),
        Field::with_default("optimization", optimization_shape(), Value::Null),
        Field::required("worker-type", Shape::Str),
        Field::required("worker", worker_shape()),
    ])
}

/// Parameter value as a string; numbers are rendered without quotes
fn param_string(params: &Parameters, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn with_level(template: &str, level: Option<&str>, label: &str) -> Result<String> {
    if !template.contains("{level}") {
        return Ok(template.to_string());
    }
    match level {
        Some(level) => Ok(template.replace("{level}", level)),
        None => Err(TaskgraphError::pipeline(
            "build-task",
            label,
            format!("'{}' needs the 'level' parameter", template),
        )),
    }
}

fn string_field(job: &Job, key: &str) -> Option<String> {
    job.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Turn a validated, keyed-by-resolved task description into the job shape
/// a `TaskNode` is built from. Timestamps are left as relative-datestamp
/// placeholders.
pub fn build_task(config: &TransformConfig, mut job: Job) -> Result<Job> {
    let label = job
        .label()
        .map(str::to_string)
        .ok_or_else(|| TaskgraphError::pipeline("build-task", job.display_label(), "missing label"))?;
    let params = &config.params;
    let graph_config = &config.graph_config;
    let level = param_string(params, "level");

    let worker_type_template = string_field(&job, "worker-type").unwrap_or_default();
    let worker_type = with_level(&worker_type_template, level.as_deref(), &label)?;
    let (provisioner_id, worker_type) = worker_type.split_once('/').ok_or_else(|| {
        TaskgraphError::pipeline(
            "build-task",
            &label,
            format!("worker-type '{}' is not of the form provisioner/worker-type", worker_type),
        )
    })?;

    let mut routes: Vec<Value> = match job.remove("routes") {
        Some(Value::Array(routes)) => routes,
        _ => Vec::new(),
    };
    if let Some(index) = job.get("index").and_then(Value::as_object) {
        let product = index.get("product").and_then(Value::as_str).unwrap_or_default();
        let job_name = index.get("job-name").and_then(Value::as_str).unwrap_or_default();
        let project = params.project().unwrap_or("unknown");
        let root = format!("{}.{}.v2.{}", graph_config.index_prefix, graph_config.trust_domain, project);
        routes.push(json!(format!("{}.latest.{}.{}", root, product, job_name)));
        if let Some(rev) = params.get_str("head_rev") {
            routes.push(json!(format!("{}.revision.{}.{}.{}", root, rev, product, job_name)));
        }
    }

    let scopes = match job.remove("scopes") {
        Some(Value::Array(scopes)) => scopes
            .iter()
            .filter_map(Value::as_str)
            .map(|s| with_level(s, level.as_deref(), &label).map(Value::String))
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    let expires_after = match string_field(&job, "expires-after") {
        Some(value) => value,
        None => {
            let resolved = evaluate_keyed_by(&graph_config.expires_after, "expires-after", &label, |k| {
                params.get(k).cloned()
            })?;
            resolved.as_str().map(str::to_string).ok_or_else(|| {
                TaskgraphError::config(format!("expires-after default is not a string: {}", resolved))
            })?
        }
    };
    let deadline_after =
        string_field(&job, "deadline-after").unwrap_or_else(|| graph_config.deadline_after.clone());
    let priority = string_field(&job, "priority").unwrap_or_else(|| graph_config.task_priority.clone());

    let owner = params.require_str("owner").map_err(|e| {
        TaskgraphError::pipeline("build-task", &label, e)
    })?;

    let mut tags = match job.remove("tags") {
        Some(Value::Object(tags)) => tags,
        _ => Map::new(),
    };
    tags.insert("createdForUser".to_string(), json!(owner));
    tags.insert("kind".to_string(), json!(config.kind));
    tags.insert("label".to_string(), json!(label));

    let mut metadata = Map::new();
    metadata.insert(
        "description".to_string(),
        job.get("description").cloned().unwrap_or(Value::Null),
    );
    metadata.insert("name".to_string(), json!(label));
    metadata.insert("owner".to_string(), json!(owner));
    if let (Some(repo), Some(rev)) = (params.get_str("head_repository"), params.get_str("head_rev")) {
        metadata.insert(
            "source".to_string(),
            json!(format!("{}/file/{}/{}", repo, rev, config.path.display())),
        );
    }

    let extra = job.remove("extra").unwrap_or_else(|| json!({}));
    let task_def = json!({
        "provisionerId": provisioner_id,
        "workerType": worker_type,
        "routes": routes,
        "created": {"relative-datestamp": "0 seconds"},
        "deadline": {"relative-datestamp": deadline_after},
        "expires": {"relative-datestamp": expires_after},
        "scopes": scopes,
        "metadata": metadata,
        "extra": extra,
        "tags": tags,
        "priority": priority,
    });

    let mut attributes = match job.remove("attributes") {
        Some(Value::Object(attributes)) => attributes,
        _ => Map::new(),
    };
    attributes.insert(
        "run_on_projects".to_string(),
        job.remove("run-on-projects").unwrap_or_else(|| json!(["all"])),
    );

    let mut out = Job::new();
    out.insert("label", json!(label));
    out.insert("kind", json!(config.kind));
    out.insert("attributes", Value::Object(attributes));
    out.insert(
        "dependencies",
        job.remove("dependencies").unwrap_or_else(|| json!({})),
    );
    out.insert(
        "optimization",
        job.remove("optimization").unwrap_or(Value::Null),
    );
    out.insert("worker", job.remove("worker").unwrap_or(Value::Null));
    out.insert("task", task_def);
    Ok(out)
}
