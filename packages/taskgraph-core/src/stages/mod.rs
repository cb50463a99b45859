//! Built-in transforms
//!
//! The default sequence is: derive labels, validate the task description,
//! resolve keyed-by fields, then build the task definition.

pub mod task;

pub use task::{build_task, task_description_shape, KEYED_BY_FIELDS};

use crate::error::TaskgraphError;
use crate::job::{Job, UNLABELLED};
use crate::keyed_by::resolve_keyed_by;
use crate::pipeline::{JobStream, Transform, TransformConfig, TransformSequence};
use crate::schema::{validate, Shape};
use serde_json::json;
use std::sync::Arc;

/// Give jobs that only carry a `name` the label `<kind>-<name>`
pub struct LabelFromName;

impl Transform for LabelFromName {
    fn name(&self) -> &str {
        "label-from-name"
    }

    fn apply(&self, config: Arc<TransformConfig>, jobs: JobStream) -> JobStream {
        Box::new(jobs.map(move |item| {
            let mut job = item?;
            if job.label().is_some() {
                return Ok(job);
            }
            let label = match job.name() {
                Some(name) => format!("{}-{}", config.kind, name),
                None => {
                    return Err(TaskgraphError::pipeline(
                        "label-from-name",
                        UNLABELLED,
                        format!("{} job has neither a label nor a name", config.kind),
                    ))
                }
            };
            job.insert("label", json!(label));
            Ok(job)
        }))
    }
}

/// Validation checkpoint: re-yields each job as validated against `shape`
pub struct ValidateSchema {
    name: String,
    shape: Arc<Shape>,
}

impl ValidateSchema {
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape: Arc::new(shape),
        }
    }
}

impl Transform for ValidateSchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, config: Arc<TransformConfig>, jobs: JobStream) -> JobStream {
        let shape = self.shape.clone();
        Box::new(jobs.map(move |item| {
            let job = item?;
            let context = format!("In {} task '{}':", config.kind, job.display_label());
            let checked = validate(&shape, &job.into_value(), &context)?;
            Job::from_value(checked)
        }))
    }
}

/// Resolve the listed (dotted) fields in place, against the job and then
/// the run parameters
pub struct ResolveKeyedBy {
    fields: Vec<String>,
}

impl ResolveKeyedBy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Transform for ResolveKeyedBy {
    fn name(&self) -> &str {
        "resolve-keyed-by"
    }

    fn apply(&self, config: Arc<TransformConfig>, jobs: JobStream) -> JobStream {
        let fields = self.fields.clone();
        Box::new(jobs.map(move |item| {
            let mut job = item?;
            let context = job.display_label();
            for field in &fields {
                resolve_keyed_by(&mut job, field, &context, config.params.as_map())?;
            }
            Ok(job)
        }))
    }
}

/// The standard sequence a kind's jobs pass through after its own transforms
pub fn default_transforms() -> TransformSequence {
    let mut seq = TransformSequence::new();
    seq.add(LabelFromName)
        .add(ValidateSchema::new(
            "validate-task-description",
            task_description_shape(),
        ))
        .add(ResolveKeyedBy::new(KEYED_BY_FIELDS.iter().copied()))
        .map_jobs("build-task", build_task);
    seq
}
