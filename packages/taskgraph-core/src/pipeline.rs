use crate::config::{GraphConfig, Parameters};
use crate::error::Result;
use crate::job::Job;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Lazy sequence of jobs flowing between transforms.
///
/// A transform that drops everything yields an empty stream, never "nothing".
/// Errors travel down the stream and stop the run at the first one.
pub type JobStream = Box<dyn Iterator<Item = Result<Job>>>;

/// Configuration shared by every transform of one kind
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Kind name, e.g. `build` or `docker-image`
    pub kind: String,
    /// Directory the kind was loaded from
    pub path: PathBuf,
    /// The kind's own configuration
    pub config: Map<String, Value>,
    pub params: Parameters,
    pub graph_config: GraphConfig,
}

impl TransformConfig {
    pub fn new(kind: impl Into<String>, params: Parameters, graph_config: GraphConfig) -> Self {
        Self {
            kind: kind.into(),
            path: PathBuf::new(),
            config: Map::new(),
            params,
            graph_config,
        }
    }
}

/// One named transformation stage (pluggable)
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Wrap `jobs` in this stage. Must not consume the stream eagerly.
    fn apply(&self, config: Arc<TransformConfig>, jobs: JobStream) -> JobStream;
}

type StreamFn = dyn Fn(Arc<TransformConfig>, JobStream) -> JobStream + Send + Sync;

struct FnTransform {
    name: String,
    f: Arc<StreamFn>,
}

impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, config: Arc<TransformConfig>, jobs: JobStream) -> JobStream {
        (self.f)(config, jobs)
    }
}

/// Ordered container of transforms.
///
/// Stages are shared immutably, so one sequence can be run for any number
/// of kinds. A stream already handed out keeps the stages it was built with.
#[derive(Clone, Default)]
pub struct TransformSequence {
    transforms: Vec<Arc<dyn Transform>>,
}

impl TransformSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Transform + 'static>(&mut self, transform: T) -> &mut Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    pub fn add_shared(&mut self, transform: Arc<dyn Transform>) -> &mut Self {
        self.transforms.push(transform);
        self
    }

    /// Add every stage of `other`, after the ones already present
    pub fn extend(&mut self, other: &TransformSequence) -> &mut Self {
        self.transforms.extend(other.transforms.iter().cloned());
        self
    }

    pub fn add_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<TransformConfig>, JobStream) -> JobStream + Send + Sync + 'static,
    {
        self.add(FnTransform {
            name: name.into(),
            f: Arc::new(f),
        })
    }

    /// One job in, one job out
    pub fn map_jobs<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&TransformConfig, Job) -> Result<Job> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.add_fn(name, move |config, jobs| {
            let f = f.clone();
            Box::new(jobs.map(move |item| item.and_then(|job| f(&config, job))))
        })
    }

    /// Drop jobs for which `keep` is false
    pub fn filter_jobs<F>(&mut self, name: impl Into<String>, keep: F) -> &mut Self
    where
        F: Fn(&TransformConfig, &Job) -> bool + Send + Sync + 'static,
    {
        let keep = Arc::new(keep);
        self.add_fn(name, move |config, jobs| {
            let keep = keep.clone();
            Box::new(jobs.filter(move |item| match item {
                Ok(job) => keep(&config, job),
                Err(_) => true,
            }))
        })
    }

    /// One job in, any number out
    pub fn flat_map_jobs<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&TransformConfig, Job) -> Result<Vec<Job>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.add_fn(name, move |config, jobs| {
            let f = f.clone();
            Box::new(jobs.flat_map(move |item| {
                let expanded: Vec<Result<Job>> = match item.and_then(|job| f(&config, job)) {
                    Ok(jobs) => jobs.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                expanded
            }))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Thread `jobs` through every stage, lazily
    pub fn stream(&self, config: Arc<TransformConfig>, jobs: Vec<Job>) -> JobStream {
        let mut stream: JobStream = Box::new(jobs.into_iter().map(Ok));
        for transform in &self.transforms {
            debug!("Kind {}: applying transform {}", config.kind, transform.name());
            stream = transform.apply(config.clone(), stream);
        }
        stream
    }

    /// Run the whole sequence, failing on the first error
    pub fn run(&self, config: Arc<TransformConfig>, jobs: Vec<Job>) -> Result<Vec<Job>> {
        let kind = config.kind.clone();
        let input = jobs.len();
        let output = self.stream(config, jobs).collect::<Result<Vec<_>>>()?;

        info!(
            "Kind {}: {} transforms turned {} jobs into {}",
            kind,
            self.transforms.len(),
            input,
            output.len()
        );
        Ok(output)
    }
}

impl std::fmt::Debug for TransformSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSequence")
            .field("transforms", &self.names())
            .finish()
    }
}
