use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskgraphError>;

/// A single schema violation, addressed by a dotted path into the value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum TaskgraphError {
    #[error("{context} {}", join_violations(.violations))]
    Schema {
        context: String,
        violations: Vec<Violation>,
    },

    #[error("Graph consistency error: {message} (chain: {})", .chain.join(" -> "))]
    GraphConsistency { message: String, chain: Vec<String> },

    #[error("Multiple matching values for {field} ({context}): {}", .matches.join(", "))]
    AmbiguousKey {
        field: String,
        context: String,
        matches: Vec<String>,
    },

    #[error("No value for {field} matching {value:?} ({context})")]
    UnresolvedKey {
        field: String,
        value: String,
        context: String,
    },

    #[error("Optimization strategy {strategy} failed for task {label}: {source}")]
    Strategy {
        label: String,
        strategy: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task '{label}' has no dependency named '{dependency}'")]
    UnknownDependency { label: String, dependency: String },

    #[error("Invalid relative timestamp {input:?} in task '{label}'")]
    TimeParse { label: String, input: String },

    #[error("Transform {stage} failed for {label}: {message}")]
    Pipeline {
        stage: String,
        label: String,
        message: String,
    },

    #[error("Verification {name} failed: {message}")]
    Verification { name: String, message: String },

    #[error("Payload builder error for task '{label}': {message}")]
    Payload { label: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskgraphError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn pipeline(
        stage: impl Into<String>,
        label: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            label: label.into(),
            message: message.to_string(),
        }
    }

    pub fn graph(message: impl Into<String>, chain: Vec<String>) -> Self {
        Self::GraphConsistency {
            message: message.into(),
            chain,
        }
    }

    /// Stable code for callers that branch on the failure kind
    pub fn code(&self) -> &'static str {
        match self {
            TaskgraphError::Schema { .. } => "SCHEMA_ERROR",
            TaskgraphError::GraphConsistency { .. } => "GRAPH_CONSISTENCY_ERROR",
            TaskgraphError::AmbiguousKey { .. } => "AMBIGUOUS_KEY_ERROR",
            TaskgraphError::UnresolvedKey { .. } => "UNRESOLVED_KEY_ERROR",
            TaskgraphError::Strategy { .. } => "STRATEGY_ERROR",
            TaskgraphError::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY_ERROR",
            TaskgraphError::TimeParse { .. } => "TIME_PARSE_ERROR",
            TaskgraphError::Pipeline { .. } => "PIPELINE_ERROR",
            TaskgraphError::Verification { .. } => "VERIFICATION_ERROR",
            TaskgraphError::Payload { .. } => "PAYLOAD_ERROR",
            TaskgraphError::Config(_) => "CONFIG_ERROR",
            TaskgraphError::Io(_) => "IO_ERROR",
            TaskgraphError::Json(_) => "JSON_ERROR",
            TaskgraphError::Yaml(_) => "YAML_ERROR",
            TaskgraphError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Violations carried by a schema error, empty for every other kind
    pub fn violations(&self) -> &[Violation] {
        match self {
            TaskgraphError::Schema { violations, .. } => violations,
            _ => &[],
        }
    }
}
