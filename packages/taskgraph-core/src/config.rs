//! Graph configuration and run parameters
//!
//! `GraphConfig` is the per-repository configuration, loaded from versioned
//! YAML. `Parameters` is the free-form key/value set a run is generated
//! with; `RunParameters` adds the inputs the optimizer consumes.

use crate::error::{Result, TaskgraphError};
use crate::optimize::OptimizeParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

pub const SUPPORTED_CONFIG_VERSIONS: &[u32] = &[1];

/// Root URL of the legacy deployment, which uses per-service hostnames
pub const LEGACY_ROOT_URL: &str = "https://taskcluster.net";

fn default_priority() -> String {
    "low".to_string()
}

fn default_expires_after() -> Value {
    json!({"by-project": {"try": "28 days", "default": "1 year"}})
}

fn default_deadline_after() -> String {
    "1 day".to_string()
}

fn default_index_prefix() -> String {
    "index".to_string()
}

/// Repository-level graph configuration (YAML schema v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GraphConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    /// Prefix for index routes and scopes
    pub trust_domain: String,

    /// Deployment root; artifact locators are built from it
    pub root_url: String,

    #[serde(default = "default_priority")]
    pub task_priority: String,

    /// Default task lifetime; may be keyed by run parameters
    #[serde(default = "default_expires_after")]
    pub expires_after: Value,

    #[serde(default = "default_deadline_after")]
    pub deadline_after: String,

    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
}

impl GraphConfig {
    pub fn new(trust_domain: impl Into<String>, root_url: impl Into<String>) -> Self {
        Self {
            version: 1,
            trust_domain: trust_domain.into(),
            root_url: root_url.into(),
            task_priority: default_priority(),
            expires_after: default_expires_after(),
            deadline_after: default_deadline_after(),
            index_prefix: default_index_prefix(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: GraphConfig = serde_yaml::from_str(content)?;

        if !SUPPORTED_CONFIG_VERSIONS.contains(&config.version) {
            return Err(TaskgraphError::config(format!(
                "unsupported config version {} (supported: {:?})",
                config.version, SUPPORTED_CONFIG_VERSIONS
            )));
        }
        if config.trust_domain.is_empty() {
            return Err(TaskgraphError::config("trust-domain must not be empty"));
        }

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn is_legacy_root(&self) -> bool {
        self.root_url.trim_end_matches('/') == LEGACY_ROOT_URL
    }
}

/// Free-form run parameters, consumed by keyed-by resolution and stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Required string parameter
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| TaskgraphError::config(format!("missing string parameter '{}'", key)))
    }

    pub fn project(&self) -> Option<&str> {
        self.get_str("project")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        match serde_yaml::from_str::<Value>(content)? {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(TaskgraphError::config(format!(
                "parameters must be a mapping, got {}",
                other
            ))),
        }
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => Ok(Self(map)),
                other => Err(TaskgraphError::config(format!(
                    "parameters must be a mapping, got {}",
                    other
                ))),
            },
            _ => Self::from_yaml_str(&content),
        }
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Everything a single generation run is parameterized by
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunParameters {
    /// Instant relative timestamps are measured from
    pub generated_at: DateTime<Utc>,

    #[serde(flatten)]
    pub optimize: OptimizeParams,
}

impl RunParameters {
    pub fn new(generated_at: DateTime<Utc>, params: Parameters) -> Self {
        Self {
            generated_at,
            optimize: OptimizeParams {
                params,
                ..OptimizeParams::default()
            },
        }
    }

    pub fn params(&self) -> &Parameters {
        &self.optimize.params
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}
