//! Placeholder resolution, run once task ids are final
//!
//! A mapping with a single placeholder key is replaced by the placeholder's
//! value:
//!
//! - `{"relative-datestamp": "1 day"}` → timestamp relative to generation
//! - `{"task-reference": "<build>"}` → task id of dependency `build`
//! - `{"artifact-reference": "<build/public/target.tar.gz>"}` → artifact URL
//!
//! Inside references, `<<>` stands for a literal `<`.

use crate::config::LEGACY_ROOT_URL;
use crate::error::{Result, TaskgraphError};
use crate::time::json_time_from_now;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const RELATIVE_DATESTAMP: &str = "relative-datestamp";
pub const TASK_REFERENCE: &str = "task-reference";
pub const ARTIFACT_REFERENCE: &str = "artifact-reference";

/// Reference name that means "this task" when not a dependency name
pub const SELF_REFERENCE: &str = "self";

lazy_static! {
    static ref TASK_REFERENCE_PATTERN: Regex = Regex::new(r"<([^>]+)>").unwrap();
    static ref ARTIFACT_REFERENCE_PATTERN: Regex = Regex::new(r"<([^/>]+)/([^>]+)>").unwrap();
}

/// Replace every match of `pattern` in `input` with `replace(captures)`,
/// stopping at the first failure
pub(crate) fn substitute<F, E>(pattern: &Regex, input: &str, mut replace: F) -> std::result::Result<String, E>
where
    F: FnMut(&Captures<'_>) -> std::result::Result<String, E>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in pattern.captures_iter(input) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        out.push_str(&input[last..whole.start()]);
        out.push_str(&replace(&caps)?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Substitute `<name>` references in `input` using `lookup`. Returns the
/// first unknown name on failure.
pub(crate) fn substitute_task_references<F>(input: &str, lookup: F) -> std::result::Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    substitute(&TASK_REFERENCE_PATTERN, input, |caps| {
        let key = &caps[1];
        match lookup(key) {
            Some(value) => Ok(value),
            None if key == "<" => Ok(key.to_string()),
            None => Err(key.to_string()),
        }
    })
}

fn recurse<F>(value: &Value, placeholders: &[&str], evaluate: &F) -> Result<Value>
where
    F: Fn(&str, &Value) -> Result<Value>,
{
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| recurse(item, placeholders, evaluate))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if placeholders.contains(&key.as_str()) {
                        return evaluate(key, inner);
                    }
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), recurse(v, placeholders, evaluate)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn placeholder_string<'a>(label: &str, key: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        TaskgraphError::pipeline(
            "resolve-references",
            label,
            format!("{} must be a string, got {}", key, value),
        )
    })
}

/// Replace every `relative-datestamp` placeholder in `value`
pub fn resolve_timestamps(now: DateTime<Utc>, label: &str, value: &Value) -> Result<Value> {
    recurse(value, &[RELATIVE_DATESTAMP], &|key, inner| {
        let input = placeholder_string(label, key, inner)?;
        json_time_from_now(input, now)
            .map(Value::String)
            .ok_or_else(|| TaskgraphError::TimeParse {
                label: label.to_string(),
                input: input.to_string(),
            })
    })
}

/// Locator for an artifact of a task, relative to the deployment root
pub fn artifact_url(root_url: &str, task_id: &str, artifact: &str) -> String {
    let root = root_url.trim_end_matches('/');
    let path = format!("task/{}/artifacts/{}", task_id, artifact);
    if root == LEGACY_ROOT_URL {
        format!("https://queue.taskcluster.net/v1/{}", path)
    } else {
        format!("{}/api/queue/v1/{}", root, path)
    }
}

/// Replace every `task-reference` and `artifact-reference` placeholder.
///
/// `dependencies` maps dependency names to final task ids; `task_id` is the
/// id of the task owning `value`, used for `<self>`.
pub fn resolve_task_references(
    label: &str,
    task_id: &str,
    value: &Value,
    dependencies: &BTreeMap<String, String>,
    root_url: &str,
) -> Result<Value> {
    let unknown = |dependency: String| TaskgraphError::UnknownDependency {
        label: label.to_string(),
        dependency,
    };

    recurse(value, &[TASK_REFERENCE, ARTIFACT_REFERENCE], &|key, inner| {
        let input = placeholder_string(label, key, inner)?;
        let resolved = if key == TASK_REFERENCE {
            substitute_task_references(input, |name| {
                dependencies.get(name).cloned().or_else(|| {
                    (name == SELF_REFERENCE).then(|| task_id.to_string())
                })
            })
            .map_err(unknown)?
        } else {
            substitute(&ARTIFACT_REFERENCE_PATTERN, input, |caps| {
                let dependency = &caps[1];
                match dependencies.get(dependency) {
                    Some(dep_id) => Ok(artifact_url(root_url, dep_id, &caps[2])),
                    None => Err(dependency.to_string()),
                }
            })
            .map_err(unknown)?
        };
        Ok(Value::String(resolved))
    })
}

/// Resolves every placeholder kind in one pass over a payload
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    now: DateTime<Utc>,
    root_url: String,
}

impl ReferenceResolver {
    pub fn new(now: DateTime<Utc>, root_url: impl Into<String>) -> Self {
        Self {
            now,
            root_url: root_url.into(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn resolve(
        &self,
        label: &str,
        task_id: &str,
        value: &Value,
        dependencies: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let value = resolve_timestamps(self.now, label, value)?;
        resolve_task_references(label, task_id, &value, dependencies, &self.root_url)
    }
}
