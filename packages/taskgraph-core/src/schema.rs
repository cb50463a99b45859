//! Declarative shapes for job descriptions
//!
//! A [`Shape`] describes what a value must look like. [`validate`] checks a
//! value against a shape, collecting every violation rather than stopping at
//! the first one, and returns a freshly built value with field defaults
//! filled in. Callers never share default values with one another.
//!
//! Keyed-by fields are declared with [`Shape::optionally_keyed_by`]: the
//! value is either the inner shape directly, or a single `by-<key>` mapping
//! whose alternatives each conform to the keyed-by shape again.

use crate::error::{Result, TaskgraphError, Violation};
use crate::keyed_by::KEYED_BY_PREFIX;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Anything, including null
    Any,
    Null,
    Bool,
    Int,
    Number,
    Str,
    /// Exactly this value
    Literal(Value),
    /// The first alternative that matches without violations wins. When
    /// none does and the value is a mapping, the violations of the closest
    /// record alternative are reported (tag fields decide first).
    OneOf(Vec<Shape>),
    List(Box<Shape>),
    /// String keys, every value of the given shape
    Map(Box<Shape>),
    Record {
        fields: Vec<Field>,
        allow_extra: bool,
    },
    KeyedBy {
        keys: Vec<String>,
        inner: Box<Shape>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
    pub default: Option<Value>,
}

impl Field {
    pub fn required(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: false,
            default: None,
        }
    }

    /// Required, but filled in with `default` when absent
    pub fn with_default(name: impl Into<String>, shape: Shape, default: Value) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
            default: Some(default),
        }
    }
}

impl Shape {
    pub fn record(fields: Vec<Field>) -> Self {
        Shape::Record {
            fields,
            allow_extra: false,
        }
    }

    /// A record that tolerates keys it does not declare
    pub fn open_record(fields: Vec<Field>) -> Self {
        Shape::Record {
            fields,
            allow_extra: true,
        }
    }

    pub fn list(inner: Shape) -> Self {
        Shape::List(Box::new(inner))
    }

    pub fn map(inner: Shape) -> Self {
        Shape::Map(Box::new(inner))
    }

    pub fn one_of(alternatives: Vec<Shape>) -> Self {
        Shape::OneOf(alternatives)
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Shape::Literal(value.into())
    }

    /// One of several string literals
    pub fn enumeration(values: &[&str]) -> Self {
        Shape::OneOf(values.iter().map(|v| Shape::literal(*v)).collect())
    }

    pub fn optionally_keyed_by(keys: &[&str], inner: Shape) -> Self {
        Shape::KeyedBy {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            inner: Box::new(inner),
        }
    }

    /// Short human description used in violation messages
    pub fn describe(&self) -> String {
        match self {
            Shape::Any => "any value".to_string(),
            Shape::Null => "null".to_string(),
            Shape::Bool => "boolean".to_string(),
            Shape::Int => "integer".to_string(),
            Shape::Number => "number".to_string(),
            Shape::Str => "string".to_string(),
            Shape::Literal(v) => v.to_string(),
            Shape::OneOf(alts) => alts
                .iter()
                .map(Shape::describe)
                .collect::<Vec<_>>()
                .join(" | "),
            Shape::List(inner) => format!("list of {}", inner.describe()),
            Shape::Map(inner) => format!("mapping of {}", inner.describe()),
            Shape::Record { fields, .. } => {
                let required: Vec<&str> = fields
                    .iter()
                    .filter(|f| f.required && f.default.is_none())
                    .map(|f| f.name.as_str())
                    .collect();
                if required.is_empty() {
                    "mapping".to_string()
                } else {
                    format!("mapping with {}", required.join(", "))
                }
            }
            Shape::KeyedBy { keys, inner } => format!(
                "{} (optionally keyed by {})",
                inner.describe(),
                keys.join(", ")
            ),
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Validate `value` against `shape`.
///
/// On failure the error names `context` (typically `In task 'label':`) and
/// lists every violation found.
pub fn validate(shape: &Shape, value: &Value, context: &str) -> Result<Value> {
    let mut violations = Vec::new();
    let checked = check(shape, value, "", &mut violations);
    if violations.is_empty() {
        Ok(checked)
    } else {
        Err(TaskgraphError::Schema {
            context: context.to_string(),
            violations,
        })
    }
}

fn check(shape: &Shape, value: &Value, path: &str, violations: &mut Vec<Violation>) -> Value {
    let mismatch = |violations: &mut Vec<Violation>| {
        violations.push(Violation::new(
            path,
            format!("expected {}, got {}", shape.describe(), type_name(value)),
        ));
        value.clone()
    };

    match shape {
        Shape::Any => value.clone(),
        Shape::Null => match value {
            Value::Null => Value::Null,
            _ => mismatch(violations),
        },
        Shape::Bool => match value {
            Value::Bool(_) => value.clone(),
            _ => mismatch(violations),
        },
        Shape::Int => {
            if value.is_i64() || value.is_u64() {
                value.clone()
            } else {
                mismatch(violations)
            }
        }
        Shape::Number => match value {
            Value::Number(_) => value.clone(),
            _ => mismatch(violations),
        },
        Shape::Str => match value {
            Value::String(_) => value.clone(),
            _ => mismatch(violations),
        },
        Shape::Literal(expected) => {
            if value == expected {
                value.clone()
            } else {
                violations.push(Violation::new(
                    path,
                    format!("expected {}, got {}", expected, value),
                ));
                value.clone()
            }
        }
        Shape::OneOf(alternatives) => {
            let mut closest: Option<((bool, usize), Vec<Violation>, Value)> = None;
            for alternative in alternatives {
                let mut scratch = Vec::new();
                let checked = check(alternative, value, path, &mut scratch);
                if scratch.is_empty() {
                    return checked;
                }
                let rank = match (alternative, value) {
                    (Shape::Record { fields, .. }, Value::Object(entries)) => {
                        (!tag_matches(fields, entries), scratch.len())
                    }
                    _ => continue,
                };
                if closest.as_ref().map_or(true, |(best, _, _)| rank < *best) {
                    closest = Some((rank, scratch, checked));
                }
            }
            if let Some((_, found, checked)) = closest {
                violations.extend(found);
                return checked;
            }
            violations.push(Violation::new(
                path,
                format!("value {} does not match {}", value, shape.describe()),
            ));
            value.clone()
        }
        Shape::List(inner) => match value {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| check(inner, item, &join_path(path, &i.to_string()), violations))
                    .collect(),
            ),
            _ => mismatch(violations),
        },
        Shape::Map(inner) => match value {
            Value::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), check(inner, v, &join_path(path, k), violations)))
                    .collect(),
            ),
            _ => mismatch(violations),
        },
        Shape::Record {
            fields,
            allow_extra,
        } => match value {
            Value::Object(entries) => check_record(fields, *allow_extra, entries, path, violations),
            _ => mismatch(violations),
        },
        Shape::KeyedBy { keys, inner } => {
            if let Some((by_key, alternatives)) = keyed_by_entry(value) {
                let discriminant = &by_key[KEYED_BY_PREFIX.len()..];
                let by_path = join_path(path, by_key);
                if !keys.iter().any(|k| k == discriminant) {
                    violations.push(Violation::new(
                        &by_path,
                        format!(
                            "cannot key by {:?}; allowed: {}",
                            discriminant,
                            keys.join(", ")
                        ),
                    ));
                    return value.clone();
                }
                match alternatives {
                    Value::Object(alts) => {
                        let checked: Map<String, Value> = alts
                            .iter()
                            .map(|(k, v)| (k.clone(), check(shape, v, &join_path(&by_path, k), violations)))
                            .collect();
                        let mut out = Map::new();
                        out.insert(by_key.to_string(), Value::Object(checked));
                        Value::Object(out)
                    }
                    _ => {
                        violations.push(Violation::new(
                            by_path,
                            format!("expected mapping of alternatives, got {}", type_name(alternatives)),
                        ));
                        value.clone()
                    }
                }
            } else {
                check(inner, value, path, violations)
            }
        }
    }
}

fn check_record(
    fields: &[Field],
    allow_extra: bool,
    entries: &Map<String, Value>,
    path: &str,
    violations: &mut Vec<Violation>,
) -> Value {
    let mut out = Map::new();

    for (key, val) in entries {
        match fields.iter().find(|f| &f.name == key) {
            Some(field) => {
                out.insert(key.clone(), check(&field.shape, val, &join_path(path, key), violations));
            }
            None if allow_extra => {
                out.insert(key.clone(), val.clone());
            }
            None => {
                violations.push(Violation::new(join_path(path, key), "extra keys not allowed"));
            }
        }
    }

    for field in fields {
        if entries.contains_key(&field.name) {
            continue;
        }
        match &field.default {
            Some(default) => {
                out.insert(field.name.clone(), default.clone());
            }
            None if field.required => {
                violations.push(Violation::new(
                    join_path(path, &field.name),
                    "required key not provided",
                ));
            }
            None => {}
        }
    }

    Value::Object(out)
}

/// Whether the record's literal fields (such as `implementation`) are all
/// present in `entries` with exactly that value. Records without literal
/// fields never match.
fn tag_matches(fields: &[Field], entries: &Map<String, Value>) -> bool {
    let mut tags = fields
        .iter()
        .filter_map(|f| match &f.shape {
            Shape::Literal(expected) => Some((f.name.as_str(), expected)),
            _ => None,
        })
        .peekable();
    tags.peek().is_some() && tags.all(|(name, expected)| entries.get(name) == Some(expected))
}

/// The single `by-*` entry of a keyed-by mapping, if `value` is one
pub(crate) fn keyed_by_entry(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, alternatives) = map.iter().next()?;
    if key.starts_with(KEYED_BY_PREFIX) {
        Some((key.as_str(), alternatives))
    } else {
        None
    }
}
