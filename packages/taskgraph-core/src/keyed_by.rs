//! Keyed-by value resolution
//!
//! A keyed-by value looks like
//!
//! ```yaml
//! max-run-time:
//!     by-build-platform:
//!         linux64: 3600
//!         win.*: 7200
//!         default: 1800
//! ```
//!
//! and is resolved against the item's own `build-platform` field (or the run
//! parameters when the item has none): exact key first, then the unique
//! regex key that fully matches, then `default`.

use crate::error::{Result, TaskgraphError};
use crate::job::Job;
use crate::schema::keyed_by_entry;
use regex::Regex;
use serde_json::{Map, Value};

pub const KEYED_BY_PREFIX: &str = "by-";
pub const DEFAULT_KEY: &str = "default";

fn discriminant_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Evaluate a possibly keyed-by `value`.
///
/// `lookup` maps a discriminant name (`build-platform` for `by-build-platform`)
/// to its value. Literal values and mappings that are not a single `by-*`
/// entry come back unchanged. Alternatives may themselves be keyed-by.
pub fn evaluate_keyed_by<F>(value: &Value, field: &str, context: &str, lookup: F) -> Result<Value>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut current = value.clone();

    loop {
        let (by_key, alternatives) = match keyed_by_entry(&current) {
            Some((key, Value::Object(alts))) => (key.to_string(), alts.clone()),
            _ => return Ok(current),
        };
        let discriminant = &by_key[KEYED_BY_PREFIX.len()..];
        let key = lookup(discriminant).as_ref().and_then(discriminant_string);

        current = match select_alternative(&alternatives, key.as_deref(), field, context)? {
            Some(next) => next,
            None => {
                return Err(TaskgraphError::UnresolvedKey {
                    field: field.to_string(),
                    value: key.unwrap_or_else(|| format!("<no {}>", discriminant)),
                    context: context.to_string(),
                })
            }
        };
    }
}

fn select_alternative(
    alternatives: &Map<String, Value>,
    key: Option<&str>,
    field: &str,
    context: &str,
) -> Result<Option<Value>> {
    if let Some(key) = key {
        if let Some(exact) = alternatives.get(key) {
            return Ok(Some(exact.clone()));
        }

        let matches: Vec<&String> = alternatives
            .keys()
            .filter(|k| k.as_str() != DEFAULT_KEY)
            .filter(|k| full_match(k, key))
            .collect();

        match matches.len() {
            0 => {}
            1 => return Ok(alternatives.get(matches[0].as_str()).cloned()),
            _ => {
                return Err(TaskgraphError::AmbiguousKey {
                    field: field.to_string(),
                    context: context.to_string(),
                    matches: matches.into_iter().cloned().collect(),
                })
            }
        }
    }

    Ok(alternatives.get(DEFAULT_KEY).cloned())
}

/// Whether `pattern` matches the whole of `value`. Keys that are not valid
/// regular expressions never match.
fn full_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Resolve the keyed-by value at `field` (a dotted path) of `item` in place.
///
/// Discriminants are looked up in the item first, then in `params`. Returns
/// the resolved value, or `None` when the item has no such field.
pub fn resolve_keyed_by(
    item: &mut Job,
    field: &str,
    context: &str,
    params: &Map<String, Value>,
) -> Result<Option<Value>> {
    let value = match item.get_path(field) {
        Some(value) => value.clone(),
        None => return Ok(None),
    };

    let resolved = {
        let snapshot = &*item;
        evaluate_keyed_by(&value, field, context, |name| {
            snapshot
                .get_path(name)
                .or_else(|| params.get(name))
                .cloned()
        })?
    };

    item.set_path(field, resolved.clone());
    Ok(Some(resolved))
}
