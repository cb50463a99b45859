//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use taskgraph_core::{Optimization, TaskNode, WorkerSpec};

/// Midnight UTC on the given day of March 2024
pub fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, n, 0, 0, 0).unwrap()
}

pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap()
}

/// A task node whose dependency names equal the labels depended upon
pub fn node(label: &str, deps: &[&str], optimization: Option<Optimization>) -> TaskNode {
    TaskNode {
        label: label.to_string(),
        kind: "test".to_string(),
        attributes: BTreeMap::new(),
        dependencies: deps
            .iter()
            .map(|d| (d.to_string(), d.to_string()))
            .collect(),
        optimization,
        worker: WorkerSpec::AlwaysOptimized,
        task: json!({"metadata": {"name": label}}),
    }
}

pub fn index_search(paths: &[&str]) -> Option<Optimization> {
    Some(Optimization::IndexSearch(
        paths.iter().map(|p| p.to_string()).collect(),
    ))
}

pub fn skip_unless_changed(patterns: &[&str]) -> Option<Optimization> {
    Some(Optimization::SkipUnlessChanged(
        patterns.iter().map(|p| p.to_string()).collect(),
    ))
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
