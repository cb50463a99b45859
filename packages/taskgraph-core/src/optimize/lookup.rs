//! Index lookups consulted by `index-search`
//!
//! The index itself is external. Backends implement [`IndexLookup`];
//! [`PrefetchedIndex`] serves results fetched ahead of the run.
//! [`LookupCache`] makes sure each path is asked at most once per run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Recorded state of an indexed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Unscheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    /// Failed and exception results are never reused
    pub fn is_usable(&self) -> bool {
        !matches!(self, TaskState::Failed | TaskState::Exception)
    }
}

/// A prior result found under an index path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexedResult {
    pub task_id: String,
    pub status: TaskState,
    pub expires: DateTime<Utc>,
}

#[async_trait]
pub trait IndexLookup: Send + Sync {
    /// `Ok(None)` means nothing is indexed under `path`. Backend failures
    /// are errors, never "no match".
    async fn lookup(&self, path: &str) -> anyhow::Result<Option<IndexedResult>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub expires: DateTime<Utc>,
}

/// Lookup results fetched before the run: index path → task id, and
/// task id → status. A task id without a status is treated as no match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefetchedIndex {
    paths: HashMap<String, String>,
    statuses: HashMap<String, TaskStatus>,
}

impl PrefetchedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(paths: HashMap<String, String>, statuses: HashMap<String, TaskStatus>) -> Self {
        Self { paths, statuses }
    }

    /// Index `task_id` under `path` with the given status
    pub fn insert(
        &mut self,
        path: impl Into<String>,
        task_id: impl Into<String>,
        state: TaskState,
        expires: DateTime<Utc>,
    ) -> &mut Self {
        let task_id = task_id.into();
        self.paths.insert(path.into(), task_id.clone());
        self.statuses.insert(task_id, TaskStatus { state, expires });
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[async_trait]
impl IndexLookup for PrefetchedIndex {
    async fn lookup(&self, path: &str) -> anyhow::Result<Option<IndexedResult>> {
        let result = self.paths.get(path).and_then(|task_id| {
            self.statuses.get(task_id).map(|status| IndexedResult {
                task_id: task_id.clone(),
                status: status.state,
                expires: status.expires,
            })
        });
        Ok(result)
    }
}

type CachedLookup = std::result::Result<Option<IndexedResult>, String>;

/// Per-run memo of index lookups. Failures are remembered too, so a path
/// is never queried twice within one run.
#[derive(Default)]
pub struct LookupCache {
    entries: DashMap<String, CachedLookup>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn replay(entry: &CachedLookup) -> anyhow::Result<Option<IndexedResult>> {
        match entry {
            Ok(result) => Ok(result.clone()),
            Err(message) => Err(anyhow::anyhow!("{}", message)),
        }
    }

    pub async fn lookup(
        &self,
        index: &dyn IndexLookup,
        path: &str,
    ) -> anyhow::Result<Option<IndexedResult>> {
        if let Some(entry) = self.entries.get(path) {
            return Self::replay(entry.value());
        }

        let fetched = index.lookup(path).await.map_err(|e| format!("{:#}", e));
        let entry = self.entries.entry(path.to_string()).or_insert(fetched);
        Self::replay(entry.value())
    }

    /// Query every path not yet cached, concurrently
    pub async fn prefetch(&self, index: &dyn IndexLookup, paths: BTreeSet<String>) {
        let missing: Vec<String> = paths
            .into_iter()
            .filter(|p| !self.entries.contains_key(p))
            .collect();
        if missing.is_empty() {
            return;
        }

        debug!("Prefetching {} index paths", missing.len());
        let results = futures::future::join_all(missing.iter().map(|p| index.lookup(p))).await;
        for (path, result) in missing.into_iter().zip(results) {
            self.entries
                .entry(path)
                .or_insert(result.map_err(|e| format!("{:#}", e)));
        }
    }
}
