//! Optimization strategies, one per directive tag
//!
//! Strategies are registered once into an immutable [`StrategyRegistry`]
//! handed to the optimizer; nothing is registered globally.

use super::lookup::{IndexLookup, LookupCache};
use super::OptimizeParams;
use crate::error::{Result, TaskgraphError};
use crate::job::{Optimization, TaskNode};
use crate::parameterization::substitute_task_references;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// What a strategy gets to see while deciding about one task
pub struct StrategyContext<'a> {
    pub params: &'a OptimizeParams,
    pub registry: &'a StrategyRegistry,
    pub index: &'a dyn IndexLookup,
    pub lookups: &'a LookupCache,
    /// Dependency name → final task id, for dependencies that were replaced
    pub dependency_ids: &'a BTreeMap<String, String>,
    /// Names of dependencies that were removed
    pub removed_dependencies: &'a BTreeSet<String>,
}

impl StrategyContext<'_> {
    /// Render `<dependency>` references in an index path. `None` when the
    /// path names a dependency without a final id.
    pub fn render_path(&self, path: &str) -> Option<String> {
        substitute_task_references(path, |name| self.dependency_ids.get(name).cloned()).ok()
    }
}

#[async_trait]
pub trait OptimizationStrategy: Send + Sync {
    /// Directive tag this strategy handles
    fn tag(&self) -> &'static str;

    /// Whether the task can be dropped. Only asked once every dependent of
    /// the task has been removed.
    fn should_remove(
        &self,
        _task: &TaskNode,
        _directive: &Optimization,
        _ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Index paths `should_replace` will look up, already rendered
    fn lookup_paths(&self, _directive: &Optimization, _ctx: &StrategyContext<'_>) -> Vec<String> {
        Vec::new()
    }

    /// Task id of an existing task to use instead, if any. Only asked once
    /// every dependency has been replaced or removed.
    async fn should_replace(
        &self,
        _task: &TaskNode,
        _directive: &Optimization,
        _ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

fn mismatched(strategy: &str, directive: &Optimization) -> anyhow::Error {
    anyhow::anyhow!(
        "strategy {} cannot evaluate a {} directive",
        strategy,
        directive.tag()
    )
}

/// Replace the task with the first usable result among its index paths
pub struct IndexSearch;

#[async_trait]
impl OptimizationStrategy for IndexSearch {
    fn tag(&self) -> &'static str {
        "index-search"
    }

    fn lookup_paths(&self, directive: &Optimization, ctx: &StrategyContext<'_>) -> Vec<String> {
        match directive {
            Optimization::IndexSearch(paths) => {
                paths.iter().filter_map(|p| ctx.render_path(p)).collect()
            }
            _ => Vec::new(),
        }
    }

    async fn should_replace(
        &self,
        task: &TaskNode,
        directive: &Optimization,
        ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        let paths = match directive {
            Optimization::IndexSearch(paths) => paths,
            other => return Err(mismatched(self.tag(), other)),
        };

        for path in paths {
            let rendered = match ctx.render_path(path) {
                Some(rendered) => rendered,
                None => {
                    debug!("{}: index path {} names an unresolved dependency", task.label, path);
                    continue;
                }
            };

            let result = match ctx.lookups.lookup(ctx.index, &rendered).await? {
                Some(result) => result,
                None => continue,
            };
            if !result.status.is_usable() {
                continue;
            }
            if let Some(deadline) = ctx.params.deadline {
                if result.expires <= deadline {
                    continue;
                }
            }

            return Ok(Some(result.task_id));
        }

        Ok(None)
    }
}

/// Remove the task unless a changed file matches one of its patterns
pub struct SkipUnlessChanged;

impl SkipUnlessChanged {
    /// A pattern matches a path as a glob, or as a directory containing it
    fn matches(pattern: &str, path: &str) -> bool {
        if glob_match::glob_match(pattern, path) {
            return true;
        }
        let dir = pattern.trim_end_matches('/');
        !dir.is_empty() && (path == dir || path.starts_with(&format!("{}/", dir)))
    }

    fn any_changed(files: &[String], patterns: &[String]) -> bool {
        patterns
            .iter()
            .any(|pattern| files.iter().any(|path| Self::matches(pattern, path)))
    }
}

#[async_trait]
impl OptimizationStrategy for SkipUnlessChanged {
    fn tag(&self) -> &'static str {
        "skip-unless-changed"
    }

    fn should_remove(
        &self,
        task: &TaskNode,
        directive: &Optimization,
        ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<bool> {
        let patterns = match directive {
            Optimization::SkipUnlessChanged(patterns) => patterns,
            other => return Err(mismatched(self.tag(), other)),
        };

        let changed = &ctx.params.changed_files;
        if !changed.tracked {
            return Ok(false);
        }

        if Self::any_changed(&changed.files, patterns) {
            return Ok(false);
        }
        debug!(
            "No changed file matches skip-unless-changed patterns of {}",
            task.label
        );
        Ok(true)
    }
}

/// Composite: remove if any member removes; replace with the first member
/// replacement, in declaration order
pub struct AnyOf;

#[async_trait]
impl OptimizationStrategy for AnyOf {
    fn tag(&self) -> &'static str {
        "any-of"
    }

    fn should_remove(
        &self,
        task: &TaskNode,
        directive: &Optimization,
        ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<bool> {
        let members = match directive {
            Optimization::AnyOf(members) => members,
            other => return Err(mismatched(self.tag(), other)),
        };
        for member in members {
            let strategy = ctx.registry.get_or_err(member.tag())?;
            if strategy.should_remove(task, member, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn lookup_paths(&self, directive: &Optimization, ctx: &StrategyContext<'_>) -> Vec<String> {
        match directive {
            Optimization::AnyOf(members) => members
                .iter()
                .filter_map(|m| ctx.registry.get(m.tag()).map(|s| s.lookup_paths(m, ctx)))
                .flatten()
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn should_replace(
        &self,
        task: &TaskNode,
        directive: &Optimization,
        ctx: &StrategyContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        let members = match directive {
            Optimization::AnyOf(members) => members,
            other => return Err(mismatched(self.tag(), other)),
        };
        for member in members {
            let strategy = ctx.registry.get_or_err(member.tag())?;
            if let Some(task_id) = strategy.should_replace(task, member, ctx).await? {
                return Ok(Some(task_id));
            }
        }
        Ok(None)
    }
}

/// Directive tag → strategy. Immutable once built.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn OptimizationStrategy>>,
}

impl StrategyRegistry {
    pub fn builder() -> StrategyRegistryBuilder {
        StrategyRegistryBuilder {
            strategies: HashMap::new(),
        }
    }

    /// `index-search`, `skip-unless-changed` and `any-of`
    pub fn with_defaults() -> Self {
        Self::builder()
            .register(IndexSearch)
            .register(SkipUnlessChanged)
            .register(AnyOf)
            .build()
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn OptimizationStrategy>> {
        self.strategies.get(tag)
    }

    fn get_or_err(&self, tag: &str) -> anyhow::Result<&Arc<dyn OptimizationStrategy>> {
        self.get(tag)
            .ok_or_else(|| anyhow::anyhow!("no strategy registered for {}", tag))
    }

    pub(crate) fn get_or_config_err(&self, tag: &str) -> Result<&Arc<dyn OptimizationStrategy>> {
        self.get(tag).ok_or_else(|| {
            TaskgraphError::config(format!("no strategy registered for optimization '{}'", tag))
        })
    }

    pub fn tags(&self) -> BTreeSet<&'static str> {
        self.strategies.keys().copied().collect()
    }

    /// Every directive tag used by `task` must have a strategy
    pub fn check_task(&self, task: &TaskNode) -> Result<()> {
        let optimization = match &task.optimization {
            Some(optimization) => optimization,
            None => return Ok(()),
        };
        for tag in optimization.tags() {
            if !self.strategies.contains_key(tag) {
                return Err(TaskgraphError::config(format!(
                    "task '{}' uses optimization '{}', which has no registered strategy",
                    task.label, tag
                )));
            }
        }
        Ok(())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct StrategyRegistryBuilder {
    strategies: HashMap<&'static str, Arc<dyn OptimizationStrategy>>,
}

impl StrategyRegistryBuilder {
    /// Later registrations for the same tag win
    pub fn register<S: OptimizationStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategies.insert(strategy.tag(), Arc::new(strategy));
        self
    }

    pub fn build(self) -> StrategyRegistry {
        StrategyRegistry {
            strategies: self.strategies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::WorkerSpec;
    use crate::optimize::lookup::{PrefetchedIndex, TaskState};
    use crate::optimize::ChangedFiles;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    fn task(optimization: Optimization) -> TaskNode {
        TaskNode {
            label: "t".to_string(),
            kind: "test".to_string(),
            attributes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            optimization: Some(optimization),
            worker: WorkerSpec::AlwaysOptimized,
            task: json!({}),
        }
    }

    struct Fixture {
        params: OptimizeParams,
        registry: StrategyRegistry,
        index: PrefetchedIndex,
        lookups: LookupCache,
        dependency_ids: BTreeMap<String, String>,
        removed: BTreeSet<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut index = PrefetchedIndex::new();
            index
                .insert("p1", "T1", TaskState::Completed, at(20))
                .insert("p2", "T2", TaskState::Completed, at(20))
                .insert("failed", "TF", TaskState::Failed, at(20))
                .insert("exception", "TE", TaskState::Exception, at(20))
                .insert("expiring", "TX", TaskState::Completed, at(5))
                .insert("with.IMAGEID", "TI", TaskState::Completed, at(20));
            Self {
                params: OptimizeParams::default(),
                registry: StrategyRegistry::with_defaults(),
                index,
                lookups: LookupCache::new(),
                dependency_ids: [("docker-image".to_string(), "IMAGEID".to_string())]
                    .into_iter()
                    .collect(),
                removed: BTreeSet::new(),
            }
        }

        fn ctx(&self) -> StrategyContext<'_> {
            StrategyContext {
                params: &self.params,
                registry: &self.registry,
                index: &self.index,
                lookups: &self.lookups,
                dependency_ids: &self.dependency_ids,
                removed_dependencies: &self.removed,
            }
        }

        async fn replace(&self, paths: &[&str]) -> Option<String> {
            let directive = Optimization::IndexSearch(paths.iter().map(|p| p.to_string()).collect());
            IndexSearch
                .should_replace(&task(directive.clone()), &directive, &self.ctx())
                .await
                .unwrap()
        }

        fn remove(&self, directive: Optimization) -> bool {
            let strategy = self.registry.get(directive.tag()).unwrap();
            strategy
                .should_remove(&task(directive.clone()), &directive, &self.ctx())
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_index_search_first_match_wins() {
        let f = Fixture::new();
        assert_eq!(f.replace(&["p1", "p2"]).await, Some("T1".to_string()));
        assert_eq!(f.replace(&["p2", "p1"]).await, Some("T2".to_string()));
        assert_eq!(f.replace(&["missing", "p2"]).await, Some("T2".to_string()));
        assert_eq!(f.replace(&["missing"]).await, None);
    }

    #[tokio::test]
    async fn test_index_search_skips_failed_and_exception() {
        let f = Fixture::new();
        assert_eq!(f.replace(&["failed", "exception"]).await, None);
        assert_eq!(f.replace(&["failed", "p2"]).await, Some("T2".to_string()));
    }

    #[tokio::test]
    async fn test_index_search_deadline() {
        let mut f = Fixture::new();
        assert_eq!(f.replace(&["expiring"]).await, Some("TX".to_string()));

        f.params.deadline = Some(at(10));
        assert_eq!(f.replace(&["expiring", "p1"]).await, Some("T1".to_string()));

        // expiring exactly at the deadline is not strictly after it
        f.params.deadline = Some(at(5));
        assert_eq!(f.replace(&["expiring"]).await, None);
    }

    #[tokio::test]
    async fn test_index_search_renders_dependency_ids() {
        let f = Fixture::new();
        assert_eq!(
            f.replace(&["with.<docker-image>"]).await,
            Some("TI".to_string())
        );
        // unknown dependency: path skipped, next one used
        assert_eq!(
            f.replace(&["with.<toolchain>", "p2"]).await,
            Some("T2".to_string())
        );
    }

    #[test]
    fn test_skip_unless_changed() {
        let mut f = Fixture::new();
        let directive = Optimization::SkipUnlessChanged(vec!["src/**".to_string()]);

        f.params.changed_files = ChangedFiles::tracked(vec!["docs/readme.md".to_string()]);
        assert!(f.remove(directive.clone()));

        f.params.changed_files = ChangedFiles::tracked(vec!["src/main.c".to_string()]);
        assert!(!f.remove(directive.clone()));

        f.params.changed_files = ChangedFiles::untracked();
        assert!(!f.remove(directive));
    }

    #[test]
    fn test_skip_unless_changed_directory_pattern() {
        let mut f = Fixture::new();
        let directive = Optimization::SkipUnlessChanged(vec!["taskcluster".to_string()]);

        f.params.changed_files = ChangedFiles::tracked(vec!["taskcluster/ci/kind.yml".to_string()]);
        assert!(!f.remove(directive.clone()));

        // a sibling sharing the prefix is not inside the directory
        f.params.changed_files = ChangedFiles::tracked(vec!["taskcluster-docs/index.md".to_string()]);
        assert!(f.remove(directive));

        assert!(SkipUnlessChanged::matches("taskcluster/", "taskcluster/ci/kind.yml"));
        assert!(SkipUnlessChanged::matches("taskcluster/ci/kind.yml", "taskcluster/ci/kind.yml"));
        assert!(!SkipUnlessChanged::matches("", "taskcluster/ci/kind.yml"));
    }

    #[tokio::test]
    async fn test_any_of() {
        let mut f = Fixture::new();
        f.params.changed_files = ChangedFiles::tracked(vec!["docs/readme.md".to_string()]);

        let directive = Optimization::AnyOf(vec![
            Optimization::IndexSearch(vec!["p2".to_string()]),
            Optimization::SkipUnlessChanged(vec!["src/**".to_string()]),
        ]);
        assert!(f.remove(directive.clone()));

        let replaced = AnyOf
            .should_replace(&task(directive.clone()), &directive, &f.ctx())
            .await
            .unwrap();
        assert_eq!(replaced, Some("T2".to_string()));
        assert_eq!(AnyOf.lookup_paths(&directive, &f.ctx()), vec!["p2".to_string()]);
    }

    #[test]
    fn test_registry_checks_tags() {
        let registry = StrategyRegistry::builder().register(IndexSearch).build();
        let ok = task(Optimization::IndexSearch(vec![]));
        let composite = task(Optimization::AnyOf(vec![Optimization::SkipUnlessChanged(
            vec![],
        )]));

        assert!(registry.check_task(&ok).is_ok());
        let err = registry.check_task(&composite).unwrap_err();
        assert!(err.to_string().contains("any-of"));
        assert_eq!(
            StrategyRegistry::with_defaults().tags(),
            ["any-of", "index-search", "skip-unless-changed"]
                .into_iter()
                .collect()
        );
    }
}
