/*
 * Taskgraph Core - CI Task Graph Generation
 *
 * Turns declarative job descriptions into a dependency graph of CI tasks,
 * prunes work that is already done or irrelevant, and resolves the
 * survivors into submittable task definitions.
 *
 * Architecture:
 * - Schema validation + keyed-by resolution
 * - Transform pipeline (pluggable, lazy)
 * - Task graph (labels + named edges)
 * - Optimizer (keep / replace / remove, pluggable strategies)
 * - Reference resolver (timestamps, task ids, artifact URLs)
 * - Content-addressed cache keys
 */

// Public modules
pub mod config;
pub mod context_hash;
pub mod error;
pub mod generator;
pub mod graph;
pub mod job;
pub mod keyed_by;
pub mod logging;
pub mod optimize;
pub mod parameterization;
pub mod payload;
pub mod pipeline;
pub mod schema;
pub mod stages;
pub mod taskgraph;
pub mod time;
pub mod verify;

// Re-exports
pub use config::{GraphConfig, Parameters, RunParameters};
pub use context_hash::{generate_context_hash, ContextHasher};
pub use error::{Result, TaskgraphError, Violation};
pub use generator::{GeneratedGraph, Kind, TaskGraphGenerator};
pub use graph::{Edge, Graph};
pub use job::{Job, Optimization, TaskNode, WorkerKind, WorkerSpec};
pub use keyed_by::{evaluate_keyed_by, resolve_keyed_by};
pub use optimize::lookup::{IndexLookup, IndexedResult, LookupCache, PrefetchedIndex, TaskState};
pub use optimize::strategies::{OptimizationStrategy, StrategyContext, StrategyRegistry};
pub use optimize::{
    ChangedFiles, Decision, OptimizeParams, OptimizedGraph, Optimizer, RandomTaskIds,
    SequentialTaskIds, TaskIdSource,
};
pub use parameterization::ReferenceResolver;
pub use payload::{PayloadBuilder, PayloadBuilders, SubmittableTask};
pub use pipeline::{JobStream, Transform, TransformConfig, TransformSequence};
pub use schema::{validate, Field, Shape};
pub use taskgraph::TaskGraph;
pub use verify::{Verification, VerificationSequence};
