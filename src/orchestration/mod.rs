//! Orchestration layer.
//!
//! The [`Coordinator`] drives a task graph to completion, running each task
//! through the [`RetryingExecutor`], judging results with a
//! [`GatePipeline`], and reporting outcomes to callbacks, metrics and an
//! optional [`PatternStore`].

mod callbacks;
mod coordinator;
mod executor;
mod gates;
mod metrics;
mod patterns;

pub use callbacks::{CallbackRegistry, CallbackResult, TaskOutcome};
pub use coordinator::{Coordinator, Phase};
pub use executor::{
    AttemptPayload, AttemptResult, FailureReason, FnSpawner, RetryingExecutor, RunReport,
    RunStatus, SpawnError, Spawner,
};
pub use gates::{
    FnGate, Gate, GatePipeline, GateReport, GateResult, GateVerdict, NonEmptyOutput,
    OutputMatches, RequireArtifacts, ResourceBudget,
};
pub use metrics::{Metrics, MetricsAggregator};
pub use patterns::{FailureRecord, InMemoryPatternStore, Pattern, PatternStore};
