//! Coordinator for dependency-ordered parallel execution.
//!
//! The [`Coordinator`] owns the task graph, the gate pipeline, the callback
//! registry and the metrics. [`Coordinator::execute`] runs a single
//! scheduling loop: it dispatches ready tasks onto a [`JoinSet`] while
//! semaphore permits are available and applies every completion itself, so
//! graph state, callbacks and metrics are never touched concurrently.

use crate::config::{CoordinatorConfig, Plan};
use crate::core::dag::TaskGraph;
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::callbacks::{CallbackRegistry, CallbackResult, TaskOutcome};
use crate::orchestration::executor::{
    panic_message, AttemptPayload, FailureReason, RetryingExecutor, RunReport, RunStatus,
    Spawner,
};
use crate::orchestration::gates::GatePipeline;
use crate::orchestration::metrics::{Metrics, MetricsAggregator};
use crate::orchestration::patterns::{Pattern, PatternStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a coordinator. Each coordinator runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepting tasks.
    Idle,
    /// Dispatching and collecting.
    Running,
    /// Canceled: waiting for in-flight tasks, dispatching nothing new.
    Draining,
    /// Finished.
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Running => write!(f, "running"),
            Phase::Draining => write!(f, "draining"),
            Phase::Done => write!(f, "done"),
        }
    }
}

impl Phase {
    fn can_transition(self, target: Phase) -> bool {
        matches!(
            (self, target),
            (Phase::Idle, Phase::Running)
                | (Phase::Running, Phase::Draining)
                | (Phase::Running, Phase::Done)
                | (Phase::Draining, Phase::Done)
        )
    }
}

/// Runs a graph of tasks through a [`Spawner`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use convoy::config::CoordinatorConfig;
/// use convoy::core::Task;
/// use convoy::orchestration::{AttemptPayload, Coordinator, FnSpawner};
/// use tokio_util::sync::CancellationToken;
///
/// let spawner = Arc::new(FnSpawner::new(|_cancel, task| async move {
///     Ok(AttemptPayload::new(&task.title))
/// }));
/// let mut coordinator = Coordinator::new(CoordinatorConfig::default(), spawner);
/// coordinator.add_agent(Task::new("schema", "Design schema"))?;
/// coordinator.add_agent(Task::new("api", "Build API").depends_on("schema"))?;
/// coordinator.execute(&CancellationToken::new()).await?;
/// println!("{}", coordinator.metrics().to_json()?);
/// ```
pub struct Coordinator {
    config: CoordinatorConfig,
    graph: TaskGraph,
    spawner: Arc<dyn Spawner>,
    executor: RetryingExecutor,
    gates: GatePipeline,
    callbacks: CallbackRegistry,
    metrics: MetricsAggregator,
    patterns: Option<Arc<dyn PatternStore>>,
    phase: Phase,
    run_id: Uuid,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, spawner: Arc<dyn Spawner>) -> Self {
        let executor = RetryingExecutor::new().with_backoff(config.retry_backoff());
        Self {
            config,
            graph: TaskGraph::new(),
            spawner,
            executor,
            gates: GatePipeline::new(),
            callbacks: CallbackRegistry::new(),
            metrics: MetricsAggregator::new(),
            patterns: None,
            phase: Phase::Idle,
            run_id: Uuid::new_v4(),
        }
    }

    /// Build a coordinator and register every task in `plan`.
    pub fn from_plan(plan: &Plan, spawner: Arc<dyn Spawner>) -> Result<Self> {
        plan.validate()?;
        let mut coordinator = Self::new(plan.coordinator.clone(), spawner);
        for task in plan.tasks() {
            coordinator.add_agent(task)?;
        }
        Ok(coordinator)
    }

    pub fn with_gates(mut self, gates: GatePipeline) -> Self {
        self.gates = gates;
        self
    }

    /// Report successes and failure causes to `store`.
    ///
    /// Writes are detached onto the runtime and best effort: `execute` does
    /// not wait for them, so writes still pending when the runtime shuts
    /// down are lost. Store errors are logged and never fail the run.
    pub fn with_pattern_store(mut self, store: Arc<dyn PatternStore>) -> Self {
        self.patterns = Some(store);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.executor = self.executor.with_backoff(backoff);
        self
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    pub fn on_success<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&TaskOutcome) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_success(f);
        self
    }

    pub fn on_failure<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&TaskOutcome) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_failure(f);
        self
    }

    /// Register a task. Only valid before [`Coordinator::execute`].
    ///
    /// # Errors
    /// - [`Error::GraphFinalized`] once execution has started
    /// - [`Error::DuplicateTask`] if the ID is taken
    /// - [`Error::Validation`] for a blank ID or zero timeout
    pub fn add_agent(&mut self, task: Task) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::GraphFinalized);
        }
        task.validate()?;
        tracing::debug!(task = %task.id, deps = task.depends_on.len(), "registering task");
        self.graph.add_task(task)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn task_state(&self, id: &TaskId) -> Option<&TaskState> {
        self.graph.state(id)
    }

    /// Every task's state in registration order.
    pub fn states(&self) -> Vec<(TaskId, TaskState)> {
        self.graph.states()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.phase.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.phase, to = %target, "phase transition");
        self.phase = target;
        Ok(())
    }

    /// Run every registered task to a terminal state.
    ///
    /// Cancelling `cancel` stops new dispatch; in-flight attempts see a
    /// cancelled token and their tasks end as `Canceled`. Tasks that never
    /// started stay `Pending`.
    ///
    /// # Errors
    /// - graph errors from validation, before anything is dispatched
    /// - [`Error::InvalidPhaseTransition`] if called more than once
    /// - [`Error::Canceled`] if canceled before any task finished
    pub async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: Phase::Running.to_string(),
            });
        }
        self.config.validate()?;
        self.graph.validate()?;
        self.transition(Phase::Running)?;

        let total = self.graph.len();
        tracing::info!(
            run_id = %self.run_id,
            tasks = total,
            max_concurrent = self.config.max_concurrent,
            "starting run"
        );
        self.metrics.set_total(total);
        self.metrics.start();

        let run_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut permits: HashMap<TaskId, OwnedSemaphorePermit> = HashMap::new();
        let mut in_flight: JoinSet<(TaskId, RunReport)> = JoinSet::new();
        let mut runners: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut finished = 0usize;

        loop {
            if self.phase == Phase::Running {
                if run_token.is_cancelled() {
                    self.begin_drain()?;
                } else {
                    self.dispatch(
                        &semaphore,
                        &run_token,
                        &mut permits,
                        &mut runners,
                        &mut in_flight,
                    )?;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let draining = self.phase != Phase::Running;
            tokio::select! {
                biased;
                joined = in_flight.join_next_with_id() => match joined {
                    Some(Ok((runner, (id, report)))) => {
                        runners.remove(&runner);
                        permits.remove(&id);
                        if self.complete(&id, report)? {
                            finished += 1;
                        }
                    }
                    Some(Err(err)) => {
                        let Some(id) = runners.remove(&err.id()) else {
                            tracing::error!(run_id = %self.run_id, error = %err, "unknown task runner died");
                            continue;
                        };
                        permits.remove(&id);
                        self.runner_died(&id, err)?;
                        finished += 1;
                    }
                    None => break,
                },
                _ = run_token.cancelled(), if !draining => {
                    self.begin_drain()?;
                }
            }
        }

        let canceled = self.phase == Phase::Draining;
        let not_started = self.graph.count_in(|s| matches!(s, TaskState::Pending));
        if not_started > 0 {
            self.metrics.record_not_started(not_started);
        }
        self.metrics.stop();
        self.transition(Phase::Done)?;

        let metrics = self.metrics.snapshot();
        tracing::info!(
            run_id = %self.run_id,
            succeeded = metrics.success_count,
            failed = metrics.failure_count,
            canceled = metrics.canceled_count,
            not_started = metrics.not_started_count,
            wall_secs = metrics.total_wall_time_secs,
            speedup = metrics.parallel_speedup,
            "run finished"
        );

        if canceled && finished == 0 {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    fn begin_drain(&mut self) -> Result<()> {
        self.transition(Phase::Draining)?;
        let requeued = self.graph.reset_ready();
        tracing::info!(run_id = %self.run_id, requeued, "run canceled, draining in-flight tasks");
        Ok(())
    }

    /// Start ready tasks in insertion order until permits run out.
    fn dispatch(
        &mut self,
        semaphore: &Arc<Semaphore>,
        run_token: &CancellationToken,
        permits: &mut HashMap<TaskId, OwnedSemaphorePermit>,
        runners: &mut HashMap<tokio::task::Id, TaskId>,
        in_flight: &mut JoinSet<(TaskId, RunReport)>,
    ) -> Result<()> {
        for id in self.graph.ready_tasks() {
            self.graph.mark_ready(&id)?;
        }

        for id in self.graph.queued_tasks() {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let task = self
                .graph
                .task(&id)
                .cloned()
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            self.graph.mark_running(&id)?;
            permits.insert(id.clone(), permit);

            tracing::info!(run_id = %self.run_id, task = %id, "dispatching task");
            let executor = self.executor.clone();
            let spawner = self.spawner.clone();
            let token = run_token.clone();
            let handle = in_flight.spawn(async move {
                let report = executor.run(&token, &task, spawner.as_ref()).await;
                (task.id, report)
            });
            runners.insert(handle.id(), id);
        }

        self.metrics.observe_concurrency(permits.len());
        Ok(())
    }

    /// Apply one finished attempt sequence. Returns whether the task
    /// reached Succeeded or Failed.
    fn complete(&mut self, id: &TaskId, report: RunReport) -> Result<bool> {
        let task = self
            .graph
            .task(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let RunReport { status, mut attempts } = report;

        let outcome = match status {
            RunStatus::Canceled => {
                self.graph.mark_canceled(id)?;
                let outcome = TaskOutcome::canceled(&task, attempts);
                tracing::info!(run_id = %self.run_id, task = %id, "task canceled");
                self.metrics.record(&outcome);
                return Ok(false);
            }
            RunStatus::Succeeded => {
                let mut gate_failure = None;
                if let Some(last) = attempts.last_mut() {
                    let report = match &last.payload {
                        Some(payload) => self.gates.evaluate(payload),
                        None => self.gates.evaluate(&AttemptPayload::default()),
                    };
                    if !report.passed {
                        let reason = FailureReason::GateFailure {
                            gates: report.failed_gates(),
                        };
                        last.success = false;
                        last.failure = Some(reason.clone());
                        gate_failure = Some(reason);
                    }
                    last.gates = report.results;
                }
                match gate_failure {
                    None => TaskOutcome::succeeded(&task, attempts),
                    Some(reason) => TaskOutcome::failed(&task, attempts, reason.to_string()),
                }
            }
            RunStatus::Exhausted => {
                let reason = attempts
                    .last()
                    .and_then(|a| a.failure.as_ref())
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no attempts made".to_string());
                TaskOutcome::failed(&task, attempts, reason)
            }
        };

        self.conclude(&task, outcome)?;
        Ok(true)
    }

    /// A runner that dies takes its attempt history with it; the task fails
    /// with no recorded attempts.
    fn runner_died(&mut self, id: &TaskId, err: JoinError) -> Result<()> {
        let task = self
            .graph
            .task(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let reason = if err.is_panic() {
            format!("runner panicked: {}", panic_message(err.into_panic().as_ref()))
        } else {
            "runner aborted".to_string()
        };
        tracing::error!(run_id = %self.run_id, task = %id, %reason, "task runner died");
        self.conclude(&task, TaskOutcome::failed(&task, Vec::new(), reason))
    }

    /// Record a Succeeded or Failed outcome and block its dependents.
    fn conclude(&mut self, task: &Task, outcome: TaskOutcome) -> Result<()> {
        let id = &task.id;
        let blocked = self.graph.mark_terminal(id, outcome.state.clone())?;
        match &outcome.state {
            TaskState::Succeeded => tracing::info!(
                run_id = %self.run_id,
                task = %id,
                attempts = outcome.attempt_count(),
                "task succeeded"
            ),
            state => tracing::warn!(
                run_id = %self.run_id,
                task = %id,
                attempts = outcome.attempt_count(),
                blocked = blocked.len(),
                %state,
                "task failed"
            ),
        }

        self.finish(task, &outcome);
        for dependent in blocked {
            let by = match self.graph.state(&dependent) {
                Some(TaskState::Blocked { by }) => by.clone(),
                _ => id.clone(),
            };
            if let Some(dependent_task) = self.graph.task(&dependent).cloned() {
                tracing::info!(run_id = %self.run_id, task = %dependent, %by, "task blocked");
                let outcome = TaskOutcome::blocked(&dependent_task, by);
                self.finish(&dependent_task, &outcome);
            }
        }
        Ok(())
    }

    /// Notify observers, record metrics and report to the pattern store.
    fn finish(&self, task: &Task, outcome: &TaskOutcome) {
        let errors = self.callbacks.notify(outcome);
        if errors > 0 {
            tracing::debug!(task = %task.id, errors, "callbacks reported errors");
        }
        self.metrics.record(outcome);
        self.report_pattern(task, outcome);
    }

    fn report_pattern(&self, task: &Task, outcome: &TaskOutcome) {
        let Some(store) = self.patterns.clone() else {
            return;
        };
        match &outcome.state {
            TaskState::Succeeded => {
                let pattern = Pattern::from_success(
                    task,
                    outcome.attempt_count() as u32,
                    outcome.resource_units,
                );
                tokio::spawn(async move {
                    if let Err(err) = store.store_pattern(pattern).await {
                        tracing::warn!(error = %err, "failed to store pattern");
                    }
                });
            }
            TaskState::Failed { reason } => {
                let task_id = task.id.clone();
                let reason = reason.clone();
                tokio::spawn(async move {
                    if let Err(err) = store.record_failure(&task_id, &reason).await {
                        tracing::warn!(task = %task_id, error = %err, "failed to record failure");
                    }
                });
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("tasks", &self.graph.len())
            .field("max_concurrent", &self.config.max_concurrent)
            .field("gates", &self.gates)
            .finish()
    }
}
