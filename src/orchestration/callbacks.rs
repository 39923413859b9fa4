//! Success and failure observers.
//!
//! The coordinator owns a [`CallbackRegistry`] and calls
//! [`CallbackRegistry::notify`] once per terminal task outcome, before it
//! lets dependents move on. Observers are for side effects such as
//! reporting; an observer error is logged and otherwise ignored.

use crate::core::task::{Task, TaskId, TaskState};
use crate::orchestration::executor::{AttemptResult, FailureReason};
use crate::orchestration::gates::GateResult;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// Final record for one task, handed to observers and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub title: String,
    /// Terminal state: Succeeded, Failed, Blocked or Canceled.
    pub state: TaskState,
    /// Every attempt made, in order. Empty for blocked tasks.
    pub attempts: Vec<AttemptResult>,
    /// Sum of attempt durations.
    pub execution_time: Duration,
    /// Resource units reported by successful attempts.
    pub resource_units: u64,
    /// Human-readable failure cause.
    pub error: Option<String>,
}

impl TaskOutcome {
    fn from_attempts(
        task: &Task,
        state: TaskState,
        attempts: Vec<AttemptResult>,
        error: Option<String>,
    ) -> Self {
        let execution_time = attempts.iter().map(|a| a.elapsed).sum();
        let resource_units = attempts
            .iter()
            .filter_map(|a| a.payload.as_ref())
            .map(|p| p.resource_units)
            .sum();
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            state,
            attempts,
            execution_time,
            resource_units,
            error,
        }
    }

    pub fn succeeded(task: &Task, attempts: Vec<AttemptResult>) -> Self {
        Self::from_attempts(task, TaskState::Succeeded, attempts, None)
    }

    pub fn failed(task: &Task, attempts: Vec<AttemptResult>, reason: String) -> Self {
        Self::from_attempts(
            task,
            TaskState::Failed {
                reason: reason.clone(),
            },
            attempts,
            Some(reason),
        )
    }

    pub fn blocked(task: &Task, by: TaskId) -> Self {
        let error = format!("dependency {} did not succeed", by);
        Self::from_attempts(task, TaskState::Blocked { by }, Vec::new(), Some(error))
    }

    pub fn canceled(task: &Task, attempts: Vec<AttemptResult>) -> Self {
        Self::from_attempts(
            task,
            TaskState::Canceled,
            attempts,
            Some("run canceled".to_string()),
        )
    }

    pub fn is_success(&self) -> bool {
        self.state.is_succeeded()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Gate results across all attempts.
    pub fn gate_results(&self) -> impl Iterator<Item = &GateResult> {
        self.attempts.iter().flat_map(|a| a.gates.iter())
    }

    /// Number of attempts that failed with the given kind of reason.
    pub fn count_failures(&self, predicate: impl Fn(&FailureReason) -> bool) -> usize {
        self.attempts
            .iter()
            .filter_map(|a| a.failure.as_ref())
            .filter(|f| predicate(f))
            .count()
    }
}

/// Result type for observers.
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Observer = Box<dyn Fn(&TaskOutcome) -> CallbackResult + Send + Sync>;

/// Ordered lists of success and failure observers.
#[derive(Default)]
pub struct CallbackRegistry {
    success: Vec<Observer>,
    failure: Vec<Observer>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for succeeded tasks.
    pub fn on_success<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&TaskOutcome) -> CallbackResult + Send + Sync + 'static,
    {
        self.success.push(Box::new(f));
        self
    }

    /// Register an observer for failed and blocked tasks.
    pub fn on_failure<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&TaskOutcome) -> CallbackResult + Send + Sync + 'static,
    {
        self.failure.push(Box::new(f));
        self
    }

    pub fn success_count(&self) -> usize {
        self.success.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failure.len()
    }

    /// Invoke every observer matching `outcome`, in registration order.
    ///
    /// Canceled outcomes reach no observer. Returns how many observers
    /// returned an error or panicked.
    pub fn notify(&self, outcome: &TaskOutcome) -> usize {
        let observers = match &outcome.state {
            TaskState::Succeeded => &self.success,
            TaskState::Failed { .. } | TaskState::Blocked { .. } => &self.failure,
            _ => return 0,
        };

        let mut errors = 0;
        for (position, observer) in observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer(outcome))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    errors += 1;
                    tracing::warn!(
                        task = %outcome.task_id,
                        observer = position,
                        error = %err,
                        "callback returned an error"
                    );
                }
                Err(_) => {
                    errors += 1;
                    tracing::error!(
                        task = %outcome.task_id,
                        observer = position,
                        "callback panicked"
                    );
                }
            }
        }
        errors
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("success", &self.success.len())
            .field("failure", &self.failure.len())
            .finish()
    }
}
