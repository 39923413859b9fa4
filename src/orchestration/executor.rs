//! Retrying executor for a single task.
//!
//! The executor calls an injected [`Spawner`] up to `max_retries + 1` times.
//! Each attempt runs under its own timeout and its own child cancellation
//! token, so a timed-out attempt is told to stop without affecting the rest
//! of the run. The executor returns everything it observed in a
//! [`RunReport`] and touches no shared state.

use crate::core::task::Task;
use crate::orchestration::gates::GateResult;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a successful attempt produced.
///
/// The coordinator treats this as opaque except for `resource_units`, which
/// feeds the metrics, and whatever the configured gates inspect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptPayload {
    /// Raw agent output.
    pub output: String,
    /// Resource usage reported by the agent (tokens, credits, ...).
    pub resource_units: u64,
    /// Files or other artifacts the attempt modified.
    pub artifacts: Vec<PathBuf>,
    /// Free-form structured data.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AttemptPayload {
    pub fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            ..Self::default()
        }
    }

    pub fn with_resource_units(mut self, units: u64) -> Self {
        self.resource_units = units;
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Error returned by a [`Spawner`] when the attempt itself could not run.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<String> for SpawnError {
    fn from(message: String) -> Self {
        SpawnError::Failed(message)
    }
}

impl From<&str> for SpawnError {
    fn from(message: &str) -> Self {
        SpawnError::Failed(message.to_string())
    }
}

/// Why an attempt did not count as a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// The spawner returned an error or panicked.
    Spawn { message: String },
    /// The attempt exceeded the task's timeout.
    Timeout { after_secs: u64 },
    /// The attempt ran but one or more gates rejected it.
    GateFailure { gates: Vec<String> },
    /// The run was canceled while the attempt was in flight.
    Canceled,
}

impl FailureReason {
    /// Transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Spawn { .. } | FailureReason::Timeout { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Spawn { message } => write!(f, "spawn error: {}", message),
            FailureReason::Timeout { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureReason::GateFailure { gates } => {
                write!(f, "gate failure: {}", gates.join(", "))
            }
            FailureReason::Canceled => write!(f, "canceled"),
        }
    }
}

/// Record of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    /// 1-based attempt number.
    pub attempt: u32,
    pub success: bool,
    pub elapsed: Duration,
    pub failure: Option<FailureReason>,
    pub payload: Option<AttemptPayload>,
    /// Gate results, filled in by the coordinator for the attempt it judged.
    #[serde(default)]
    pub gates: Vec<GateResult>,
}

impl AttemptResult {
    fn succeeded(attempt: u32, elapsed: Duration, payload: AttemptPayload) -> Self {
        Self {
            attempt,
            success: true,
            elapsed,
            failure: None,
            payload: Some(payload),
            gates: Vec::new(),
        }
    }

    fn failed(attempt: u32, elapsed: Duration, reason: FailureReason) -> Self {
        Self {
            attempt,
            success: false,
            elapsed,
            failure: Some(reason),
            payload: None,
            gates: Vec::new(),
        }
    }
}

/// How an attempt sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The last attempt succeeded.
    Succeeded,
    /// Every attempt in the budget failed.
    Exhausted,
    /// The outer token was cancelled.
    Canceled,
}

/// Everything the executor observed for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub attempts: Vec<AttemptResult>,
}

impl RunReport {
    /// Payload of the successful attempt, if any.
    pub fn payload(&self) -> Option<&AttemptPayload> {
        self.attempts
            .last()
            .filter(|a| a.success)
            .and_then(|a| a.payload.as_ref())
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Sum of all attempt durations.
    pub fn execution_time(&self) -> Duration {
        self.attempts.iter().map(|a| a.elapsed).sum()
    }

    /// Failure of the final attempt.
    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.attempts.last().and_then(|a| a.failure.as_ref())
    }
}

/// Capability to perform a task's work.
///
/// Implementations must return promptly once `cancel` is cancelled and must
/// not keep references to the task after returning.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<AttemptPayload, SpawnError>;
}

/// [`Spawner`] backed by a closure.
///
/// # Example
///
/// ```ignore
/// use convoy::orchestration::{AttemptPayload, FnSpawner};
///
/// let spawner = FnSpawner::new(|_cancel, task| async move {
///     Ok(AttemptPayload::new(&format!("done: {}", task.title)))
/// });
/// ```
pub struct FnSpawner<F> {
    f: F,
}

impl<F, Fut> FnSpawner<F>
where
    F: Fn(CancellationToken, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AttemptPayload, SpawnError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Spawner for FnSpawner<F>
where
    F: Fn(CancellationToken, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AttemptPayload, SpawnError>> + Send + 'static,
{
    async fn spawn(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<AttemptPayload, SpawnError> {
        (self.f)(cancel, task.clone()).await
    }
}

/// Runs one task's attempt sequence.
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    /// Pause between a failed attempt and the next one.
    backoff: Duration,
}

impl RetryingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Attempt `task` until it succeeds, the budget runs out, or `cancel`
    /// fires.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        spawner: &dyn Spawner,
    ) -> RunReport {
        let budget = task.max_attempts();
        let timeout = task.timeout();
        let mut attempts = Vec::new();

        for attempt in 1..=budget {
            if cancel.is_cancelled() {
                return RunReport {
                    status: RunStatus::Canceled,
                    attempts,
                };
            }

            tracing::debug!(task = %task.id, attempt, budget, "starting attempt");
            let attempt_token = cancel.child_token();
            let started = Instant::now();
            let spawn_token = attempt_token.clone();
            let call =
                AssertUnwindSafe(async move { spawner.spawn(spawn_token, task).await }).catch_unwind();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(timeout, call) => Some(res),
            };
            let elapsed = started.elapsed();

            let reason = match outcome {
                None => {
                    attempt_token.cancel();
                    tracing::info!(task = %task.id, attempt, "attempt canceled");
                    attempts.push(AttemptResult::failed(attempt, elapsed, FailureReason::Canceled));
                    return RunReport {
                        status: RunStatus::Canceled,
                        attempts,
                    };
                }
                Some(Err(_)) => {
                    attempt_token.cancel();
                    FailureReason::Timeout {
                        after_secs: task.timeout_secs,
                    }
                }
                Some(Ok(Err(panic))) => FailureReason::Spawn {
                    message: format!("spawner panicked: {}", panic_message(panic.as_ref())),
                },
                Some(Ok(Ok(Err(err)))) => FailureReason::Spawn {
                    message: err.to_string(),
                },
                Some(Ok(Ok(Ok(payload)))) => {
                    if attempt > 1 {
                        tracing::info!(task = %task.id, attempt, "attempt succeeded after retry");
                    } else {
                        tracing::debug!(task = %task.id, attempt, "attempt succeeded");
                    }
                    attempts.push(AttemptResult::succeeded(attempt, elapsed, payload));
                    return RunReport {
                        status: RunStatus::Succeeded,
                        attempts,
                    };
                }
            };

            tracing::warn!(task = %task.id, attempt, budget, reason = %reason, "attempt failed");
            attempts.push(AttemptResult::failed(attempt, elapsed, reason));

            if attempt < budget && !self.backoff.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return RunReport {
                            status: RunStatus::Canceled,
                            attempts,
                        };
                    }
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        RunReport {
            status: RunStatus::Exhausted,
            attempts,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
