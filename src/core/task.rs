//! Task data model for the execution graph.
//!
//! A [`Task`] is the immutable definition of one agent invocation: what to
//! do, what it depends on, and how hard to try. Its mutable lifecycle is
//! tracked separately as a [`TaskState`] owned by the coordinator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-attempt timeout applied when a task does not set one (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Retry budget applied when a task does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Caller-chosen identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Task state in its lifecycle.
///
/// `Succeeded`, `Failed`, `Blocked` and `Canceled` are terminal for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Registered, dependencies not yet satisfied.
    Pending,
    /// Dependencies satisfied, waiting for a concurrency slot.
    Ready,
    /// Attempt sequence in flight.
    Running,
    /// Attempt succeeded and every gate passed.
    Succeeded,
    /// Retries exhausted or a gate rejected the result.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// A dependency failed; the task is never attempted.
    Blocked {
        /// The failed or blocked dependency that caused this.
        by: TaskId,
    },
    /// The run was canceled while this task's attempts were in flight.
    Canceled,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed { .. }
                | TaskState::Blocked { .. }
                | TaskState::Canceled
        )
    }

    /// Failed or blocked: counts against the run and blocks dependents.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed { .. } | TaskState::Blocked { .. })
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskState::Succeeded)
    }

    /// Still has work ahead of it in the current run.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Ready | TaskState::Running
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed { reason } => write!(f, "failed: {}", reason),
            TaskState::Blocked { by } => write!(f, "blocked by {}", by),
            TaskState::Canceled => write!(f, "canceled"),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A single unit of agent work.
///
/// Built once at registration time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within a coordinator.
    pub id: TaskId,
    /// Short human-readable title.
    pub title: String,
    /// What the agent should accomplish.
    #[serde(default)]
    pub description: String,
    /// Free-form acceptance criteria handed to the agent.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Tasks that must succeed before this one may start.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Extra attempts after the first one fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound for a single attempt, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Task type used to key learned patterns.
    #[serde(default)]
    pub kind: Option<String>,
}

impl Task {
    /// Create a task with no dependencies and the default retry policy.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            kind: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_criterion(mut self, criterion: &str) -> Self {
        self.acceptance_criteria.push(criterion.to_string());
        self
    }

    /// Add a dependency. Repeated IDs are ignored.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Total number of attempts the executor may make, `max_retries + 1`.
    ///
    /// [`Task::validate`] rejects `u32::MAX` retries, so this never saturates
    /// for a registered task.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Task type for pattern lookup, `"general"` when unset.
    pub fn task_type(&self) -> &str {
        self.kind.as_deref().unwrap_or("general")
    }

    /// Check the registration constraints on a single task.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Validation(format!(
                "task {} has timeout_secs = 0; must be > 0",
                self.id
            )));
        }
        if self.max_retries == u32::MAX {
            return Err(Error::Validation(format!(
                "task {} has max_retries = {}; must be below that",
                self.id,
                u32::MAX
            )));
        }
        Ok(())
    }
}
