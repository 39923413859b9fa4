use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid gate pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task graph is finalized; no more tasks can be added")]
    GraphFinalized,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Run canceled before any task completed")]
    Canceled,

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },
}

impl Error {
    /// Errors that reject the task graph before anything is dispatched.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTask(_)
                | Error::UnknownDependency { .. }
                | Error::CyclicDependency { .. }
                | Error::GraphFinalized
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
