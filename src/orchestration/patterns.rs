//! Learning store for successful approaches and failure causes.
//!
//! The coordinator reports to a [`PatternStore`] on a best-effort basis:
//! calls run on detached tasks and their errors are only logged.

use crate::core::task::{Task, TaskId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// What worked for one task, keyed by task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub task_type: String,
    pub task_id: TaskId,
    pub summary: String,
    /// Attempts the task needed.
    pub attempts: u32,
    pub resource_units: u64,
    pub recorded_at: DateTime<Utc>,
}

impl Pattern {
    /// Describe a succeeded task.
    pub fn from_success(task: &Task, attempts: u32, resource_units: u64) -> Self {
        Self {
            task_type: task.task_type().to_string(),
            task_id: task.id.clone(),
            summary: task.title.clone(),
            attempts,
            resource_units,
            recorded_at: Utc::now(),
        }
    }
}

/// A recorded root cause for a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub root_cause: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn store_pattern(&self, pattern: Pattern) -> Result<()>;

    /// Patterns recorded for `task_type`, oldest first.
    async fn get_patterns(&self, task_type: &str) -> Result<Vec<Pattern>>;

    async fn record_failure(&self, task_id: &TaskId, root_cause: &str) -> Result<()>;
}

/// Process-local [`PatternStore`].
#[derive(Debug, Default)]
pub struct InMemoryPatternStore {
    patterns: RwLock<Vec<Pattern>>,
    failures: RwLock<Vec<FailureRecord>>,
}

impl InMemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.failures.read().await.clone()
    }

    pub async fn pattern_count(&self) -> usize {
        self.patterns.read().await.len()
    }
}

#[async_trait]
impl PatternStore for InMemoryPatternStore {
    async fn store_pattern(&self, pattern: Pattern) -> Result<()> {
        tracing::debug!(task = %pattern.task_id, task_type = %pattern.task_type, "storing pattern");
        self.patterns.write().await.push(pattern);
        Ok(())
    }

    async fn get_patterns(&self, task_type: &str) -> Result<Vec<Pattern>> {
        Ok(self
            .patterns
            .read()
            .await
            .iter()
            .filter(|p| p.task_type == task_type)
            .cloned()
            .collect())
    }

    async fn record_failure(&self, task_id: &TaskId, root_cause: &str) -> Result<()> {
        self.failures.write().await.push(FailureRecord {
            task_id: task_id.clone(),
            root_cause: root_cause.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
