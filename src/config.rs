use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::{Task, TaskId, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};
use crate::{Error, Result};

/// Concurrency ceiling used when the config does not set one.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of tasks running at once. Must be > 0.
    pub max_concurrent: usize,
    /// Retry budget for tasks that do not set their own.
    pub default_max_retries: u32,
    /// Per-attempt timeout for tasks that do not set their own.
    pub default_timeout_secs: u64,
    /// Pause between failed attempts of the same task.
    pub retry_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_backoff_ms: 0,
        }
    }
}

impl CoordinatorConfig {
    pub fn convoy_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".convoy"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::convoy_dir()?.join("convoy.toml"))
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Build a task carrying this config's retry and timeout defaults.
    pub fn task(&self, id: impl Into<TaskId>, title: &str) -> Task {
        Task::new(id, title)
            .with_max_retries(self.default_max_retries)
            .with_timeout_secs(self.default_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Validation(
                "default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading coordinator config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `~/.convoy/convoy.toml`, falling back to defaults when absent.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }
}

/// One `[[task]]` entry of a plan file.
///
/// Retry and timeout fall back to the plan's coordinator defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl TaskEntry {
    pub fn to_task(&self, defaults: &CoordinatorConfig) -> Task {
        let mut task = defaults.task(self.id.clone(), &self.title);
        task.description = self.description.clone();
        task.acceptance_criteria = self.acceptance_criteria.clone();
        for dep in &self.depends_on {
            task = task.depends_on(dep.clone());
        }
        if let Some(retries) = self.max_retries {
            task.max_retries = retries;
        }
        if let Some(secs) = self.timeout_secs {
            task.timeout_secs = secs;
        }
        task.kind = self.kind.clone();
        task
    }
}

/// A coordinator config plus the tasks to run.
///
/// ```toml
/// [coordinator]
/// max_concurrent = 2
///
/// [[task]]
/// id = "schema"
/// title = "Design schema"
///
/// [[task]]
/// id = "api"
/// title = "Build API"
/// depends_on = ["schema"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

impl Plan {
    pub fn parse(content: &str) -> Result<Self> {
        let plan: Self = toml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading plan");
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        for task in self.tasks() {
            task.validate()?;
        }
        Ok(())
    }

    /// Tasks with defaults applied, in file order.
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|entry| entry.to_task(&self.coordinator))
            .collect()
    }
}
