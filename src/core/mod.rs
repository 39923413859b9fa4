//! Core domain models for the coordinator.
//!
//! This module contains the task definitions and the dependency graph that
//! the scheduling loop reads and updates.

pub mod dag;
pub mod task;

pub use dag::TaskGraph;
pub use task::{Task, TaskId, TaskState, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};
