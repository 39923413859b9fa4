//! Dependency-aware concurrent coordination of agent tasks.
//!
//! Register [`Task`]s with a [`Coordinator`], hand it a [`Spawner`] that
//! knows how to perform one attempt, and call [`Coordinator::execute`].

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::{CoordinatorConfig, Plan};
pub use crate::core::{Task, TaskGraph, TaskId, TaskState};
pub use error::{Error, Result};
pub use orchestration::{AttemptPayload, Coordinator, Metrics, Spawner, TaskOutcome};
