//! Run metrics.
//!
//! [`MetricsAggregator`] collects counters while a run is in progress and
//! [`MetricsAggregator::snapshot`] turns them into an immutable [`Metrics`]
//! value. Every derived ratio reports `0.0` when its denominator is zero.

use crate::core::task::TaskState;
use crate::error::Result;
use crate::orchestration::callbacks::TaskOutcome;
use crate::orchestration::executor::FailureReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of a run's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_agents: usize,
    pub success_count: usize,
    /// Failed plus blocked tasks.
    pub failure_count: usize,
    pub blocked_count: usize,
    pub canceled_count: usize,
    /// Tasks left untouched by a canceled run.
    pub not_started_count: usize,
    pub total_wall_time_secs: f64,
    /// Sum of attempt durations across all tasks.
    pub total_execution_time_secs: f64,
    /// Mean over tasks that made at least one attempt.
    pub avg_execution_time_secs: f64,
    pub total_resource_units: u64,
    pub avg_resource_units: f64,
    /// Summed execution time divided by wall time.
    pub parallel_speedup: f64,
    /// Gate name to passes ÷ runs across every attempt that ran it.
    pub gate_pass_rates: BTreeMap<String, f64>,
    pub total_attempts: usize,
    /// Attempts beyond the first, summed over tasks.
    pub retry_count: usize,
    pub timeout_count: usize,
    pub spawn_error_count: usize,
    pub gate_failure_count: usize,
    pub peak_concurrency: usize,
    /// Terminal outcomes per second of wall time.
    pub throughput_per_sec: f64,
}

impl Metrics {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every task reached Succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.success_count == self.total_agents
    }

    /// Tasks accounted for by some terminal or not-started bucket.
    pub fn accounted(&self) -> usize {
        self.success_count + self.failure_count + self.canceled_count + self.not_started_count
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GateTally {
    runs: usize,
    passes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    success: usize,
    failure: usize,
    blocked: usize,
    canceled: usize,
    not_started: usize,
    executed: usize,
    execution_time: Duration,
    resource_units: u64,
    attempts: usize,
    retries: usize,
    timeouts: usize,
    spawn_errors: usize,
    gate_failures: usize,
    peak_concurrency: usize,
    gates: BTreeMap<String, GateTally>,
    started: Option<Instant>,
    stopped: Option<Instant>,
}

/// Concurrent-safe collector behind a single mutex.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<Counters>,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamp the start of the run. Clears any previous stop stamp.
    pub fn start(&self) {
        let mut c = self.lock();
        c.started = Some(Instant::now());
        c.stopped = None;
    }

    pub fn stop(&self) {
        let mut c = self.lock();
        if c.started.is_some() {
            c.stopped = Some(Instant::now());
        }
    }

    pub fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    /// Fold one terminal outcome into the counters.
    pub fn record(&self, outcome: &TaskOutcome) {
        let mut c = self.lock();
        match &outcome.state {
            TaskState::Succeeded => c.success += 1,
            TaskState::Failed { .. } => c.failure += 1,
            TaskState::Blocked { .. } => {
                c.failure += 1;
                c.blocked += 1;
            }
            TaskState::Canceled => c.canceled += 1,
            other => {
                tracing::debug!(task = %outcome.task_id, state = %other, "ignoring non-terminal outcome");
                return;
            }
        }

        if !outcome.attempts.is_empty() {
            c.executed += 1;
        }
        c.execution_time += outcome.execution_time;
        c.resource_units += outcome.resource_units;
        c.attempts += outcome.attempts.len();
        c.retries += outcome.attempts.len().saturating_sub(1);

        for attempt in &outcome.attempts {
            match &attempt.failure {
                Some(FailureReason::Timeout { .. }) => c.timeouts += 1,
                Some(FailureReason::Spawn { .. }) => c.spawn_errors += 1,
                Some(FailureReason::GateFailure { .. }) => c.gate_failures += 1,
                Some(FailureReason::Canceled) | None => {}
            }
            for gate in &attempt.gates {
                let tally = c.gates.entry(gate.name.clone()).or_default();
                tally.runs += 1;
                if gate.passed {
                    tally.passes += 1;
                }
            }
        }
    }

    /// Count tasks a canceled run never started.
    pub fn record_not_started(&self, count: usize) {
        self.lock().not_started += count;
    }

    /// Report the number of tasks currently running.
    pub fn observe_concurrency(&self, running: usize) {
        let mut c = self.lock();
        c.peak_concurrency = c.peak_concurrency.max(running);
    }

    /// Build a snapshot. While running, wall time is measured up to now.
    pub fn snapshot(&self) -> Metrics {
        let c = self.lock();
        let wall = match (c.started, c.stopped) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let wall_secs = wall.as_secs_f64();
        let exec_secs = c.execution_time.as_secs_f64();
        let executed = c.executed as f64;
        let finished = (c.success + c.failure + c.canceled) as f64;

        Metrics {
            total_agents: c.total,
            success_count: c.success,
            failure_count: c.failure,
            blocked_count: c.blocked,
            canceled_count: c.canceled,
            not_started_count: c.not_started,
            total_wall_time_secs: wall_secs,
            total_execution_time_secs: exec_secs,
            avg_execution_time_secs: ratio(exec_secs, executed),
            total_resource_units: c.resource_units,
            avg_resource_units: ratio(c.resource_units as f64, executed),
            parallel_speedup: ratio(exec_secs, wall_secs),
            gate_pass_rates: c
                .gates
                .iter()
                .map(|(name, t)| (name.clone(), ratio(t.passes as f64, t.runs as f64)))
                .collect(),
            total_attempts: c.attempts,
            retry_count: c.retries,
            timeout_count: c.timeouts,
            spawn_error_count: c.spawn_errors,
            gate_failure_count: c.gate_failures,
            peak_concurrency: c.peak_concurrency,
            throughput_per_sec: ratio(finished, wall_secs),
        }
    }
}
