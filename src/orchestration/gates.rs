//! Post-execution validation gates.
//!
//! A [`GatePipeline`] runs a fixed, ordered list of named checks against the
//! payload of a successful attempt. The task only counts as succeeded when
//! every gate passes. All gates run so the metrics see a complete picture,
//! unless a failing gate is marked fail-fast.

use crate::error::Result;
use crate::orchestration::executor::{panic_message, AttemptPayload};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Outcome of one gate on one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub duration: Duration,
}

/// What a gate decided when it was able to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub message: String,
}

impl GateVerdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// A named check over an attempt payload.
///
/// Gates must be pure functions of the payload. Returning `Err` means the
/// gate could not decide; the pipeline records that as a failure.
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String>;

    /// Stop evaluating later gates when this one fails.
    fn fail_fast(&self) -> bool {
        false
    }
}

/// [`Gate`] backed by a closure.
pub struct FnGate<F> {
    name: String,
    fail_fast: bool,
    f: F,
}

impl<F> FnGate<F>
where
    F: Fn(&AttemptPayload) -> std::result::Result<GateVerdict, String> + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            fail_fast: false,
            f,
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

impl<F> Gate for FnGate<F>
where
    F: Fn(&AttemptPayload) -> std::result::Result<GateVerdict, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String> {
        (self.f)(payload)
    }

    fn fail_fast(&self) -> bool {
        self.fail_fast
    }
}

/// Fails when the agent produced only whitespace.
#[derive(Debug, Clone, Default)]
pub struct NonEmptyOutput;

impl Gate for NonEmptyOutput {
    fn name(&self) -> &str {
        "non_empty_output"
    }

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String> {
        if payload.output.trim().is_empty() {
            Ok(GateVerdict::fail("output is empty"))
        } else {
            Ok(GateVerdict::pass(format!("{} bytes of output", payload.output.len())))
        }
    }
}

/// Fails when the attempt reports no modified artifacts.
#[derive(Debug, Clone, Default)]
pub struct RequireArtifacts;

impl Gate for RequireArtifacts {
    fn name(&self) -> &str {
        "require_artifacts"
    }

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String> {
        match payload.artifacts.len() {
            0 => Ok(GateVerdict::fail("no artifacts modified")),
            n => Ok(GateVerdict::pass(format!("{} artifacts modified", n))),
        }
    }
}

/// Fails when the attempt used more resource units than allowed.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    max_units: u64,
}

impl ResourceBudget {
    pub fn new(max_units: u64) -> Self {
        Self { max_units }
    }
}

impl Gate for ResourceBudget {
    fn name(&self) -> &str {
        "resource_budget"
    }

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String> {
        let used = payload.resource_units;
        if used > self.max_units {
            Ok(GateVerdict::fail(format!(
                "used {} units, budget is {}",
                used, self.max_units
            )))
        } else {
            Ok(GateVerdict::pass(format!("used {} of {} units", used, self.max_units)))
        }
    }
}

/// Fails when the output does not match a regular expression.
#[derive(Debug, Clone)]
pub struct OutputMatches {
    name: String,
    pattern: Regex,
}

impl OutputMatches {
    /// # Errors
    /// Returns [`crate::Error::InvalidPattern`] if `pattern` does not compile.
    pub fn new(name: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }
}

impl Gate for OutputMatches {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, payload: &AttemptPayload) -> std::result::Result<GateVerdict, String> {
        if self.pattern.is_match(&payload.output) {
            Ok(GateVerdict::pass(format!("output matches /{}/", self.pattern)))
        } else {
            Ok(GateVerdict::fail(format!(
                "output does not match /{}/",
                self.pattern
            )))
        }
    }
}

/// Results of running the pipeline once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
    /// Logical AND of every result that ran.
    pub passed: bool,
}

impl GateReport {
    /// Names of the gates that failed.
    pub fn failed_gates(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.clone())
            .collect()
    }
}

/// Ordered set of gates applied to every successful attempt.
#[derive(Default)]
pub struct GatePipeline {
    gates: Vec<Box<dyn Gate>>,
}

impl GatePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a gate. Gates run in the order they were added.
    pub fn with_gate(mut self, gate: impl Gate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn push(&mut self, gate: Box<dyn Gate>) {
        self.gates.push(gate);
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// Run every gate against `payload`.
    ///
    /// An empty pipeline passes. A gate that errors or panics counts as
    /// failed.
    pub fn evaluate(&self, payload: &AttemptPayload) -> GateReport {
        let mut results = Vec::with_capacity(self.gates.len());
        let mut passed = true;

        for gate in &self.gates {
            let started = Instant::now();
            let (ok, message) = match catch_unwind(AssertUnwindSafe(|| gate.check(payload))) {
                Ok(Ok(verdict)) => (verdict.passed, verdict.message),
                Ok(Err(err)) => (false, err),
                Err(panic) => {
                    tracing::error!(gate = gate.name(), "gate panicked");
                    (false, format!("gate panicked: {}", panic_message(panic.as_ref())))
                }
            };
            let duration = started.elapsed();

            tracing::debug!(gate = gate.name(), passed = ok, %message, "gate evaluated");
            results.push(GateResult {
                name: gate.name().to_string(),
                passed: ok,
                message,
                duration,
            });
            passed &= ok;

            if !ok && gate.fail_fast() {
                break;
            }
        }

        GateReport { results, passed }
    }
}

impl std::fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePipeline")
            .field("gates", &self.names())
            .finish()
    }
}
