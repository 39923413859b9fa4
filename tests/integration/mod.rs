//! Integration test suite for convoy.
//!
//! These tests drive full coordinator runs against a scripted spawner and
//! check the observable guarantees: dependency ordering, the concurrency
//! ceiling, retry budgets, gate handling, cancellation and metrics.
//!
//! # Test Categories
//!
//! - `scheduling`: Dependency ordering and concurrency ceiling
//! - `retries`: Retry budgets, timeouts and failure propagation
//! - `gates`: Gate pipeline inside a run
//! - `cancellation`: External cancellation and draining
//! - `metrics`: Metrics, callbacks and plan files
//!
//! Timing-sensitive tests run on paused tokio time, so they are
//! deterministic and fast.

mod fixtures;

mod cancellation;
mod gates;
