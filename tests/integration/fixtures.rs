//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted spawner that records when each task starts and stops
//! - Predefined task graphs
//! - Checking dependency ordering and concurrency from the recorded events

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use convoy::config::CoordinatorConfig;
use convoy::core::{Task, TaskId};
use convoy::orchestration::{AttemptPayload, Coordinator, SpawnError, Spawner};

/// What one attempt of a task does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Work for the spawner's default delay, then succeed.
    Succeed,
    /// Work for the default delay, then return this payload.
    SucceedWith(AttemptPayload),
    /// Work for the default delay, then fail.
    Fail(&'static str),
    /// Work for the given time, then succeed.
    Sleep(Duration),
    /// Block until the attempt is cancelled.
    Hang,
}

/// Something the spawner observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(TaskId),
    Finished(TaskId),
}

/// A [`Spawner`] driven by per-task scripts.
///
/// Tasks without a script (or whose script ran out) use the default step.
pub struct ScriptedSpawner {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    default_step: Step,
    delay: Duration,
    calls: Mutex<HashMap<TaskId, usize>>,
    events: Mutex<Vec<(Instant, Event)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_step: Step::Succeed,
            delay: Duration::from_millis(100),
            calls: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, step: Step) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Script the attempts of one task, in order.
    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(id), steps.into());
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&TaskId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<(Instant, Event)> {
        self.events.lock().unwrap().clone()
    }

    /// Task IDs in the order their first attempt started.
    pub fn start_order(&self) -> Vec<TaskId> {
        let mut order = Vec::new();
        for (_, event) in self.events() {
            if let Event::Started(id) = event {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
        }
        order
    }

    /// Time of the first start and last finish of a task.
    pub fn span(&self, id: &str) -> Option<(Instant, Instant)> {
        let id = TaskId::from(id);
        let events = self.events();
        let start = events
            .iter()
            .find(|(_, e)| *e == Event::Started(id.clone()))
            .map(|(at, _)| *at)?;
        let end = events
            .iter()
            .rev()
            .find(|(_, e)| *e == Event::Finished(id.clone()))
            .map(|(at, _)| *at)?;
        Some((start, end))
    }

    /// Every task that started did so after all its dependencies finished.
    pub fn assert_dependency_order(&self, tasks: &[Task]) {
        let events = self.events();
        let position = |event: &Event| events.iter().position(|(_, e)| e == event);
        for task in tasks {
            let Some(started) = position(&Event::Started(task.id.clone())) else {
                continue;
            };
            for dep in &task.depends_on {
                let finished = events
                    .iter()
                    .rposition(|(_, e)| *e == Event::Finished(dep.clone()))
                    .unwrap_or_else(|| panic!("{} started but dependency {} never finished", task.id, dep));
                assert!(
                    finished < started,
                    "{} started before dependency {} finished",
                    task.id,
                    dep
                );
            }
        }
    }

    fn next_step(&self, id: &TaskId) -> Step {
        *self.calls.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        self.scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or_else(|| self.default_step.clone())
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push((Instant::now(), event));
    }
}

impl Default for ScriptedSpawner {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a task running for as long as the attempt future is alive.
struct RunningGuard<'a> {
    spawner: &'a ScriptedSpawner,
    id: TaskId,
}

impl<'a> RunningGuard<'a> {
    fn enter(spawner: &'a ScriptedSpawner, id: TaskId) -> Self {
        let now = spawner.running.fetch_add(1, Ordering::SeqCst) + 1;
        spawner.peak.fetch_max(now, Ordering::SeqCst);
        spawner.record(Event::Started(id.clone()));
        Self { spawner, id }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.spawner.record(Event::Finished(self.id.clone()));
        self.spawner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn work(cancel: &CancellationToken, duration: Duration) -> Result<(), SpawnError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SpawnError::from("cancelled")),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[async_trait]
impl Spawner for ScriptedSpawner {
    async fn spawn(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<AttemptPayload, SpawnError> {
        let step = self.next_step(&task.id);
        let _guard = RunningGuard::enter(self, task.id.clone());
        let default_payload = || AttemptPayload::new(&format!("{} done", task.title)).with_resource_units(10);

        match step {
            Step::Succeed => {
                work(&cancel, self.delay).await?;
                Ok(default_payload())
            }
            Step::SucceedWith(payload) => {
                work(&cancel, self.delay).await?;
                Ok(payload)
            }
            Step::Fail(message) => {
                work(&cancel, self.delay).await?;
                Err(SpawnError::from(message))
            }
            Step::Sleep(duration) => {
                work(&cancel, duration).await?;
                Ok(default_payload())
            }
            Step::Hang => {
                cancel.cancelled().await;
                Err(SpawnError::from("cancelled"))
            }
        }
    }
}

/// A task with no retries and a short timeout.
pub fn test_task(id: &str) -> Task {
    Task::new(id, &format!("Task {}", id)).with_max_retries(0).with_timeout_secs(30)
}

/// `count` tasks with no dependencies: t0, t1, ...
pub fn independent_tasks(count: usize) -> Vec<Task> {
    (0..count).map(|i| test_task(&format!("t{}", i))).collect()
}

/// A -> {B, C} -> D
pub fn diamond() -> Vec<Task> {
    vec![
        test_task("a"),
        test_task("b").depends_on("a"),
        test_task("c").depends_on("a"),
        test_task("d").depends_on("b").depends_on("c"),
    ]
}

/// A -> B -> C
pub fn chain() -> Vec<Task> {
    vec![
        test_task("a"),
        test_task("b").depends_on("a"),
        test_task("c").depends_on("b"),
    ]
}

/// A deterministic pseudo-random DAG: task `i` may depend on any `j < i`.
pub fn random_dag(seed: u64, size: usize) -> Vec<Task> {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..size)
        .map(|i| {
            let mut task = test_task(&format!("n{}", i));
            for j in 0..i {
                if next() % 4 == 0 {
                    task = task.depends_on(format!("n{}", j));
                }
            }
            task
        })
        .collect()
}

pub fn config(max_concurrent: usize) -> CoordinatorConfig {
    CoordinatorConfig::default().with_max_concurrent(max_concurrent)
}

/// A coordinator with `tasks` registered.
pub fn coordinator_with(
    max_concurrent: usize,
    spawner: Arc<ScriptedSpawner>,
    tasks: &[Task],
) -> Coordinator {
    let mut coordinator = Coordinator::new(config(max_concurrent), spawner);
    for task in tasks {
        coordinator
            .add_agent(task.clone())
            .expect("Failed to register task");
    }
    coordinator
}
