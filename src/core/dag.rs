//! Task graph for dependency management.
//!
//! [`TaskGraph`] stores task definitions in insertion order next to their
//! lifecycle state and, once validated, a petgraph `DiGraph` whose edges run
//! from a dependency to its dependent. Node indices mirror insertion order,
//! so the graph doubles as the arena used for readiness checks and for
//! blocking dependents when a task fails.

use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph plus per-task state.
pub struct TaskGraph {
    /// Node weights are task IDs; node `i` is `tasks[i]`.
    graph: DiGraph<TaskId, ()>,
    /// Task definitions in registration order.
    tasks: Vec<Task>,
    /// Lifecycle state, parallel to `tasks`.
    states: Vec<TaskState>,
    /// Lookup from ID to arena slot.
    index: HashMap<TaskId, usize>,
    /// Set once edges are resolved and the graph is proven acyclic.
    finalized: bool,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            tasks: Vec::new(),
            states: Vec::new(),
            index: HashMap::new(),
            finalized: false,
        }
    }

    /// Register a task.
    ///
    /// Dependencies may name tasks that are registered later; they are
    /// resolved by [`TaskGraph::validate`].
    ///
    /// # Errors
    /// - [`Error::GraphFinalized`] once the graph has been validated
    /// - [`Error::DuplicateTask`] if the ID is already registered
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.finalized {
            return Err(Error::GraphFinalized);
        }
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let slot = self.tasks.len();
        let node = self.graph.add_node(task.id.clone());
        debug_assert_eq!(node.index(), slot);

        self.index.insert(task.id.clone(), slot);
        self.tasks.push(task);
        self.states.push(TaskState::Pending);
        Ok(())
    }

    /// Resolve dependency edges and check the graph for cycles.
    ///
    /// Calling this again after success is a no-op. On failure the graph is
    /// left without edges and can be fixed up with further `add_task` calls.
    ///
    /// # Errors
    /// - [`Error::UnknownDependency`] if a dependency ID was never registered
    /// - [`Error::CyclicDependency`] carrying one offending cycle
    pub fn validate(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        let mut edges = Vec::new();
        for (slot, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let &dep_slot = self.index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                edges.push((NodeIndex::new(dep_slot), NodeIndex::new(slot)));
            }
        }

        for (from, to) in edges {
            self.graph.add_edge(from, to, ());
        }

        if let Some(cycle) = self.find_cycle() {
            self.graph.clear_edges();
            return Err(Error::CyclicDependency { cycle });
        }

        self.finalized = true;
        Ok(())
    }

    /// Whether [`TaskGraph::validate`] has succeeded.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .min_by_key(|component| component.iter().map(|n| n.index()).min())
            .map(|component| self.trace_cycle(&component))
    }

    /// Walk a strongly connected component until a node repeats.
    fn trace_cycle(&self, component: &[NodeIndex]) -> Vec<TaskId> {
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let Some(&start) = component.iter().min() else {
            return Vec::new();
        };

        let mut path: Vec<NodeIndex> = Vec::new();
        let mut seen: HashMap<NodeIndex, usize> = HashMap::new();
        let mut current = start;

        loop {
            if let Some(&pos) = seen.get(&current) {
                return path[pos..]
                    .iter()
                    .map(|&n| self.graph[n].clone())
                    .collect();
            }
            seen.insert(current, path.len());
            path.push(current);

            match self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .min()
            {
                Some(next) => current = next,
                None => break,
            }
        }

        path.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    fn slot(&self, id: &TaskId) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Get a task definition by ID.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&slot| &self.tasks[slot])
    }

    /// Get the current state of a task.
    pub fn state(&self, id: &TaskId) -> Option<&TaskState> {
        self.index.get(id).map(|&slot| &self.states[slot])
    }

    /// All tasks in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Snapshot of every task's state in registration order.
    pub fn states(&self) -> Vec<(TaskId, TaskState)> {
        self.tasks
            .iter()
            .zip(&self.states)
            .map(|(task, state)| (task.id.clone(), state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of resolved dependency edges (zero before validation).
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependencies of a task, as declared.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.task(id)
            .map(|task| task.depends_on.clone())
            .unwrap_or_default()
    }

    /// Tasks that directly depend on `id`, in registration order.
    ///
    /// Empty until the graph has been validated.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&slot) => self
                .dependent_slots(slot)
                .into_iter()
                .map(|s| self.tasks[s].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn dependent_slots(&self, slot: usize) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(slot), Direction::Outgoing)
            .map(|n| n.index())
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies have all succeeded, in registration
    /// order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .zip(&self.states)
            .filter(|(_, state)| matches!(state, TaskState::Pending))
            .filter(|(task, _)| {
                task.depends_on.iter().all(|dep| {
                    self.index
                        .get(dep)
                        .map(|&slot| self.states[slot].is_succeeded())
                        .unwrap_or(false)
                })
            })
            .map(|(task, _)| task.id.clone())
            .collect()
    }

    /// Tasks waiting for a concurrency slot, in registration order.
    pub fn queued_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .zip(&self.states)
            .filter(|(_, state)| matches!(state, TaskState::Ready))
            .map(|(task, _)| task.id.clone())
            .collect()
    }

    fn transition(&mut self, id: &TaskId, from: &[TaskState], to: TaskState) -> Result<()> {
        let slot = self.slot(id)?;
        let current = &self.states[slot];
        if !from.contains(current) {
            return Err(Error::Validation(format!(
                "task {} cannot move from {} to {}",
                id, current, to
            )));
        }
        self.states[slot] = to;
        Ok(())
    }

    /// Pending → Ready.
    pub fn mark_ready(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, &[TaskState::Pending], TaskState::Ready)
    }

    /// Ready → Running.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, &[TaskState::Ready], TaskState::Running)
    }

    /// Running → Canceled.
    pub fn mark_canceled(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, &[TaskState::Running], TaskState::Canceled)
    }

    /// Return every Ready task to Pending. Used when a run stops before
    /// those tasks got a slot.
    pub fn reset_ready(&mut self) -> usize {
        let mut reset = 0;
        for state in self.states.iter_mut() {
            if matches!(state, TaskState::Ready) {
                *state = TaskState::Pending;
                reset += 1;
            }
        }
        reset
    }

    /// Record a terminal state for a task.
    ///
    /// When the state is a failure, every transitive dependent that is not
    /// already terminal becomes `Blocked`. Returns the newly blocked IDs in
    /// breadth-first, registration order. A task that is already terminal is
    /// left untouched and nothing is blocked.
    pub fn mark_terminal(&mut self, id: &TaskId, state: TaskState) -> Result<Vec<TaskId>> {
        if !state.is_terminal() {
            return Err(Error::Validation(format!(
                "{} is not a terminal state for task {}",
                state, id
            )));
        }

        let slot = self.slot(id)?;
        if self.states[slot].is_terminal() {
            return Ok(Vec::new());
        }

        let propagate = state.is_failure();
        self.states[slot] = state;
        if !propagate {
            return Ok(Vec::new());
        }

        let mut blocked = Vec::new();
        let mut queue = VecDeque::from([slot]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependent_slots(current) {
                if self.states[dependent].is_terminal() {
                    continue;
                }
                self.states[dependent] = TaskState::Blocked {
                    by: self.tasks[current].id.clone(),
                };
                blocked.push(self.tasks[dependent].id.clone());
                queue.push_back(dependent);
            }
        }

        Ok(blocked)
    }

    /// Count tasks whose state satisfies `predicate`.
    pub fn count_in(&self, predicate: impl Fn(&TaskState) -> bool) -> usize {
        self.states.iter().filter(|s| predicate(s)).count()
    }

    /// No task is Pending, Ready or Running.
    pub fn is_settled(&self) -> bool {
        self.states.iter().all(|s| !s.is_active())
    }

    /// Tasks in dependency order.
    ///
    /// # Errors
    /// Returns an error if the graph has not been validated.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        if !self.finalized {
            return Err(Error::Validation(
                "task graph must be validated before ordering".to_string(),
            ));
        }
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            cycle: vec![self.graph[cycle.node_id()].clone()],
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n].clone()).collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .field("finalized", &self.finalized)
            .finish()
    }
}
