//! Task dependency graph
//!
//! An edge `d -> t` means `d` must complete before `t` may start. The graph
//! is purely structural and grows additively: dependencies on tasks that
//! were never added become placeholder nodes, so a later `add_task` closes
//! the edge instead of losing it.

use crate::{
    error::{SwarmError, SwarmResult},
    types::TaskId,
};
use parking_lot::RwLock;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Default)]
struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
    /// Tasks added explicitly, as opposed to placeholder dependencies
    added: HashSet<TaskId>,
    completed: HashSet<TaskId>,
}

impl TaskGraph {
    fn node(&mut self, task_id: &str) -> NodeIndex {
        if let Some(&index) = self.nodes.get(task_id) {
            return index;
        }
        let index = self.graph.add_node(task_id.to_string());
        self.nodes.insert(task_id.to_string(), index);
        index
    }

    fn ids(&self, indices: impl IntoIterator<Item = NodeIndex>) -> Vec<TaskId> {
        indices.into_iter().map(|index| self.graph[index].clone()).collect()
    }

    fn added_ids(&self, indices: impl IntoIterator<Item = NodeIndex>) -> Vec<TaskId> {
        indices
            .into_iter()
            .map(|index| &self.graph[index])
            .filter(|task_id| self.added.contains(*task_id))
            .cloned()
            .collect()
    }

    fn neighbours(&self, task_id: &str, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.nodes.get(task_id) else {
            return Vec::new();
        };
        let mut ids = self.ids(self.graph.neighbors_directed(index, direction));
        ids.sort();
        ids.dedup();
        ids
    }

    /// First cycle reachable in node insertion order, as an ordered path
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        struct Frame {
            node: NodeIndex,
            children: Vec<NodeIndex>,
            next: usize,
        }

        let graph = &self.graph;
        let mut marks = vec![Mark::Unvisited; graph.node_count()];
        let frame = |node: NodeIndex| {
            let mut children: Vec<NodeIndex> = graph.neighbors(node).collect();
            children.sort();
            Frame { node, children, next: 0 }
        };

        for start in graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::OnStack;
            let mut stack = vec![frame(start)];

            while let Some(top) = stack.last_mut() {
                let Some(&child) = top.children.get(top.next) else {
                    marks[top.node.index()] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.next += 1;

                match marks[child.index()] {
                    Mark::Unvisited => {
                        marks[child.index()] = Mark::OnStack;
                        stack.push(frame(child));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|f| f.node == child).unwrap_or(0);
                        return Some(self.ids(stack[from..].iter().map(|f| f.node)));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    fn cycle_error(&self, fallback: NodeIndex) -> SwarmError {
        let cycle = self
            .find_cycle()
            .unwrap_or_else(|| vec![self.graph[fallback].clone()]);
        warn!(cycle = ?cycle, "Execution order requested on cyclic graph");
        SwarmError::CyclicGraph { cycle }
    }
}

/// Maintains the dependency graph between tasks
#[derive(Default)]
pub struct DependencyAnalyzer {
    inner: RwLock<TaskGraph>,
}

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task and its incoming edges. No validation is performed.
    pub fn add_task<I, S>(&self, task_id: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.write();
        let target = inner.node(task_id);
        inner.added.insert(task_id.to_string());
        for dependency in dependencies {
            let source = inner.node(dependency.as_ref());
            inner.graph.update_edge(source, target, ());
        }
        debug!(task_id, nodes = inner.graph.node_count(), "Task added to dependency graph");
    }

    /// A cycle as an ordered list of task ids, or `None` for an acyclic graph.
    ///
    /// Iterative depth-first search with an explicit recursion stack; linear
    /// in nodes plus edges and safe on arbitrarily deep chains.
    pub fn detect_circular_dependencies(&self) -> Option<Vec<TaskId>> {
        self.inner.read().find_cycle()
    }

    /// Every task that sits on some cycle, self-loops included
    pub fn cyclic_tasks(&self) -> HashSet<TaskId> {
        let inner = self.inner.read();
        tarjan_scc(&inner.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || inner.graph.contains_edge(component[0], component[0])
            })
            .flatten()
            .map(|index| inner.graph[index].clone())
            .collect()
    }

    /// Topological order of the added tasks: every dependency precedes its
    /// dependents. Placeholder dependencies are left out.
    ///
    /// Fails with [`SwarmError::CyclicGraph`] instead of returning a partial order.
    pub fn get_execution_order(&self) -> SwarmResult<Vec<TaskId>> {
        let inner = self.inner.read();
        match toposort(&inner.graph, None) {
            Ok(order) => Ok(inner.added_ids(order)),
            Err(cycle) => Err(inner.cycle_error(cycle.node_id())),
        }
    }

    /// The execution order grouped into waves.
    ///
    /// Members of wave `n` depend only on tasks in earlier waves, so each
    /// wave can run in parallel once the previous ones are done. Placeholders
    /// still shape the waves but are not listed.
    pub fn get_execution_waves(&self) -> SwarmResult<Vec<Vec<TaskId>>> {
        let inner = self.inner.read();
        let graph = &inner.graph;

        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
            .collect();
        let mut current: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();

        let mut waves = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for child in graph.neighbors(node) {
                    in_degree[child.index()] -= 1;
                    if in_degree[child.index()] == 0 {
                        next.push(child);
                    }
                }
            }
            next.sort();
            let mut wave = inner.added_ids(current);
            if !wave.is_empty() {
                wave.sort();
                waves.push(wave);
            }
            current = next;
        }

        if placed < graph.node_count() {
            let stuck = graph
                .node_indices()
                .find(|index| in_degree[index.index()] > 0)
                .unwrap_or_default();
            return Err(inner.cycle_error(stuck));
        }
        Ok(waves)
    }

    /// Whether every dependency of `task_id` is in `completed`
    pub fn can_execute(&self, task_id: &str, completed: &HashSet<TaskId>) -> bool {
        self.dependencies_of(task_id)
            .iter()
            .all(|dependency| completed.contains(dependency))
    }

    /// Added tasks not yet completed whose dependencies are not all known-completed
    pub fn get_blocked_tasks(&self) -> Vec<TaskId> {
        let inner = self.inner.read();
        let mut blocked: Vec<TaskId> = inner
            .added
            .iter()
            .filter(|task_id| !inner.completed.contains(*task_id))
            .filter(|task_id| {
                inner
                    .neighbours(task_id, Direction::Incoming)
                    .iter()
                    .any(|dependency| !inner.completed.contains(dependency))
            })
            .cloned()
            .collect();
        blocked.sort();
        blocked
    }

    /// Record a task as completed
    pub fn mark_completed(&self, task_id: &str) {
        self.inner.write().completed.insert(task_id.to_string());
    }

    /// Snapshot of the known-completed set
    pub fn completed_tasks(&self) -> HashSet<TaskId> {
        self.inner.read().completed.clone()
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.inner.read().completed.contains(task_id)
    }

    /// Direct dependencies of a task, sorted
    pub fn dependencies_of(&self, task_id: &str) -> Vec<TaskId> {
        self.inner.read().neighbours(task_id, Direction::Incoming)
    }

    /// Tasks depending directly on `task_id`, sorted
    pub fn dependents_of(&self, task_id: &str) -> Vec<TaskId> {
        self.inner.read().neighbours(task_id, Direction::Outgoing)
    }

    /// Whether the task was added explicitly
    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.read().added.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().added.is_empty()
    }
}
