//! Task store and lifecycle state machine
//!
//! ```text
//! pending -> assigned -> running -> completed | failed
//! pending -> cancelled        assigned -> cancelled
//! ```
//!
//! Every transition is a compare-and-set applied under the entry lock of the
//! task: the current state is checked, side effects that can fail (reserving
//! agent capacity) run, and only then is the new state written. Two
//! concurrent distribution passes therefore cannot assign the same task
//! twice; the loser observes a non-pending task and moves on.
//!
//! Lock order is task entry, then agent entry. The registry never touches
//! the task store.

use crate::{
    conflict::BackoffTable,
    dependency::DependencyAnalyzer,
    error::{SwarmError, SwarmResult},
    load_balancer::LoadBalancer,
    matcher::CapabilityMatcher,
    registry::AgentRegistry,
    telemetry,
    types::*,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Reason recorded on tasks no agent can ever take
pub const NO_CAPABLE_AGENT: &str = "no capable agent";

/// Outcome of one distribution pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    /// Task/agent pairs assigned in this pass
    pub assigned: Vec<(TaskId, AgentId)>,
    /// Ready tasks left pending, with the decision that kept them there
    pub deferred: Vec<(TaskId, Schedule)>,
    /// Tasks failed because no agent can satisfy them
    pub failed: Vec<TaskId>,
    /// Pending tasks whose dependencies are not complete (cycle members included)
    pub blocked: usize,
    /// A dependency cycle present in the graph, if any
    pub cycle: Option<Vec<TaskId>>,
}

/// Owns the task store and drives tasks through their lifecycle
pub struct TaskDistributor {
    tasks: DashMap<TaskId, Task>,
    registry: Arc<AgentRegistry>,
    analyzer: Arc<DependencyAnalyzer>,
    matcher: Arc<CapabilityMatcher>,
    balancer: Arc<LoadBalancer>,
    backoffs: Arc<BackoffTable>,
    events: broadcast::Sender<SwarmEvent>,
    /// Cycles already warned about, dropped once every member is terminal
    reported_cycles: Mutex<HashSet<Vec<TaskId>>>,
}

impl TaskDistributor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        analyzer: Arc<DependencyAnalyzer>,
        matcher: Arc<CapabilityMatcher>,
        balancer: Arc<LoadBalancer>,
        backoffs: Arc<BackoffTable>,
        events: broadcast::Sender<SwarmEvent>,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            registry,
            analyzer,
            matcher,
            balancer,
            backoffs,
            events,
            reported_cycles: Mutex::new(HashSet::new()),
        }
    }

    /// Accept a task for scheduling.
    ///
    /// The task is stored as `pending` whatever status it was submitted with.
    pub fn submit_task(&self, mut task: Task) -> SwarmResult<()> {
        if task.dependencies.contains(&task.id) {
            return Err(SwarmError::CyclicGraph {
                cycle: vec![task.id],
            });
        }

        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.failure_reason = None;
        task.updated_at = Utc::now();

        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => return Err(SwarmError::DuplicateTask(task.id)),
            Entry::Vacant(slot) => {
                self.analyzer.add_task(&task.id, &task.dependencies);
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    priority = task.priority,
                    dependencies = task.dependencies.len(),
                    "Task submitted"
                );
                slot.insert(task.clone());
            }
        }

        self.emit(SwarmEvent::TaskSubmitted {
            task_id: task.id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Snapshot of one task
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|task| task.clone())
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|task| task.status)
    }

    /// Every task, ordered by id
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Pending tasks, most urgent first (priority, then age, then id)
    pub fn pending_tasks(&self) -> Vec<Task> {
        let mut pending: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.status == TaskStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending
    }

    /// Tasks an agent holds in `assigned` or `running`
    pub fn active_tasks_of(&self, agent_id: &str) -> Vec<Task> {
        let mut active: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| {
                matches!(entry.status, TaskStatus::Assigned | TaskStatus::Running)
                    && entry.assigned_agent.as_deref() == Some(agent_id)
            })
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Assign a pending task to an agent.
    ///
    /// Fails without side effects when the task is no longer pending, its
    /// dependencies are incomplete, or the agent is unknown, blocked, backed
    /// off or full.
    pub fn assign_task(&self, task_id: &str, agent_id: &str) -> SwarmResult<()> {
        let completed = self.analyzer.completed_tasks();

        self.transition(task_id, TaskStatus::Assigned, |task| {
            let missing: Vec<TaskId> = task
                .dependencies
                .iter()
                .filter(|dependency| !completed.contains(*dependency))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(SwarmError::DependenciesUnmet {
                    task_id: task.id.clone(),
                    missing,
                });
            }

            let agent = self
                .registry
                .get_agent(agent_id)
                .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))?;
            if self.backoffs.is_backed_off(agent_id) {
                return Err(SwarmError::AgentUnavailable {
                    agent_id: agent_id.to_string(),
                    status: agent.status,
                });
            }

            self.registry.try_reserve(agent_id, &task.id)?;
            task.assigned_agent = Some(agent_id.to_string());
            Ok(())
        })?;

        self.balancer.forget(task_id);
        info!(task_id, agent_id, "Task assigned");
        self.emit(SwarmEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// `assigned -> running`
    pub fn start_task(&self, task_id: &str) -> SwarmResult<()> {
        self.transition(task_id, TaskStatus::Running, |_| Ok(()))?;
        debug!(task_id, "Task started");
        Ok(())
    }

    /// `running -> completed`; frees the agent slot and unblocks dependents
    pub fn complete_task(&self, task_id: &str) -> SwarmResult<()> {
        let task = self.transition(task_id, TaskStatus::Completed, |_| Ok(()))?;
        if let Some(agent_id) = &task.assigned_agent {
            self.registry.release(agent_id, task_id, true);
        }
        self.analyzer.mark_completed(task_id);
        info!(task_id, "Task completed");
        Ok(())
    }

    /// `assigned | running -> failed`; frees the agent slot
    pub fn fail_task(&self, task_id: &str, reason: impl Into<String>) -> SwarmResult<()> {
        let reason = reason.into();
        let task = self.transition(task_id, TaskStatus::Failed, |task| {
            if task.status == TaskStatus::Pending {
                return Err(SwarmError::InvalidTaskStateTransition {
                    task_id: task.id.clone(),
                    from: TaskStatus::Pending,
                    to: TaskStatus::Failed,
                });
            }
            task.failure_reason = Some(reason.clone());
            Ok(())
        })?;
        if let Some(agent_id) = &task.assigned_agent {
            self.registry.release(agent_id, task_id, false);
        }
        warn!(task_id, reason = %reason, "Task failed");
        Ok(())
    }

    /// `pending | assigned -> cancelled`; frees any held agent slot
    pub fn cancel_task(&self, task_id: &str) -> SwarmResult<()> {
        let task = self.transition(task_id, TaskStatus::Cancelled, |_| Ok(()))?;
        if let Some(agent_id) = &task.assigned_agent {
            self.registry.release(agent_id, task_id, false);
        }
        self.balancer.forget(task_id);
        info!(task_id, "Task cancelled");
        Ok(())
    }

    /// Fail every task an agent holds; returns the failed ids
    pub fn fail_tasks_of_agent(&self, agent_id: &str, reason: &str) -> Vec<TaskId> {
        self.active_tasks_of(agent_id)
            .into_iter()
            .filter_map(|task| self.fail_task(&task.id, reason).ok().map(|_| task.id))
            .collect()
    }

    /// One distribution pass over all pending tasks.
    ///
    /// Idempotent: running it redundantly or concurrently produces no
    /// duplicate assignments.
    pub fn distribute_ready_tasks(&self) -> DistributionReport {
        let mut report = DistributionReport::default();

        let cyclic = self.analyzer.cyclic_tasks();
        self.reported_cycles.lock().retain(|cycle| {
            cycle.iter().all(|task_id| cyclic.contains(task_id)) && self.has_live_member(cycle)
        });
        if !cyclic.is_empty() {
            report.cycle = self.analyzer.detect_circular_dependencies();
            self.report_cycle(report.cycle.as_ref());
        }

        let completed = self.analyzer.completed_tasks();
        for task in self.pending_tasks() {
            if cyclic.contains(&task.id) || !self.analyzer.can_execute(&task.id, &completed) {
                report.blocked += 1;
                continue;
            }

            // Snapshot may be stale: another pass can have taken the task meanwhile
            if self.get_task_status(&task.id) != Some(TaskStatus::Pending) {
                continue;
            }
            let decision = self.balancer.schedule_task(&task);
            match decision.schedule {
                Schedule::Immediate => match self.select_agent(&task) {
                    Some(agent_id) => match self.assign_task(&task.id, &agent_id) {
                        Ok(()) => report.assigned.push((task.id, agent_id)),
                        Err(e) if e.is_lost_race() => {
                            debug!(task_id = %task.id, "Task already handled by a concurrent pass");
                        }
                        Err(e) => {
                            debug!(task_id = %task.id, error = %e, "Assignment deferred");
                            report.deferred.push((task.id, Schedule::Queued));
                        }
                    },
                    None => report.deferred.push((task.id, Schedule::Queued)),
                },
                Schedule::Queued | Schedule::Delayed => {
                    // A concurrent pass may have assigned it after schedule_task
                    if self.get_task_status(&task.id) == Some(TaskStatus::Pending) {
                        report.deferred.push((task.id, decision.schedule));
                    } else {
                        self.balancer.forget(&task.id);
                    }
                }
                Schedule::Rejected => {
                    if self.reject_task(&task.id, NO_CAPABLE_AGENT).is_ok() {
                        report.failed.push(task.id);
                    }
                }
            }
        }

        telemetry::record_pending_tasks(
            self.tasks
                .iter()
                .filter(|entry| entry.status == TaskStatus::Pending)
                .count(),
        );
        if !report.assigned.is_empty() || !report.failed.is_empty() {
            debug!(
                assigned = report.assigned.len(),
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                blocked = report.blocked,
                "Distribution pass finished"
            );
        }
        report
    }

    /// Best-ranked candidate that is not over the load threshold
    fn select_agent(&self, task: &Task) -> Option<AgentId> {
        self.matcher
            .find_all_matching_agents(&task.requirements)
            .into_iter()
            .find(|candidate| !self.balancer.is_overloaded(&candidate.agent_id))
            .map(|candidate| candidate.agent_id)
    }

    /// `pending -> failed` for tasks no agent can take
    fn reject_task(&self, task_id: &str, reason: &str) -> SwarmResult<()> {
        self.transition(task_id, TaskStatus::Failed, |task| {
            task.failure_reason = Some(reason.to_string());
            Ok(())
        })?;
        self.balancer.forget(task_id);
        warn!(task_id, reason, "Task rejected");
        Ok(())
    }

    fn report_cycle(&self, cycle: Option<&Vec<TaskId>>) {
        let Some(cycle) = cycle else { return };
        if !self.has_live_member(cycle) {
            return;
        }
        if self.reported_cycles.lock().insert(cycle.clone()) {
            warn!(cycle = ?cycle, "Dependency cycle blocks scheduling of its tasks");
            self.emit(SwarmEvent::CycleDetected {
                cycle: cycle.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Whether any task of the cycle can still run
    fn has_live_member(&self, cycle: &[TaskId]) -> bool {
        cycle.iter().any(|task_id| {
            self.get_task_status(task_id)
                .map_or(true, |status| !status.is_terminal())
        })
    }

    /// Compare-and-set a task into `to`.
    ///
    /// `update` runs under the task's entry lock after the state check and
    /// before the write; an error from it aborts the transition.
    fn transition<F>(&self, task_id: &str, to: TaskStatus, update: F) -> SwarmResult<Task>
    where
        F: FnOnce(&mut Task) -> SwarmResult<()>,
    {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SwarmError::TaskNotFound(task_id.to_string()))?;

        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(SwarmError::InvalidTaskStateTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }
        update(&mut task)?;
        task.status = to;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(task);

        self.emit(SwarmEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            from,
            to,
            timestamp: snapshot.updated_at,
        });
        Ok(snapshot)
    }

    fn emit(&self, event: SwarmEvent) {
        telemetry::record_event(&event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        backoffs: Arc<BackoffTable>,
        distributor: Arc<TaskDistributor>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(AgentRegistry::new());
        let backoffs = Arc::new(BackoffTable::new());
        let analyzer = Arc::new(DependencyAnalyzer::new());
        let matcher = Arc::new(CapabilityMatcher::new(registry.clone(), backoffs.clone()));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), backoffs.clone(), 100.0));
        let (events, _) = broadcast::channel(64);
        let distributor = Arc::new(TaskDistributor::new(
            registry.clone(),
            analyzer,
            matcher,
            balancer,
            backoffs.clone(),
            events,
        ));
        Fixture {
            registry,
            backoffs,
            distributor,
        }
    }

    fn ts_agent(id: &str, max: usize) -> Agent {
        Agent::new(
            id,
            id,
            AgentCapability::new(AgentType::Builder)
                .with_skills(["ts"])
                .with_max_concurrent_tasks(max),
        )
    }

    fn ts_task(id: &str) -> Task {
        Task::new(id, TaskRequirements::new("build").with_skills(["ts"]))
    }

    #[test]
    fn test_single_task_is_assigned() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 2)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();

        let report = f.distributor.distribute_ready_tasks();
        assert_eq!(report.assigned, vec![("T1".to_string(), "A".to_string())]);
        assert_eq!(f.distributor.get_task_status("T1"), Some(TaskStatus::Assigned));
        let agent = f.registry.get_agent("A").unwrap();
        assert!(agent.current_tasks.contains("T1"));
        assert_eq!(agent.current_tasks.len(), 1);
    }

    #[test]
    fn test_dependent_waits_for_completion() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 2)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();
        f.distributor.submit_task(ts_task("T2").with_dependencies(["T1"])).unwrap();

        for _ in 0..3 {
            f.distributor.distribute_ready_tasks();
            assert_eq!(f.distributor.get_task_status("T2"), Some(TaskStatus::Pending));
        }

        f.distributor.start_task("T1").unwrap();
        f.distributor.complete_task("T1").unwrap();
        f.distributor.distribute_ready_tasks();
        assert_eq!(f.distributor.get_task_status("T2"), Some(TaskStatus::Assigned));
        assert_eq!(f.registry.get_agent("A").unwrap().total_tasks_completed, 1);
    }

    #[test]
    fn test_assignment_is_compare_and_set() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 2)).unwrap();
        f.registry.register_agent(ts_agent("B", 2)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();

        f.distributor.assign_task("T1", "A").unwrap();
        let err = f.distributor.assign_task("T1", "B").unwrap_err();
        assert!(err.is_lost_race());
        assert!(f.registry.get_agent("B").unwrap().current_tasks.is_empty());
    }

    #[test]
    fn test_assign_refuses_unmet_dependencies_and_backed_off_agents() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 2)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();
        f.distributor.submit_task(ts_task("T2").with_dependencies(["T1"])).unwrap();

        assert!(matches!(
            f.distributor.assign_task("T2", "A"),
            Err(SwarmError::DependenciesUnmet { .. })
        ));

        f.backoffs.insert("A", Duration::from_secs(60));
        assert!(matches!(
            f.distributor.assign_task("T1", "A"),
            Err(SwarmError::AgentUnavailable { .. })
        ));
        assert_eq!(f.distributor.get_task_status("T1"), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_rejected_task_fails_with_reason() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();
        let task = Task::new("T1", TaskRequirements::new("build").with_skills(["cobol"]));
        f.distributor.submit_task(task).unwrap();

        let report = f.distributor.distribute_ready_tasks();
        assert_eq!(report.failed, vec!["T1".to_string()]);
        let task = f.distributor.get_task("T1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some(NO_CAPABLE_AGENT));
    }

    #[test]
    fn test_cancel_releases_capacity() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();
        f.distributor.distribute_ready_tasks();

        f.distributor.cancel_task("T1").unwrap();
        let agent = f.registry.get_agent("A").unwrap();
        assert!(agent.current_tasks.is_empty());
        assert_eq!(agent.status, AgentStatus::Idle);

        assert!(matches!(
            f.distributor.cancel_task("T1"),
            Err(SwarmError::InvalidTaskStateTransition { .. })
        ));
    }

    #[test]
    fn test_running_task_cannot_be_cancelled() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();
        f.distributor.submit_task(ts_task("T1")).unwrap();
        f.distributor.distribute_ready_tasks();
        f.distributor.start_task("T1").unwrap();

        assert!(f.distributor.cancel_task("T1").is_err());
        f.distributor.fail_task("T1", "build broke").unwrap();
        assert!(f.registry.get_agent("A").unwrap().current_tasks.is_empty());
    }

    #[test]
    fn test_submission_rules() {
        let f = fixture();
        let mut task = ts_task("T1");
        task.status = TaskStatus::Running;
        f.distributor.submit_task(task).unwrap();
        assert_eq!(f.distributor.get_task_status("T1"), Some(TaskStatus::Pending));

        assert!(matches!(
            f.distributor.submit_task(ts_task("T1")),
            Err(SwarmError::DuplicateTask(_))
        ));
        assert!(matches!(
            f.distributor.submit_task(ts_task("T9").with_dependencies(["T9"])),
            Err(SwarmError::CyclicGraph { .. })
        ));
    }

    #[test]
    fn test_cycle_members_stay_pending() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 5)).unwrap();
        f.distributor.submit_task(ts_task("a").with_dependencies(["c"])).unwrap();
        f.distributor.submit_task(ts_task("b").with_dependencies(["a"])).unwrap();
        f.distributor.submit_task(ts_task("c").with_dependencies(["b"])).unwrap();
        f.distributor.submit_task(ts_task("free")).unwrap();

        let report = f.distributor.distribute_ready_tasks();
        assert!(report.cycle.is_some());
        assert_eq!(report.blocked, 3);
        assert_eq!(report.assigned.len(), 1);
        for id in ["a", "b", "c"] {
            assert_eq!(f.distributor.get_task_status(id), Some(TaskStatus::Pending));
        }
    }

    #[test]
    fn test_cancelled_cycle_is_forgotten() {
        let f = fixture();
        let mut events = f.distributor.events.subscribe();
        f.distributor.submit_task(ts_task("a").with_dependencies(["b"])).unwrap();
        f.distributor.submit_task(ts_task("b").with_dependencies(["a"])).unwrap();

        f.distributor.distribute_ready_tasks();
        f.distributor.distribute_ready_tasks();
        assert_eq!(f.distributor.reported_cycles.lock().len(), 1);

        f.distributor.cancel_task("a").unwrap();
        f.distributor.cancel_task("b").unwrap();
        f.distributor.distribute_ready_tasks();
        assert!(f.distributor.reported_cycles.lock().is_empty());

        let mut cycle_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SwarmEvent::CycleDetected { .. }) {
                cycle_events += 1;
            }
        }
        assert_eq!(cycle_events, 1);
    }

    #[test]
    fn test_priority_order() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();
        f.distributor.submit_task(ts_task("low").with_priority(1)).unwrap();
        f.distributor.submit_task(ts_task("high").with_priority(9)).unwrap();

        let report = f.distributor.distribute_ready_tasks();
        assert_eq!(report.assigned, vec![("high".to_string(), "A".to_string())]);
        assert_eq!(report.deferred, vec![("low".to_string(), Schedule::Queued)]);
    }

    #[test]
    fn test_cancel_racing_assign_leaves_consistent_state() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();

        for round in 0..200 {
            let task_id = format!("T{round}");
            f.distributor.submit_task(ts_task(&task_id)).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let assigner = {
                let distributor = f.distributor.clone();
                let barrier = barrier.clone();
                let task_id = task_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    distributor.assign_task(&task_id, "A").is_ok()
                })
            };
            let canceller = {
                let distributor = f.distributor.clone();
                let barrier = barrier.clone();
                let task_id = task_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    distributor.cancel_task(&task_id).is_ok()
                })
            };
            let assigned = assigner.join().unwrap();
            let cancelled = canceller.join().unwrap();

            // Cancel is legal from both pending and assigned, so it always wins in the end
            assert!(cancelled, "cancel of {task_id} failed (assigned: {assigned})");
            assert_eq!(f.distributor.get_task_status(&task_id), Some(TaskStatus::Cancelled));
            assert!(f.registry.get_agent("A").unwrap().current_tasks.is_empty());
        }
    }

    #[test]
    fn test_concurrent_passes_leave_no_stale_deferrals() {
        let f = fixture();
        f.registry.register_agent(ts_agent("A", 1)).unwrap();
        for i in 0..10 {
            f.distributor.submit_task(ts_task(&format!("T{i}"))).unwrap();
        }

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let distributor = f.distributor.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    distributor.distribute_ready_tasks().assigned
                })
            })
            .collect();
        let assigned: Vec<(TaskId, AgentId)> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(assigned.len(), 1);
        let deferred = f.distributor.balancer.deferred_tasks();
        assert!(!deferred.iter().any(|(task_id, _)| *task_id == assigned[0].0));
        for (task_id, _) in deferred {
            assert_eq!(f.distributor.get_task_status(&task_id), Some(TaskStatus::Pending));
        }
    }
}
