//! Load balancing and scheduling decisions

use crate::{
    conflict::BackoffTable,
    matcher::is_capable,
    registry::AgentRegistry,
    telemetry,
    types::*,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Outcome of re-evaluating deferred tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Tasks that can now run immediately
    pub promoted: Vec<TaskId>,
    /// Tasks that lost every capable agent since they were deferred
    pub rejected: Vec<TaskId>,
    /// Tasks still queued or delayed
    pub still_deferred: usize,
}

/// Computes agent load and decides when tasks should run
pub struct LoadBalancer {
    registry: Arc<AgentRegistry>,
    backoffs: Arc<BackoffTable>,
    overload_threshold_percent: f64,
    /// Tasks last answered with `queued` or `delayed`
    deferred: DashMap<TaskId, (TaskRequirements, Schedule)>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backoffs: Arc<BackoffTable>,
        overload_threshold_percent: f64,
    ) -> Self {
        Self {
            registry,
            backoffs,
            overload_threshold_percent,
            deferred: DashMap::new(),
        }
    }

    pub fn overload_threshold_percent(&self) -> f64 {
        self.overload_threshold_percent
    }

    /// Load of one agent, `None` if it is not registered
    pub fn get_agent_load(&self, agent_id: &str) -> Option<AgentLoad> {
        self.registry.get_agent(agent_id).map(|agent| AgentLoad::from(&agent))
    }

    /// Whether utilisation is at or above the configured threshold.
    /// Unknown agents are not overloaded.
    pub fn is_overloaded(&self, agent_id: &str) -> bool {
        self.get_agent_load(agent_id)
            .map(|load| load.utilization_percentage >= self.overload_threshold_percent)
            .unwrap_or(false)
    }

    /// One entry per registered agent, ordered by id
    pub fn get_all_agent_loads(&self) -> Vec<AgentLoad> {
        let loads: Vec<AgentLoad> = self.registry.agents().iter().map(AgentLoad::from).collect();
        for load in &loads {
            telemetry::record_agent_load(load);
        }
        loads
    }

    /// Lowest-utilisation agent that could take work right now
    pub fn least_loaded_agent(&self) -> Option<AgentLoad> {
        self.registry
            .agents()
            .into_iter()
            .filter(|agent| self.can_take_work(agent))
            .map(|agent| AgentLoad::from(&agent))
            .min_by(|a, b| {
                a.utilization_percentage
                    .total_cmp(&b.utilization_percentage)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
    }

    /// Decide when `task` should run.
    ///
    /// `queued` and `delayed` answers are remembered for [`Self::rebalance_tasks`].
    pub fn schedule_task(&self, task: &Task) -> ScheduleDecision {
        let decision = self.evaluate(&task.requirements);
        match decision.schedule {
            Schedule::Queued | Schedule::Delayed => {
                self.deferred
                    .insert(task.id.clone(), (task.requirements.clone(), decision.schedule));
            }
            Schedule::Immediate | Schedule::Rejected => {
                self.deferred.remove(&task.id);
            }
        }
        debug!(
            task_id = %task.id,
            schedule = decision.schedule.as_str(),
            reason = %decision.reason,
            "Scheduling decision"
        );
        decision
    }

    fn evaluate(&self, requirements: &TaskRequirements) -> ScheduleDecision {
        let capable: Vec<Agent> = self
            .registry
            .agents()
            .into_iter()
            .filter(|agent| is_capable(agent, requirements))
            .collect();

        if capable.is_empty() {
            return ScheduleDecision::new(
                Schedule::Rejected,
                "no agent satisfies the skill and risk requirements",
            );
        }

        if let Some(agent) = capable.iter().find(|agent| self.can_take_work(agent)) {
            return ScheduleDecision::new(
                Schedule::Immediate,
                format!(
                    "{} of {} capable agents ready, e.g. {}",
                    self.ready_count(&capable),
                    capable.len(),
                    agent.id
                ),
            );
        }

        let waiting_on_backoff = capable.iter().any(|agent| {
            agent.status != AgentStatus::Blocked
                && !self.is_over_threshold(agent)
                && self.backoffs.is_backed_off(&agent.id)
        });
        if waiting_on_backoff {
            ScheduleDecision::new(
                Schedule::Delayed,
                "capable agents with spare capacity are inside a backoff window",
            )
        } else {
            ScheduleDecision::new(
                Schedule::Queued,
                format!("all {} capable agents are blocked or at capacity", capable.len()),
            )
        }
    }

    /// Re-evaluate every deferred task against current loads
    pub fn rebalance_tasks(&self) -> RebalanceReport {
        let deferred: Vec<(TaskId, TaskRequirements)> = self
            .deferred
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().0.clone()))
            .collect();

        let mut report = RebalanceReport::default();
        for (task_id, requirements) in deferred {
            let decision = self.evaluate(&requirements);
            match decision.schedule {
                Schedule::Immediate => {
                    self.deferred.remove(&task_id);
                    report.promoted.push(task_id);
                }
                Schedule::Rejected => {
                    self.deferred.remove(&task_id);
                    report.rejected.push(task_id);
                }
                schedule => {
                    if let Some(mut entry) = self.deferred.get_mut(&task_id) {
                        entry.1 = schedule;
                    }
                    report.still_deferred += 1;
                }
            }
        }
        report.promoted.sort();
        report.rejected.sort();

        if !report.promoted.is_empty() {
            debug!(
                promoted = report.promoted.len(),
                still_deferred = report.still_deferred,
                "Rebalanced deferred tasks"
            );
        }
        report
    }

    /// Deferred tasks and their last decision, ordered by task id
    pub fn deferred_tasks(&self) -> Vec<(TaskId, Schedule)> {
        let mut deferred: Vec<(TaskId, Schedule)> = self
            .deferred
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().1))
            .collect();
        deferred.sort_by(|a, b| a.0.cmp(&b.0));
        deferred
    }

    /// Drop a task that left `pending`
    pub fn forget(&self, task_id: &str) {
        self.deferred.remove(task_id);
    }

    fn is_over_threshold(&self, agent: &Agent) -> bool {
        !agent.has_spare_capacity()
            || agent.utilization_percentage() >= self.overload_threshold_percent
    }

    fn can_take_work(&self, agent: &Agent) -> bool {
        agent.status != AgentStatus::Blocked
            && !self.is_over_threshold(agent)
            && !self.backoffs.is_backed_off(&agent.id)
    }

    fn ready_count(&self, agents: &[Agent]) -> usize {
        agents.iter().filter(|agent| self.can_take_work(agent)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup(threshold: f64) -> (Arc<AgentRegistry>, Arc<BackoffTable>, LoadBalancer) {
        let registry = Arc::new(AgentRegistry::new());
        let backoffs = Arc::new(BackoffTable::new());
        let balancer = LoadBalancer::new(registry.clone(), backoffs.clone(), threshold);
        (registry, backoffs, balancer)
    }

    fn agent(id: &str, max: usize) -> Agent {
        Agent::new(
            id,
            id,
            AgentCapability::new(AgentType::Builder)
                .with_skills(["typescript"])
                .with_max_concurrent_tasks(max),
        )
    }

    fn task(id: &str, skill: &str) -> Task {
        Task::new(id, TaskRequirements::new("build").with_skills([skill]))
    }

    #[test]
    fn test_agent_load() {
        let (registry, _, balancer) = setup(100.0);
        registry.register_agent(agent("a", 4)).unwrap();
        registry.try_reserve("a", "t1").unwrap();

        let load = balancer.get_agent_load("a").unwrap();
        assert_eq!(load.current_tasks, 1);
        assert_eq!(load.utilization_percentage, 25.0);
        assert!(!balancer.is_overloaded("a"));
        assert!(balancer.get_agent_load("ghost").is_none());
        assert!(!balancer.is_overloaded("ghost"));
    }

    #[test]
    fn test_overload_threshold_is_configurable() {
        let (registry, _, balancer) = setup(50.0);
        registry.register_agent(agent("a", 2)).unwrap();
        registry.try_reserve("a", "t1").unwrap();
        assert!(balancer.is_overloaded("a"));
        assert_eq!(balancer.schedule_task(&task("t2", "typescript")).schedule, Schedule::Queued);
    }

    #[test]
    fn test_schedule_decisions() {
        let (registry, backoffs, balancer) = setup(100.0);
        assert_eq!(balancer.schedule_task(&task("t1", "typescript")).schedule, Schedule::Rejected);

        registry.register_agent(agent("a", 1)).unwrap();
        assert_eq!(balancer.schedule_task(&task("t1", "typescript")).schedule, Schedule::Immediate);
        assert_eq!(balancer.schedule_task(&task("t2", "rust")).schedule, Schedule::Rejected);

        backoffs.insert("a", Duration::from_secs(60));
        assert_eq!(balancer.schedule_task(&task("t1", "typescript")).schedule, Schedule::Delayed);

        backoffs.clear("a");
        registry.try_reserve("a", "t0").unwrap();
        assert_eq!(balancer.schedule_task(&task("t1", "typescript")).schedule, Schedule::Queued);
    }

    #[test]
    fn test_rebalance_promotes_when_capacity_frees() {
        let (registry, _, balancer) = setup(100.0);
        registry.register_agent(agent("a", 1)).unwrap();
        registry.try_reserve("a", "t0").unwrap();

        assert_eq!(balancer.schedule_task(&task("t1", "typescript")).schedule, Schedule::Queued);
        let report = balancer.rebalance_tasks();
        assert!(report.promoted.is_empty());
        assert_eq!(report.still_deferred, 1);

        registry.release("a", "t0", true);
        let report = balancer.rebalance_tasks();
        assert_eq!(report.promoted, vec!["t1".to_string()]);
        assert!(balancer.deferred_tasks().is_empty());
    }

    #[test]
    fn test_least_loaded_agent() {
        let (registry, _, balancer) = setup(100.0);
        registry.register_agent(agent("a", 2)).unwrap();
        registry.register_agent(agent("b", 2)).unwrap();
        registry.try_reserve("a", "t1").unwrap();

        assert_eq!(balancer.least_loaded_agent().unwrap().agent_id, "b");
        assert_eq!(balancer.get_all_agent_loads().len(), 2);
    }
}
