//! Metric emission
//!
//! Metrics go through the `metrics` facade, so they are dropped unless the
//! host installs a recorder. Counters are derived from [`SwarmEvent`]s; the
//! gauges are refreshed by the load balancer and distributor.

use crate::types::{AgentLoad, SwarmEvent, TaskStatus};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use std::sync::Once;

pub const TASKS_SUBMITTED: &str = "foreman_swarm_tasks_submitted_total";
pub const TASKS_ASSIGNED: &str = "foreman_swarm_tasks_assigned_total";
pub const TASK_TRANSITIONS: &str = "foreman_swarm_task_transitions_total";
pub const CONFLICTS_DETECTED: &str = "foreman_swarm_conflicts_detected_total";
pub const CONFLICTS_RESOLVED: &str = "foreman_swarm_conflicts_resolved_total";
pub const BACKOFFS_APPLIED: &str = "foreman_swarm_backoffs_applied_total";
pub const DEPENDENCY_CYCLES: &str = "foreman_swarm_dependency_cycles_total";
pub const COMPLIANCE_VIOLATIONS: &str = "foreman_swarm_compliance_violations_total";
pub const AGENTS_REGISTERED: &str = "foreman_swarm_agents_registered";
pub const AGENT_UTILIZATION: &str = "foreman_swarm_agent_utilization_percent";
pub const PENDING_TASKS: &str = "foreman_swarm_pending_tasks";

static DESCRIBE: Once = Once::new();

/// Register metric descriptions with the installed recorder (once per process)
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(TASKS_SUBMITTED, Unit::Count, "Tasks accepted for scheduling");
        describe_counter!(TASKS_ASSIGNED, Unit::Count, "Tasks assigned to an agent");
        describe_counter!(TASK_TRANSITIONS, Unit::Count, "Task state transitions by target state");
        describe_counter!(CONFLICTS_DETECTED, Unit::Count, "Conflicts detected by type");
        describe_counter!(CONFLICTS_RESOLVED, Unit::Count, "Conflicts resolved by strategy");
        describe_counter!(BACKOFFS_APPLIED, Unit::Count, "Backoff windows applied to agents");
        describe_counter!(
            DEPENDENCY_CYCLES,
            Unit::Count,
            "Dependency cycles found during distribution"
        );
        describe_counter!(
            COMPLIANCE_VIOLATIONS,
            Unit::Count,
            "Compliance violations reported by code"
        );
        describe_gauge!(AGENTS_REGISTERED, Unit::Count, "Agents currently registered");
        describe_gauge!(
            AGENT_UTILIZATION,
            Unit::Percent,
            "Share of declared capacity in use per agent"
        );
        describe_gauge!(PENDING_TASKS, Unit::Count, "Tasks waiting for assignment");
    });
}

/// Update counters for an engine event
pub fn record_event(event: &SwarmEvent) {
    match event {
        SwarmEvent::TaskSubmitted { .. } => counter!(TASKS_SUBMITTED).increment(1),
        SwarmEvent::TaskAssigned { .. } => counter!(TASKS_ASSIGNED).increment(1),
        SwarmEvent::TaskStatusChanged { to, .. } => {
            counter!(TASK_TRANSITIONS, "to" => status_label(*to)).increment(1)
        }
        SwarmEvent::ConflictDetected { conflict_type, .. } => {
            counter!(CONFLICTS_DETECTED, "type" => conflict_type.as_str()).increment(1)
        }
        SwarmEvent::ConflictResolved { strategy, .. } => {
            counter!(CONFLICTS_RESOLVED, "strategy" => strategy.as_str()).increment(1)
        }
        SwarmEvent::BackoffApplied { .. } => counter!(BACKOFFS_APPLIED).increment(1),
        SwarmEvent::CycleDetected { .. } => counter!(DEPENDENCY_CYCLES).increment(1),
        SwarmEvent::AgentRegistered { .. }
        | SwarmEvent::AgentUnregistered { .. }
        | SwarmEvent::AgentStatusChanged { .. } => {}
    }
}

pub fn record_compliance_violation(code: &'static str) {
    counter!(COMPLIANCE_VIOLATIONS, "code" => code).increment(1);
}

pub fn record_agent_count(count: usize) {
    gauge!(AGENTS_REGISTERED).set(count as f64);
}

pub fn record_agent_load(load: &AgentLoad) {
    gauge!(AGENT_UTILIZATION, "agent_id" => load.agent_id.clone()).set(load.utilization_percentage);
}

pub fn record_pending_tasks(count: usize) {
    gauge!(PENDING_TASKS).set(count as f64);
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Assigned => "assigned",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}
