//! Compliance reporting
//!
//! Both checks are read-only: they never block scheduling, they surface
//! findings for the governance collaborator to act on.
//!
//! - CS5: agents whose average response time exceeds the configured threshold.
//! - CS6: tasks that touch a protected target without authorization evidence.

use crate::{config::ComplianceThresholds, telemetry, types::*};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Metadata key naming a single target file
pub const TARGET_FILE_KEY: &str = "targetFile";
/// Metadata key naming several target files
pub const TARGET_FILES_KEY: &str = "targetFiles";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationCode {
    #[serde(rename = "CS5_PERFORMANCE")]
    Cs5Performance,
    #[serde(rename = "CS6_BOUNDARY")]
    Cs6Boundary,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationCode::Cs5Performance => "CS5_PERFORMANCE",
            ViolationCode::Cs6Boundary => "CS6_BOUNDARY",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single compliance finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub code: ViolationCode,
    pub severity: Severity,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub message: String,
    /// CS5: observed average response time in milliseconds
    pub observed_ms: Option<u64>,
    /// CS5: configured limit in milliseconds
    pub threshold_ms: Option<u64>,
    /// CS6: protected targets the task touches
    #[serde(default)]
    pub targets: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Agents slower on average than `thresholds.max_avg_response_time_ms`
pub fn check_cs5(agents: &[Agent], thresholds: &ComplianceThresholds) -> Vec<ComplianceViolation> {
    let limit = thresholds.max_avg_response_time_ms;
    agents
        .iter()
        .filter(|agent| agent.capability.performance.avg_response_time_ms > limit)
        .map(|agent| {
            let observed = agent.capability.performance.avg_response_time_ms;
            telemetry::record_compliance_violation(ViolationCode::Cs5Performance.as_str());
            ComplianceViolation {
                code: ViolationCode::Cs5Performance,
                severity: Severity::Medium,
                agent_id: Some(agent.id.clone()),
                task_id: None,
                message: format!(
                    "agent {} averages {}ms per task, above the {}ms limit",
                    agent.id, observed, limit
                ),
                observed_ms: Some(observed),
                threshold_ms: Some(limit),
                targets: Vec::new(),
                detected_at: Utc::now(),
            }
        })
        .collect()
}

/// Non-cancelled tasks that touch a protected target without authorization
pub fn check_cs6(tasks: &[Task], thresholds: &ComplianceThresholds) -> Vec<ComplianceViolation> {
    tasks
        .iter()
        .filter(|task| task.status != TaskStatus::Cancelled)
        .filter_map(|task| {
            let targets = protected_targets(task, thresholds);
            let marked = task.requirements.governance_constraints.iter().any(|constraint| {
                thresholds
                    .protected_constraint_markers
                    .iter()
                    .any(|marker| constraint.contains(marker.as_str()))
            });
            if (targets.is_empty() && !marked) || is_authorized(task, thresholds) {
                return None;
            }

            telemetry::record_compliance_violation(ViolationCode::Cs6Boundary.as_str());
            let subject = if targets.is_empty() {
                "a protected target".to_string()
            } else {
                targets.join(", ")
            };
            Some(ComplianceViolation {
                code: ViolationCode::Cs6Boundary,
                severity: Severity::Critical,
                agent_id: task.assigned_agent.clone(),
                task_id: Some(task.id.clone()),
                message: format!("task {} touches {} without authorization", task.id, subject),
                observed_ms: None,
                threshold_ms: None,
                targets,
                detected_at: Utc::now(),
            })
        })
        .collect()
}

fn protected_targets(task: &Task, thresholds: &ComplianceThresholds) -> Vec<String> {
    let mut targets: Vec<&str> = Vec::new();
    if let Some(Value::String(target)) = task.metadata.get(TARGET_FILE_KEY) {
        targets.push(target);
    }
    if let Some(Value::Array(items)) = task.metadata.get(TARGET_FILES_KEY) {
        targets.extend(items.iter().filter_map(Value::as_str));
    }
    targets
        .into_iter()
        .filter(|target| thresholds.is_protected_path(target))
        .map(String::from)
        .collect()
}

fn is_authorized(task: &Task, thresholds: &ComplianceThresholds) -> bool {
    thresholds.authorization_keys.iter().any(|key| {
        match task.metadata.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn protected_task() -> Task {
        Task::new(
            "protected-file-task",
            TaskRequirements::new("modify")
                .with_skills(["filesystem"])
                .with_risk_level(RiskLevel::Critical)
                .with_governance_constraints(["CS2_PROTECTED_FILE"]),
        )
        .with_metadata(TARGET_FILE_KEY, json!(".github/workflows/qiel.yml"))
    }

    #[test]
    fn test_cs5_reports_slow_agents() {
        let slow = Agent::new(
            "slow-agent",
            "Slow Agent",
            AgentCapability::new(AgentType::Builder).with_performance(5000, 0.8),
        );
        let fast = Agent::new(
            "fast-agent",
            "Fast Agent",
            AgentCapability::new(AgentType::Builder).with_performance(800, 0.9),
        );

        let violations = check_cs5(&[slow, fast], &ComplianceThresholds::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, ViolationCode::Cs5Performance);
        assert_eq!(violations[0].agent_id.as_deref(), Some("slow-agent"));
        assert_eq!(violations[0].observed_ms, Some(5000));
        assert_eq!(violations[0].threshold_ms, Some(2000));
    }

    #[test]
    fn test_cs6_reports_unauthorized_protected_targets() {
        let violations = check_cs6(&[protected_task()], &ComplianceThresholds::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, ViolationCode::Cs6Boundary);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[0].targets, vec![".github/workflows/qiel.yml".to_string()]);
    }

    #[test]
    fn test_cs6_accepts_authorization_evidence() {
        let task = protected_task().with_metadata("approvalId", json!("GOV-42"));
        assert!(check_cs6(&[task], &ComplianceThresholds::default()).is_empty());

        let empty = protected_task().with_metadata("authorization", json!(""));
        assert_eq!(check_cs6(&[empty], &ComplianceThresholds::default()).len(), 1);
    }

    #[test]
    fn test_cs6_ignores_unprotected_tasks() {
        let task = Task::new("plain", TaskRequirements::new("build"))
            .with_metadata(TARGET_FILES_KEY, json!(["app/page.tsx", "lib/utils.ts"]));
        assert!(check_cs6(&[task], &ComplianceThresholds::default()).is_empty());
    }

    #[test]
    fn test_violation_code_wire_name() {
        let json = serde_json::to_value(ViolationCode::Cs6Boundary).unwrap();
        assert_eq!(json, "CS6_BOUNDARY");
    }
}
