//! Common types for swarm coordination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an agent in the swarm
pub type AgentId = String;

/// Unique identifier for a task
pub type TaskId = String;

/// Unique identifier for a detected conflict
pub type ConflictId = Uuid;

/// Free-form metadata attached to agents and tasks
pub type Metadata = HashMap<String, serde_json::Value>;

/// Role tag of an agent.
///
/// Roles are data: what an agent can actually do lives in its skill and
/// context sets, not in the tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Orchestrating agent with governance authority
    Foreman,
    /// Build agent
    Builder,
    /// QA agent
    Qa,
    /// Orchestrator agent
    Orchestrator,
    /// Specialized agent with custom role
    Specialized(String),
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::Foreman => f.write_str("foreman"),
            AgentType::Builder => f.write_str("builder"),
            AgentType::Qa => f.write_str("qa"),
            AgentType::Orchestrator => f.write_str("orchestrator"),
            AgentType::Specialized(name) => f.write_str(name),
        }
    }
}

/// Ordinal risk scale shared by agents and task requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Severity of a conflict or compliance finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Observed performance history of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// Average response time in milliseconds
    pub avg_response_time_ms: u64,
    /// Success rate (0.0 to 1.0)
    pub success_rate: f64,
    /// Last time the agent reported activity
    pub last_active_at: DateTime<Utc>,
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            avg_response_time_ms: 0,
            success_rate: 1.0,
            last_active_at: Utc::now(),
        }
    }
}

/// Declared capability of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    /// Role tag
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Skills the agent can apply
    pub skills: BTreeSet<String>,
    /// Domains the agent operates in
    pub context: BTreeSet<String>,
    /// Highest risk level the agent may take on
    pub risk_level: RiskLevel,
    /// Governance domains the agent is accountable to
    pub governance_domain: BTreeSet<String>,
    /// Maximum number of tasks held at once (positive)
    pub max_concurrent_tasks: usize,
    /// Performance history
    pub performance: PerformanceProfile,
}

impl AgentCapability {
    /// Create a capability with no skills, low risk tolerance and a single slot
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            skills: BTreeSet::new(),
            context: BTreeSet::new(),
            risk_level: RiskLevel::Low,
            governance_domain: BTreeSet::new(),
            max_concurrent_tasks: 1,
            performance: PerformanceProfile::default(),
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context<I, S>(mut self, context: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context = context.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_governance_domain<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.governance_domain = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_performance(mut self, avg_response_time_ms: u64, success_rate: f64) -> Self {
        self.performance.avg_response_time_ms = avg_response_time_ms;
        self.performance.success_rate = success_rate;
        self
    }
}

/// Current status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Agent holds no tasks
    Idle,
    /// Agent holds at least one task
    Busy,
    /// Externally imposed exclusion; never matched
    Blocked,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Blocked => "blocked",
        })
    }
}

/// A unit of executable capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub capability: AgentCapability,
    pub status: AgentStatus,
    /// Tasks currently held; never larger than `max_concurrent_tasks`
    pub current_tasks: BTreeSet<TaskId>,
    /// Monotonic completion counter
    pub total_tasks_completed: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Agent {
    /// Create an idle agent holding no tasks
    pub fn new(
        id: impl Into<AgentId>,
        name: impl Into<String>,
        capability: AgentCapability,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capability,
            status: AgentStatus::Idle,
            current_tasks: BTreeSet::new(),
            total_tasks_completed: 0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_current_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.current_tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    /// Whether another task fits under the declared concurrency limit
    pub fn has_spare_capacity(&self) -> bool {
        self.current_tasks.len() < self.capability.max_concurrent_tasks
    }

    /// `idle`, or `busy` with spare capacity. Never `blocked`.
    pub fn is_available(&self) -> bool {
        match self.status {
            AgentStatus::Idle => true,
            AgentStatus::Busy => self.has_spare_capacity(),
            AgentStatus::Blocked => false,
        }
    }

    /// Share of declared capacity in use, within [0, 100]
    pub fn utilization_percentage(&self) -> f64 {
        let max = self.capability.max_concurrent_tasks;
        if max == 0 {
            return 100.0;
        }
        (self.current_tasks.len() as f64 / max as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// What a task needs from the agent that runs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(rename = "type")]
    pub task_type: String,
    pub skills: BTreeSet<String>,
    pub context: BTreeSet<String>,
    pub risk_level: RiskLevel,
    /// Constraints populated by the governance collaborator
    pub governance_constraints: Vec<String>,
    pub priority: i32,
}

impl TaskRequirements {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            skills: BTreeSet::new(),
            context: BTreeSet::new(),
            risk_level: RiskLevel::Low,
            governance_constraints: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context<I, S>(mut self, context: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context = context.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_governance_constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.governance_constraints = constraints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Task lifecycle state.
///
/// ```text
/// pending -> assigned -> running -> completed | failed
/// pending -> cancelled        assigned -> cancelled
/// pending -> failed (rejected) assigned -> failed (dispatch error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are final and immutable
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub requirements: TaskRequirements,
    /// Tasks that must complete before this one may start
    pub dependencies: BTreeSet<TaskId>,
    /// Higher is more urgent
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Agent the task was assigned to; kept once the task finishes
    pub assigned_agent: Option<AgentId>,
    /// Why the task failed, if it did
    pub failure_reason: Option<String>,
}

impl Task {
    /// Create a pending task; type and priority are taken from the requirements
    pub fn new(id: impl Into<TaskId>, requirements: TaskRequirements) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: requirements.task_type.clone(),
            priority: requirements.priority,
            requirements,
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
            assigned_agent: None,
            failure_reason: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Score of one agent against one set of requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub agent_id: AgentId,
    /// 0 to 100
    pub match_score: u8,
}

/// Load snapshot of a single agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: AgentId,
    pub current_tasks: usize,
    pub max_concurrent_tasks: usize,
    /// `current_tasks / max_concurrent_tasks * 100`, within [0, 100]
    pub utilization_percentage: f64,
}

impl From<&Agent> for AgentLoad {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id.clone(),
            current_tasks: agent.current_tasks.len(),
            max_concurrent_tasks: agent.capability.max_concurrent_tasks,
            utilization_percentage: agent.utilization_percentage(),
        }
    }
}

/// When a task should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    Immediate,
    Queued,
    Delayed,
    Rejected,
}

impl Schedule {
    pub fn as_str(self) -> &'static str {
        match self {
            Schedule::Immediate => "immediate",
            Schedule::Queued => "queued",
            Schedule::Delayed => "delayed",
            Schedule::Rejected => "rejected",
        }
    }
}

/// Load balancer verdict for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub schedule: Schedule,
    /// Human-readable justification; not used for control flow
    pub reason: String,
}

impl ScheduleDecision {
    pub fn new(schedule: Schedule, reason: impl Into<String>) -> Self {
        Self {
            schedule,
            reason: reason.into(),
        }
    }
}

/// An operation an agent reports before touching a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOperation {
    pub agent_id: AgentId,
    #[serde(rename = "type")]
    pub operation_type: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    /// Task on whose behalf the agent operates, if known
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

impl AgentOperation {
    pub fn new(
        agent_id: impl Into<AgentId>,
        operation_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            operation_type: operation_type.into(),
            target: target.into(),
            timestamp: Utc::now(),
            task_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Operations that observe a target without changing it
    pub fn is_read_only(&self) -> bool {
        is_read_only_operation(&self.operation_type)
    }
}

pub(crate) fn is_read_only_operation(operation_type: &str) -> bool {
    let op = operation_type.to_ascii_lowercase();
    ["read", "inspect", "view", "list", "stat"]
        .iter()
        .any(|verb| op.split(|c: char| !c.is_ascii_alphanumeric()).any(|part| part == *verb))
}

/// Classification of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    File,
    Governance,
    Resource,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::File => "file",
            ConflictType::Governance => "governance",
            ConflictType::Resource => "resource",
        }
    }
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Higher-priority agent proceeds, the others back off
    Priority,
    /// Equal priority; the first agent proceeds, the others back off
    Backoff,
    /// Effects provably do not overlap; everyone proceeds
    Merge,
    /// Hand over to a human
    Escalate,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::Priority => "priority",
            ResolutionStrategy::Backoff => "backoff",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Escalate => "escalate",
        }
    }
}

/// Outcome of resolving a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub requires_human_review: bool,
    /// Agent allowed to proceed, when one is singled out
    pub winner: Option<AgentId>,
    /// Agents that must back off
    pub backed_off: Vec<AgentId>,
    pub reason: String,
}

/// A concurrent-access collision between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Involved agents, first operator first
    pub agent_ids: Vec<AgentId>,
    pub task_ids: Vec<TaskId>,
    /// Contended target, when detected from operations
    #[serde(default)]
    pub target: Option<String>,
    /// Operation types seen in the collision
    #[serde(default)]
    pub operation_types: BTreeSet<String>,
    pub description: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Build a conflict by hand (e.g. from a governance report)
    pub fn new<I, S>(
        conflict_type: ConflictType,
        agent_ids: I,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        Self {
            id: Uuid::new_v4(),
            conflict_type,
            agent_ids: agent_ids.into_iter().map(Into::into).collect(),
            task_ids: Vec::new(),
            target: None,
            operation_types: BTreeSet::new(),
            description: description.into(),
            severity,
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn with_task_ids<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.task_ids = task_ids.into_iter().map(Into::into).collect();
        self
    }

    /// True when every colliding operation is known to be read-only
    pub fn is_read_only(&self) -> bool {
        !self.operation_types.is_empty()
            && self.operation_types.iter().all(|op| is_read_only_operation(op))
    }
}

/// Coordination event in the swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    AgentRegistered {
        agent_id: AgentId,
        agent_type: AgentType,
        timestamp: DateTime<Utc>,
    },
    AgentUnregistered {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
    TaskSubmitted {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        conflict_type: ConflictType,
        agent_ids: Vec<AgentId>,
        timestamp: DateTime<Utc>,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        requires_human_review: bool,
        timestamp: DateTime<Utc>,
    },
    BackoffApplied {
        agent_id: AgentId,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    CycleDetected {
        cycle: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
}

/// Full engine snapshot for telemetry and dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmState {
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub conflicts: Vec<Conflict>,
    pub loads: Vec<AgentLoad>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Cancelled));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Assigned, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_availability_rules() {
        let capability = AgentCapability::new(AgentType::Builder).with_max_concurrent_tasks(2);
        let idle = Agent::new("a", "A", capability.clone());
        assert!(idle.is_available());

        let full = Agent::new("b", "B", capability.clone())
            .with_status(AgentStatus::Busy)
            .with_current_tasks(["t1", "t2"]);
        assert!(!full.is_available());
        assert_eq!(full.utilization_percentage(), 100.0);

        let blocked = Agent::new("c", "C", capability).with_status(AgentStatus::Blocked);
        assert!(!blocked.is_available());
    }

    #[test]
    fn test_read_only_operations() {
        assert!(AgentOperation::new("a", "file_read", "x").is_read_only());
        assert!(AgentOperation::new("a", "inspect", "x").is_read_only());
        assert!(!AgentOperation::new("a", "file_modify", "x").is_read_only());
        assert!(!AgentOperation::new("a", "thread_spawn", "x").is_read_only());
    }

    #[test]
    fn test_agent_serializes_with_wire_names() {
        let agent = Agent::new(
            "agent-1",
            "Builder",
            AgentCapability::new(AgentType::Builder).with_skills(["ts"]),
        );
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["capability"]["type"], "builder");
        assert_eq!(json["status"], "idle");
    }
}
