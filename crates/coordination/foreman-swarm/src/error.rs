//! Error types for swarm coordination

use crate::types::{AgentId, AgentStatus, TaskId, TaskStatus};
use thiserror::Error;

/// Result type for swarm operations
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

/// Errors that can occur during swarm coordination.
///
/// Not-found lookups are not errors: `get_agent`, `get_task` and
/// `find_best_agent` return `Option`. The variants below are invariant
/// violations that callers must not silently correct.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Agent not found in the registry
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Task not known to the distributor
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// An agent with the same id is already registered
    #[error("Agent already registered: {0}")]
    DuplicateAgent(AgentId),

    /// A task with the same id was already submitted
    #[error("Task already submitted: {0}")]
    DuplicateTask(TaskId),

    /// Task state machine refused the transition
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTaskStateTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Dependency graph contains a cycle
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CyclicGraph {
        cycle: Vec<TaskId>,
    },

    /// Agent has no spare capacity
    #[error("Agent {agent_id} is at capacity ({max} concurrent tasks)")]
    AgentAtCapacity {
        agent_id: AgentId,
        max: usize,
    },

    /// Agent is blocked or inside a backoff window
    #[error("Agent {agent_id} is unavailable ({status})")]
    AgentUnavailable {
        agent_id: AgentId,
        status: AgentStatus,
    },

    /// Task still waits on other tasks
    #[error("Task {task_id} has unmet dependencies: {}", missing.join(", "))]
    DependenciesUnmet {
        task_id: TaskId,
        missing: Vec<TaskId>,
    },

    /// Agent descriptor violates a registry invariant
    #[error("Invalid agent descriptor: {0}")]
    InvalidAgent(String),

    /// Swarm size limit exceeded
    #[error("Swarm size limit exceeded: {current} >= {max}")]
    SwarmSizeLimitExceeded {
        current: usize,
        max: usize,
    },

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration source could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Other errors
    #[error("Swarm error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SwarmError {
    /// Whether the error is the losing side of a compare-and-set race on a task.
    ///
    /// Distribution treats these as "already handled" and moves on.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            SwarmError::InvalidTaskStateTransition { .. } | SwarmError::TaskNotFound(_)
        )
    }
}
