//! Agent registry
//!
//! Source of truth for agent identity, capability and status. It is the only
//! writer of `status` and `current_tasks`; every mutation happens under the
//! entry lock of the agent being changed, and reads see it immediately.

use crate::{
    error::{SwarmError, SwarmResult},
    types::*,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Registry of all agents known to the swarm
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    max_agents: usize,
    admission: Mutex<()>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Create a registry bounded by [`crate::MAX_SWARM_SIZE`]
    pub fn new() -> Self {
        Self::with_capacity_limit(crate::MAX_SWARM_SIZE)
    }

    /// Create a registry holding at most `max_agents` agents
    pub fn with_capacity_limit(max_agents: usize) -> Self {
        Self {
            agents: DashMap::new(),
            max_agents,
            admission: Mutex::new(()),
        }
    }

    /// Register a new agent.
    ///
    /// An `idle` descriptor that already holds tasks is stored as `busy`.
    pub fn register_agent(&self, mut agent: Agent) -> SwarmResult<()> {
        if agent.capability.max_concurrent_tasks == 0 {
            return Err(SwarmError::InvalidAgent(format!(
                "agent {} declares zero concurrent tasks",
                agent.id
            )));
        }
        if agent.current_tasks.len() > agent.capability.max_concurrent_tasks {
            return Err(SwarmError::InvalidAgent(format!(
                "agent {} holds {} tasks but allows {}",
                agent.id,
                agent.current_tasks.len(),
                agent.capability.max_concurrent_tasks
            )));
        }
        if agent.status == AgentStatus::Idle && !agent.current_tasks.is_empty() {
            agent.status = AgentStatus::Busy;
        }

        // Registrations are serialized; no insert can land between len() and the entry check
        let _admission = self.admission.lock();
        let current = self.agents.len();
        match self.agents.entry(agent.id.clone()) {
            Entry::Occupied(_) => Err(SwarmError::DuplicateAgent(agent.id)),
            Entry::Vacant(_) if current >= self.max_agents => {
                Err(SwarmError::SwarmSizeLimitExceeded {
                    current,
                    max: self.max_agents,
                })
            }
            Entry::Vacant(slot) => {
                info!(
                    agent_id = %agent.id,
                    agent_type = %agent.capability.agent_type,
                    max_concurrent = agent.capability.max_concurrent_tasks,
                    "Agent registered"
                );
                slot.insert(agent);
                Ok(())
            }
        }
    }

    /// Remove an agent; returns it if it was registered
    pub fn unregister_agent(&self, agent_id: &str) -> Option<Agent> {
        let removed = self.agents.remove(agent_id).map(|(_, agent)| agent);
        if removed.is_some() {
            info!(agent_id, "Agent unregistered");
        }
        removed
    }

    /// Snapshot of one agent
    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.get(agent_id).map(|agent| agent.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All agents carrying the given role tag
    pub fn get_agents_by_capability(&self, agent_type: &AgentType) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|entry| &entry.capability.agent_type == agent_type)
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents that are `idle`, or `busy` with spare capacity
    pub fn get_available_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|entry| entry.is_available())
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Snapshot of every agent, ordered by id
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> =
            self.agents.iter().map(|entry| entry.value().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Set an agent's status.
    ///
    /// Setting `idle` on an agent that still holds tasks stores `busy`.
    /// Returns the status actually stored.
    pub fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> SwarmResult<AgentStatus> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))?;

        let stored = if status == AgentStatus::Idle && !agent.current_tasks.is_empty() {
            AgentStatus::Busy
        } else {
            status
        };
        debug!(agent_id, from = %agent.status, to = %stored, "Agent status updated");
        agent.status = stored;
        Ok(stored)
    }

    /// Record fresh performance figures reported for an agent
    pub fn update_performance(
        &self,
        agent_id: &str,
        avg_response_time_ms: u64,
        success_rate: f64,
    ) -> SwarmResult<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))?;
        let performance = &mut agent.capability.performance;
        performance.avg_response_time_ms = avg_response_time_ms;
        performance.success_rate = success_rate.clamp(0.0, 1.0);
        performance.last_active_at = chrono::Utc::now();
        Ok(())
    }

    /// Atomically claim one slot of the agent for `task_id`.
    ///
    /// Fails without side effects if the agent is unknown, blocked or full.
    pub fn try_reserve(&self, agent_id: &str, task_id: &str) -> SwarmResult<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))?;

        if agent.status == AgentStatus::Blocked {
            return Err(SwarmError::AgentUnavailable {
                agent_id: agent_id.to_string(),
                status: AgentStatus::Blocked,
            });
        }
        if agent.current_tasks.contains(task_id) {
            return Ok(());
        }
        if !agent.has_spare_capacity() {
            return Err(SwarmError::AgentAtCapacity {
                agent_id: agent_id.to_string(),
                max: agent.capability.max_concurrent_tasks,
            });
        }

        agent.current_tasks.insert(task_id.to_string());
        agent.status = AgentStatus::Busy;
        agent.capability.performance.last_active_at = chrono::Utc::now();
        Ok(())
    }

    /// Give back the slot held for `task_id`.
    ///
    /// `completed` bumps the completion counter. Unknown agents are ignored.
    pub fn release(&self, agent_id: &str, task_id: &str, completed: bool) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            if agent.current_tasks.remove(task_id) && completed {
                agent.total_tasks_completed += 1;
            }
            if agent.status != AgentStatus::Blocked {
                agent.status = if agent.current_tasks.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
