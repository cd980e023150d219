//! Outbound hand-off of assigned tasks
//!
//! The coordinator calls the dispatcher on a spawned task after every
//! assignment and never waits for the agent to finish. An `Err` marks the
//! task failed with the error text; success leaves the task `assigned` until
//! the agent reports back through `start_task` / `complete_task`.

use crate::types::{Agent, Task};
use async_trait::async_trait;

/// Delivers an assigned task to the agent that will execute it
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: Task, agent: Agent) -> anyhow::Result<()>;
}

/// Dispatcher that only records the hand-off in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

#[async_trait]
impl TaskDispatcher for NoopDispatcher {
    async fn dispatch(&self, task: Task, agent: Agent) -> anyhow::Result<()> {
        tracing::debug!(
            task_id = %task.id,
            agent_id = %agent.id,
            "Dispatch skipped (no dispatcher configured)"
        );
        Ok(())
    }
}
