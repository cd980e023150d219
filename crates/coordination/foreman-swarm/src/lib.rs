//! # Foreman Swarm
//!
//! Coordination engine for a pool of heterogeneous worker agents executing
//! interdependent tasks under capability, load and policy constraints.
//!
//! ## Key Features
//!
//! - **Agent Registry**: identity, capability and status of every agent
//! - **Capability Matching**: 0-100 scoring of agents against task requirements
//! - **Dependency Analysis**: cycle detection and topological execution order
//! - **Conflict Resolution**: collision detection on shared targets, with
//!   priority, backoff, merge and escalation strategies
//! - **Load Balancing**: immediate / queued / delayed / rejected decisions
//! - **Compliance Reporting**: CS5 performance and CS6 boundary checks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Swarm Coordinator               │
//! ├──────────────────────────────────────────────┤
//! │              Task Distributor                │
//! ├───────────────┬──────────────┬───────────────┤
//! │ Load Balancer │   Conflict   │  Compliance   │
//! │               │   Resolver   │               │
//! ├───────────────┴──────┬───────┴───────────────┤
//! │  Capability Matcher  │  Dependency Analyzer  │
//! ├──────────────────────┴───────────────────────┤
//! │               Agent Registry                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use foreman_swarm::prelude::*;
//!
//! # async fn run() -> SwarmResult<()> {
//! let coordinator = SwarmCoordinator::new(SwarmConfig::default());
//! coordinator
//!     .register_agent(Agent::new(
//!         "builder-1",
//!         "Builder",
//!         AgentCapability::new(AgentType::Builder).with_skills(["typescript"]),
//!     ))
//!     .await?;
//! coordinator
//!     .submit_task(Task::new("t1", TaskRequirements::new("build").with_skills(["typescript"])))
//!     .await?;
//! let report = coordinator.distribute_ready_tasks().await;
//! assert_eq!(report.assigned.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod compliance;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod dependency;
pub mod dispatch;
pub mod distributor;
pub mod error;
pub mod load_balancer;
pub mod matcher;
pub mod registry;
pub mod telemetry;
pub mod types;

pub use compliance::{ComplianceViolation, ViolationCode};
pub use config::{ComplianceThresholds, SwarmConfig};
pub use conflict::{BackoffTable, ConflictResolver};
pub use coordinator::SwarmCoordinator;
pub use dependency::DependencyAnalyzer;
pub use dispatch::{NoopDispatcher, TaskDispatcher};
pub use distributor::{DistributionReport, TaskDistributor};
pub use error::{SwarmError, SwarmResult};
pub use load_balancer::{LoadBalancer, RebalanceReport};
pub use matcher::CapabilityMatcher;
pub use registry::AgentRegistry;
pub use types::*;

/// Maximum number of agents in a swarm
pub const MAX_SWARM_SIZE: usize = 100;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Agent, AgentCapability, AgentId, AgentOperation, AgentRegistry, AgentStatus, AgentType,
        CapabilityMatcher, ComplianceThresholds, ComplianceViolation, Conflict, ConflictResolution,
        ConflictResolver, ConflictType, DependencyAnalyzer, DistributionReport, LoadBalancer,
        ResolutionStrategy, RiskLevel, Schedule, ScheduleDecision, Severity, SwarmConfig,
        SwarmCoordinator, SwarmError, SwarmEvent, SwarmResult, SwarmState, Task, TaskDispatcher,
        TaskId, TaskRequirements, TaskStatus,
    };
}
