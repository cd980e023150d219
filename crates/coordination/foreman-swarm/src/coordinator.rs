//! Main swarm coordination engine

use crate::{
    compliance::{self, ComplianceViolation},
    config::{ComplianceThresholds, SwarmConfig},
    conflict::{BackoffTable, ConflictResolver},
    dependency::DependencyAnalyzer,
    dispatch::{NoopDispatcher, TaskDispatcher},
    distributor::{DistributionReport, TaskDistributor},
    error::SwarmResult,
    load_balancer::{LoadBalancer, RebalanceReport},
    matcher::CapabilityMatcher,
    registry::AgentRegistry,
    telemetry,
    types::*,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Reason recorded on tasks whose agent left the swarm
pub const AGENT_UNREGISTERED: &str = "agent unregistered";

/// Facade composing registry, analyzer, matcher, resolver, balancer and
/// distributor.
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct SwarmCoordinator {
    config: Arc<SwarmConfig>,
    registry: Arc<AgentRegistry>,
    analyzer: Arc<DependencyAnalyzer>,
    backoffs: Arc<BackoffTable>,
    matcher: Arc<CapabilityMatcher>,
    resolver: Arc<ConflictResolver>,
    balancer: Arc<LoadBalancer>,
    distributor: Arc<TaskDistributor>,
    dispatcher: Arc<dyn TaskDispatcher>,
    thresholds: Arc<RwLock<ComplianceThresholds>>,
    /// Recent conflicts with their resolution, capped by `conflict_history_limit`
    conflicts: Arc<DashMap<ConflictId, Conflict>>,
    /// Reported operations still inside the detection window
    operations: Arc<Mutex<VecDeque<AgentOperation>>>,
    events: broadcast::Sender<SwarmEvent>,
    is_running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl SwarmCoordinator {
    /// Create a coordinator with fresh components
    pub fn new(config: SwarmConfig) -> Self {
        let registry = Arc::new(AgentRegistry::with_capacity_limit(config.max_agents));
        Self::with_components(config, registry, Arc::new(DependencyAnalyzer::new()))
    }

    /// Load and validate a configuration file, then create a coordinator
    pub fn from_config_file(path: impl AsRef<Path>) -> SwarmResult<Self> {
        Ok(Self::new(SwarmConfig::from_file(path)?))
    }

    /// Create a coordinator around an existing registry and analyzer
    pub fn with_components(
        config: SwarmConfig,
        registry: Arc<AgentRegistry>,
        analyzer: Arc<DependencyAnalyzer>,
    ) -> Self {
        telemetry::describe_metrics();

        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let thresholds = Arc::new(RwLock::new(config.compliance.clone()));
        let backoffs = Arc::new(BackoffTable::new());
        let matcher = Arc::new(CapabilityMatcher::new(registry.clone(), backoffs.clone()));
        let resolver = Arc::new(ConflictResolver::new(
            registry.clone(),
            backoffs.clone(),
            config.conflict_window(),
            thresholds.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            backoffs.clone(),
            config.overload_threshold_percent,
        ));
        let distributor = Arc::new(TaskDistributor::new(
            registry.clone(),
            analyzer.clone(),
            matcher.clone(),
            balancer.clone(),
            backoffs.clone(),
            events.clone(),
        ));

        Self {
            config: Arc::new(config),
            registry,
            analyzer,
            backoffs,
            matcher,
            resolver,
            balancer,
            distributor,
            dispatcher: Arc::new(NoopDispatcher),
            thresholds,
            conflicts: Arc::new(DashMap::new()),
            operations: Arc::new(Mutex::new(VecDeque::new())),
            events,
            is_running: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Hand assigned tasks to `dispatcher` instead of the no-op default
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn analyzer(&self) -> &Arc<DependencyAnalyzer> {
        &self.analyzer
    }

    pub fn matcher(&self) -> &Arc<CapabilityMatcher> {
        &self.matcher
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn distributor(&self) -> &Arc<TaskDistributor> {
        &self.distributor
    }

    /// Receive engine events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Start the periodic distribution and rebalance cycle
    pub async fn start(&self) -> SwarmResult<()> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Distribution loop already running");
            return Ok(());
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.distribution_loop().await;
        });

        info!(
            interval_ms = self.config.distribution_interval_ms,
            "Swarm coordinator started"
        );
        Ok(())
    }

    /// Stop the periodic cycle
    pub async fn shutdown(&self) -> SwarmResult<()> {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        info!("Swarm coordinator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    async fn distribution_loop(&self) {
        let mut ticker = interval(self.config.distribution_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }

        debug!("Distribution loop stopped");
    }

    /// One distribution pass followed by a rebalance
    pub async fn run_cycle(&self) {
        self.distribute_ready_tasks().await;
        self.rebalance_tasks().await;
    }

    /// Register an agent and offer it pending work
    pub async fn register_agent(&self, agent: Agent) -> SwarmResult<()> {
        let agent_id = agent.id.clone();
        let agent_type = agent.capability.agent_type.clone();
        self.registry.register_agent(agent)?;
        telemetry::record_agent_count(self.registry.len());

        self.emit(SwarmEvent::AgentRegistered {
            agent_id,
            agent_type,
            timestamp: Utc::now(),
        });
        self.run_cycle().await;
        Ok(())
    }

    /// Remove an agent; tasks it still held are failed
    pub async fn unregister_agent(&self, agent_id: &str) -> Option<Agent> {
        let removed = self.registry.unregister_agent(agent_id)?;
        self.backoffs.clear(agent_id);
        telemetry::record_agent_count(self.registry.len());

        let failed = self.distributor.fail_tasks_of_agent(agent_id, AGENT_UNREGISTERED);
        if !failed.is_empty() {
            warn!(agent_id, tasks = ?failed, "Tasks failed after agent left the swarm");
        }

        self.emit(SwarmEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Some(removed)
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.registry.get_agent(agent_id)
    }

    pub fn get_available_agents(&self) -> Vec<Agent> {
        self.registry.get_available_agents()
    }

    /// Set an agent's status, then rerun distribution
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> SwarmResult<AgentStatus> {
        let stored = self.registry.update_agent_status(agent_id, status)?;
        self.emit(SwarmEvent::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            status: stored,
            timestamp: Utc::now(),
        });
        self.run_cycle().await;
        Ok(stored)
    }

    /// Accept a task; it is picked up by the next distribution pass
    pub async fn submit_task(&self, task: Task) -> SwarmResult<()> {
        self.distributor.submit_task(task)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.distributor.get_task(task_id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.distributor.tasks()
    }

    /// Assign every ready task and dispatch the assignments
    pub async fn distribute_ready_tasks(&self) -> DistributionReport {
        let report = self.distributor.distribute_ready_tasks();
        self.dispatch_assigned(&report.assigned);
        report
    }

    /// Re-evaluate deferred tasks; distributes again if any became runnable
    pub async fn rebalance_tasks(&self) -> RebalanceReport {
        let report = self.balancer.rebalance_tasks();
        if !report.promoted.is_empty() || !report.rejected.is_empty() {
            self.distribute_ready_tasks().await;
        }
        report
    }

    /// Assign a task to a specific agent and dispatch it
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> SwarmResult<()> {
        self.distributor.assign_task(task_id, agent_id)?;
        self.dispatch_assigned(&[(task_id.to_string(), agent_id.to_string())]);
        Ok(())
    }

    pub async fn start_task(&self, task_id: &str) -> SwarmResult<()> {
        self.distributor.start_task(task_id)
    }

    /// Complete a task and distribute whatever it unblocked
    pub async fn complete_task(&self, task_id: &str) -> SwarmResult<()> {
        self.distributor.complete_task(task_id)?;
        self.run_cycle().await;
        Ok(())
    }

    pub async fn fail_task(&self, task_id: &str, reason: impl Into<String>) -> SwarmResult<()> {
        self.distributor.fail_task(task_id, reason)?;
        self.run_cycle().await;
        Ok(())
    }

    pub async fn cancel_task(&self, task_id: &str) -> SwarmResult<()> {
        self.distributor.cancel_task(task_id)?;
        self.run_cycle().await;
        Ok(())
    }

    fn dispatch_assigned(&self, assigned: &[(TaskId, AgentId)]) {
        for (task_id, agent_id) in assigned {
            let (Some(task), Some(agent)) = (
                self.distributor.get_task(task_id),
                self.registry.get_agent(agent_id),
            ) else {
                continue;
            };

            let dispatcher = self.dispatcher.clone();
            let distributor = self.distributor.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(task, agent).await {
                    error!(task_id = %task_id, error = %e, "Task dispatch failed");
                    let reason = format!("dispatch failed: {e}");
                    if let Err(err) = distributor.fail_task(&task_id, reason) {
                        debug!(
                            task_id = %task_id,
                            error = %err,
                            "Task moved on before dispatch failure was recorded"
                        );
                    }
                }
            });
        }
    }

    /// Ingest operations reported by agents.
    ///
    /// Operations are buffered for the detection window. Conflicts not seen
    /// before are resolved using the highest priority each agent is working
    /// at, losers are backed off, and the new conflicts are returned.
    pub async fn report_operations(
        &self,
        operations: Vec<AgentOperation>,
    ) -> Vec<(Conflict, ConflictResolution)> {
        let buffered: Vec<AgentOperation> = {
            let mut buffer = self.operations.lock();
            buffer.extend(operations);
            if let Some(newest) = buffer.iter().map(|op| op.timestamp).max() {
                let window = self.config.conflict_window_ms as i64;
                buffer.retain(|op| (newest - op.timestamp).num_milliseconds() <= window);
            }
            buffer.iter().cloned().collect()
        };

        let mut fresh = Vec::new();
        for mut conflict in self.resolver.detect_conflicts(&buffered) {
            if self.conflicts.contains_key(&conflict.id) {
                continue;
            }
            let priorities = self.agent_priorities(&conflict, &buffered);
            let resolution = self.resolver.resolve_conflict_with_priorities(&conflict, &priorities);
            conflict.resolution = Some(resolution.clone());

            match self.conflicts.entry(conflict.id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(conflict.clone());
                }
            }
            self.prune_conflict_history();

            warn!(
                conflict_id = %conflict.id,
                conflict_type = conflict.conflict_type.as_str(),
                severity = ?conflict.severity,
                agents = ?conflict.agent_ids,
                "Conflict detected"
            );
            self.emit(SwarmEvent::ConflictDetected {
                conflict_id: conflict.id,
                conflict_type: conflict.conflict_type,
                agent_ids: conflict.agent_ids.clone(),
                timestamp: conflict.detected_at,
            });

            let delay = self.config.default_backoff();
            for agent_id in self.resolver.apply_resolution(&resolution, delay) {
                self.emit(SwarmEvent::BackoffApplied {
                    agent_id,
                    delay_ms: self.config.default_backoff_ms,
                    timestamp: Utc::now(),
                });
            }
            if resolution.requires_human_review {
                warn!(
                    conflict_id = %conflict.id,
                    reason = %resolution.reason,
                    "Conflict escalated for human review"
                );
            }
            self.emit(SwarmEvent::ConflictResolved {
                conflict_id: conflict.id,
                strategy: resolution.strategy,
                requires_human_review: resolution.requires_human_review,
                timestamp: Utc::now(),
            });

            fresh.push((conflict, resolution));
        }
        fresh
    }

    /// Highest task priority each involved agent is working at
    fn agent_priorities(
        &self,
        conflict: &Conflict,
        operations: &[AgentOperation],
    ) -> HashMap<AgentId, i32> {
        let mut priorities = HashMap::new();
        for agent_id in &conflict.agent_ids {
            let active = self
                .distributor
                .active_tasks_of(agent_id)
                .into_iter()
                .map(|task| task.priority);
            let reported = operations
                .iter()
                .filter(|op| &op.agent_id == agent_id)
                .filter_map(|op| op.task_id.as_deref())
                .filter_map(|task_id| self.distributor.get_task(task_id))
                .map(|task| task.priority);
            if let Some(top) = active.chain(reported).max() {
                priorities.insert(agent_id.clone(), top);
            }
        }
        priorities
    }

    /// Drop the oldest conflicts beyond `conflict_history_limit`
    fn prune_conflict_history(&self) {
        let excess = self.conflicts.len().saturating_sub(self.config.conflict_history_limit);
        if excess == 0 {
            return;
        }
        for conflict in self.conflicts().into_iter().take(excess) {
            self.conflicts.remove(&conflict.id);
        }
        debug!(dropped = excess, "Pruned conflict history");
    }

    /// Conflicts still held in the history, oldest first
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> =
            self.conflicts.iter().map(|entry| entry.value().clone()).collect();
        conflicts.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.id.cmp(&b.id)));
        conflicts
    }

    /// Replace the externally supplied compliance thresholds
    pub fn set_compliance_thresholds(&self, thresholds: ComplianceThresholds) {
        *self.thresholds.write() = thresholds;
    }

    pub fn compliance_thresholds(&self) -> ComplianceThresholds {
        self.thresholds.read().clone()
    }

    /// CS5: agents slower than the performance threshold
    pub fn check_cs5_compliance(&self) -> Vec<ComplianceViolation> {
        let thresholds = self.compliance_thresholds();
        compliance::check_cs5(&self.registry.agents(), &thresholds)
    }

    /// CS6: tasks touching protected targets without authorization
    pub fn check_cs6_compliance(&self) -> Vec<ComplianceViolation> {
        let thresholds = self.compliance_thresholds();
        compliance::check_cs6(&self.distributor.tasks(), &thresholds)
    }

    /// Point-in-time snapshot for telemetry and dashboards
    pub fn state(&self) -> SwarmState {
        SwarmState {
            agents: self.registry.agents(),
            tasks: self.distributor.tasks(),
            conflicts: self.conflicts(),
            loads: self.balancer.get_all_agent_loads(),
            timestamp: Utc::now(),
        }
    }

    fn emit(&self, event: SwarmEvent) {
        telemetry::record_event(&event);
        // Lagging or absent subscribers never block the engine
        let _ = self.events.send(event);
    }
}
