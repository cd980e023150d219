//! Conflict detection and resolution
//!
//! Agents report the operations they are about to perform. Operations by two
//! or more distinct agents on the same target within the detection window
//! collide. Detection is a pure function of the operation set: the input
//! order never changes the result, and the conflict id is derived from the
//! collision itself so re-running detection over the same buffer yields the
//! same conflict.
//!
//! Backoff windows live in a [`BackoffTable`] shared with the matcher and the
//! load balancer. Windows expire on their own; nothing has to cancel them.

use crate::{
    config::ComplianceThresholds,
    registry::AgentRegistry,
    types::*,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Self-expiring exclusion windows keyed by agent
#[derive(Debug, Default)]
pub struct BackoffTable {
    windows: DashMap<AgentId, Instant>,
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude `agent_id` for `delay`. An existing longer window is kept.
    pub fn insert(&self, agent_id: &str, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.windows
            .entry(agent_id.to_string())
            .and_modify(|current| {
                if *current < deadline {
                    *current = deadline;
                }
            })
            .or_insert(deadline);
    }

    /// Whether the agent is inside an active window; expired windows are dropped
    pub fn is_backed_off(&self, agent_id: &str) -> bool {
        self.remaining(agent_id).is_some()
    }

    /// Time left in the agent's window, if any
    pub fn remaining(&self, agent_id: &str) -> Option<Duration> {
        let now = Instant::now();
        let deadline = *self.windows.get(agent_id)?;
        if deadline > now {
            Some(deadline - now)
        } else {
            self.windows.remove_if(agent_id, |_, d| *d <= now);
            None
        }
    }

    /// Every active window, ordered by agent id
    pub fn active(&self) -> Vec<(AgentId, Duration)> {
        let now = Instant::now();
        self.windows.retain(|_, deadline| *deadline > now);
        let mut active: Vec<(AgentId, Duration)> = self
            .windows
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| (entry.key().clone(), *entry.value() - now))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// Lift a window early; returns whether one was active
    pub fn clear(&self, agent_id: &str) -> bool {
        self.windows.remove(agent_id).is_some()
    }
}

/// Detects collisions in the operation stream and decides who proceeds
pub struct ConflictResolver {
    registry: Arc<AgentRegistry>,
    backoffs: Arc<BackoffTable>,
    window_ms: i64,
    thresholds: Arc<RwLock<ComplianceThresholds>>,
}

impl ConflictResolver {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backoffs: Arc<BackoffTable>,
        window: Duration,
        thresholds: Arc<RwLock<ComplianceThresholds>>,
    ) -> Self {
        Self {
            registry,
            backoffs,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            thresholds,
        }
    }

    /// Shared backoff windows
    pub fn backoffs(&self) -> &Arc<BackoffTable> {
        &self.backoffs
    }

    /// The most severe conflict in `operations`, if any
    pub fn detect_conflict(&self, operations: &[AgentOperation]) -> Option<Conflict> {
        self.detect_conflicts(operations)
            .into_iter()
            .reduce(|best, next| if next.severity > best.severity { next } else { best })
    }

    /// Every conflicting target in `operations`, ordered by target
    pub fn detect_conflicts(&self, operations: &[AgentOperation]) -> Vec<Conflict> {
        let mut by_target: BTreeMap<&str, Vec<&AgentOperation>> = BTreeMap::new();
        for op in operations {
            by_target.entry(op.target.as_str()).or_default().push(op);
        }

        by_target
            .into_iter()
            .filter_map(|(target, ops)| self.collision_on(target, ops))
            .collect()
    }

    fn collision_on(&self, target: &str, mut ops: Vec<&AgentOperation>) -> Option<Conflict> {
        ops.sort_by(|a, b| {
            (a.timestamp, &a.agent_id, &a.operation_type, &a.task_id)
                .cmp(&(b.timestamp, &b.agent_id, &b.operation_type, &b.task_id))
        });

        let mut colliding = vec![false; ops.len()];
        for i in 0..ops.len() {
            for j in (i + 1)..ops.len() {
                if (ops[j].timestamp - ops[i].timestamp).num_milliseconds() > self.window_ms {
                    break;
                }
                if ops[j].agent_id != ops[i].agent_id {
                    colliding[i] = true;
                    colliding[j] = true;
                }
            }
        }

        let involved: Vec<&AgentOperation> = ops
            .iter()
            .zip(&colliding)
            .filter(|(_, hit)| **hit)
            .map(|(op, _)| *op)
            .collect();
        let first = involved.first()?;
        let last = involved.last()?;

        let mut agent_ids: Vec<AgentId> = Vec::new();
        for op in &involved {
            if !agent_ids.contains(&op.agent_id) {
                agent_ids.push(op.agent_id.clone());
            }
        }
        let task_ids: Vec<TaskId> = involved
            .iter()
            .filter_map(|op| op.task_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let operation_types: BTreeSet<String> =
            involved.iter().map(|op| op.operation_type.clone()).collect();

        let conflict_type = self.classify(target, &operation_types);
        let severity = severity_for(conflict_type, agent_ids.len());

        Some(Conflict {
            id: conflict_id(target, &agent_ids, first.timestamp),
            conflict_type,
            description: format!(
                "{} agents operating on {} within {}ms: {}",
                agent_ids.len(),
                target,
                self.window_ms,
                agent_ids.join(", ")
            ),
            agent_ids,
            task_ids,
            target: Some(target.to_string()),
            operation_types,
            severity,
            detected_at: last.timestamp,
            resolution: None,
        })
    }

    fn classify(&self, target: &str, operation_types: &BTreeSet<String>) -> ConflictType {
        let governance_op = operation_types
            .iter()
            .any(|op| op.to_ascii_lowercase().starts_with("governance"));
        if governance_op || self.thresholds.read().is_protected_path(target) {
            return ConflictType::Governance;
        }

        let file_op = operation_types
            .iter()
            .any(|op| op.to_ascii_lowercase().starts_with("file"));
        if file_op || looks_like_path(target) {
            ConflictType::File
        } else {
            ConflictType::Resource
        }
    }

    /// Resolve without task-priority information
    pub fn resolve_conflict(&self, conflict: &Conflict) -> ConflictResolution {
        self.resolve_conflict_with_priorities(conflict, &HashMap::new())
    }

    /// Resolve using the priority each agent is working at
    pub fn resolve_conflict_with_priorities(
        &self,
        conflict: &Conflict,
        priorities: &HashMap<AgentId, i32>,
    ) -> ConflictResolution {
        let resolution = if conflict.severity == Severity::Critical
            || conflict.conflict_type == ConflictType::Governance
        {
            ConflictResolution {
                strategy: ResolutionStrategy::Escalate,
                requires_human_review: true,
                winner: None,
                backed_off: Vec::new(),
                reason: format!(
                    "{} conflict with {:?} severity requires human review",
                    conflict.conflict_type.as_str(),
                    conflict.severity
                ),
            }
        } else if conflict.agent_ids.len() < 2 || conflict.is_read_only() {
            ConflictResolution {
                strategy: ResolutionStrategy::Merge,
                requires_human_review: false,
                winner: None,
                backed_off: Vec::new(),
                reason: "operations do not overlap in effect".to_string(),
            }
        } else {
            by_priority(conflict, priorities)
        };

        debug!(
            conflict_id = %conflict.id,
            strategy = resolution.strategy.as_str(),
            "Conflict resolved"
        );
        resolution
    }

    /// Exclude an agent from scheduling for `delay`.
    ///
    /// Unknown agents are ignored (backoff is advisory); returns whether the
    /// window was applied.
    pub fn apply_backoff(&self, agent_id: &str, delay: Duration) -> bool {
        if !self.registry.contains(agent_id) {
            debug!(agent_id, "Backoff ignored for unknown agent");
            return false;
        }
        self.backoffs.insert(agent_id, delay);
        debug!(agent_id, delay_ms = delay.as_millis() as u64, "Backoff applied");
        true
    }

    /// Apply `delay` to every agent the resolution backs off
    pub fn apply_resolution(
        &self,
        resolution: &ConflictResolution,
        delay: Duration,
    ) -> Vec<AgentId> {
        resolution
            .backed_off
            .iter()
            .filter(|agent_id| self.apply_backoff(agent_id, delay))
            .cloned()
            .collect()
    }

    pub fn is_backed_off(&self, agent_id: &str) -> bool {
        self.backoffs.is_backed_off(agent_id)
    }

    pub fn backoff_remaining(&self, agent_id: &str) -> Option<Duration> {
        self.backoffs.remaining(agent_id)
    }

    pub fn active_backoffs(&self) -> Vec<(AgentId, Duration)> {
        self.backoffs.active()
    }

    pub fn clear_backoff(&self, agent_id: &str) -> bool {
        self.backoffs.clear(agent_id)
    }
}

fn by_priority(conflict: &Conflict, priorities: &HashMap<AgentId, i32>) -> ConflictResolution {
    let rank = |agent_id: &AgentId| priorities.get(agent_id).copied().unwrap_or(i32::MIN);
    let top = conflict.agent_ids.iter().map(rank).max().unwrap_or(i32::MIN);
    let leaders: Vec<&AgentId> = conflict
        .agent_ids
        .iter()
        .filter(|agent_id| rank(agent_id) == top)
        .collect();

    // agent_ids is ordered by first operation, so leaders[0] operated first
    let winner = leaders[0].clone();
    let backed_off: Vec<AgentId> = conflict
        .agent_ids
        .iter()
        .filter(|agent_id| **agent_id != winner)
        .cloned()
        .collect();

    if leaders.len() == 1 && top != i32::MIN {
        ConflictResolution {
            strategy: ResolutionStrategy::Priority,
            requires_human_review: false,
            reason: format!("{winner} holds the highest task priority ({top})"),
            winner: Some(winner),
            backed_off,
        }
    } else {
        ConflictResolution {
            strategy: ResolutionStrategy::Backoff,
            requires_human_review: false,
            reason: format!("equal priority; {winner} operated first"),
            winner: Some(winner),
            backed_off,
        }
    }
}

fn severity_for(conflict_type: ConflictType, agents: usize) -> Severity {
    match conflict_type {
        ConflictType::Governance => Severity::Critical,
        ConflictType::File if agents >= 3 => Severity::High,
        ConflictType::File => Severity::Medium,
        ConflictType::Resource if agents >= 3 => Severity::Medium,
        ConflictType::Resource => Severity::Low,
    }
}

fn looks_like_path(target: &str) -> bool {
    if target.contains('/') || target.contains('\\') {
        return true;
    }
    match target.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn conflict_id(target: &str, agent_ids: &[AgentId], first_seen: DateTime<Utc>) -> ConflictId {
    let mut agents: Vec<&str> = agent_ids.iter().map(String::as_str).collect();
    agents.sort_unstable();
    let key = format!(
        "{}|{}|{}",
        target,
        agents.join(","),
        first_seen.timestamp_nanos_opt().unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn resolver_with(agents: &[&str]) -> ConflictResolver {
        let registry = Arc::new(AgentRegistry::new());
        for id in agents {
            registry
                .register_agent(Agent::new(*id, *id, AgentCapability::new(AgentType::Builder)))
                .unwrap();
        }
        ConflictResolver::new(
            registry,
            Arc::new(BackoffTable::new()),
            Duration::from_millis(5000),
            Arc::new(RwLock::new(ComplianceThresholds::default())),
        )
    }

    #[test]
    fn test_file_conflict_detected() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let ops = vec![
            AgentOperation::new("agent-1", "file_modify", "app/page.tsx").at(now),
            AgentOperation::new("agent-2", "file_modify", "app/page.tsx").at(now),
        ];

        let conflict = resolver.detect_conflict(&ops).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::File);
        assert_eq!(conflict.severity, Severity::Medium);
        assert!(conflict.agent_ids.contains(&"agent-1".to_string()));
        assert!(conflict.agent_ids.contains(&"agent-2".to_string()));
    }

    #[test]
    fn test_same_agent_or_far_apart_is_no_conflict() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let same_agent = vec![
            AgentOperation::new("agent-1", "file_modify", "a.ts").at(now),
            AgentOperation::new("agent-1", "file_modify", "a.ts").at(now),
        ];
        assert!(resolver.detect_conflict(&same_agent).is_none());

        let far_apart = vec![
            AgentOperation::new("agent-1", "file_modify", "a.ts").at(now),
            AgentOperation::new("agent-2", "file_modify", "a.ts")
                .at(now + ChronoDuration::seconds(10)),
        ];
        assert!(resolver.detect_conflict(&far_apart).is_none());
    }

    #[test]
    fn test_protected_target_is_governance() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let ops = vec![
            AgentOperation::new("a", "file_modify", ".github/workflows/qiel.yml").at(now),
            AgentOperation::new("b", "file_modify", ".github/workflows/qiel.yml").at(now),
        ];
        let conflict = resolver.detect_conflict(&ops).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Governance);
        assert_eq!(conflict.severity, Severity::Critical);

        let resolution = resolver.resolve_conflict(&conflict);
        assert_eq!(resolution.strategy, ResolutionStrategy::Escalate);
        assert!(resolution.requires_human_review);
    }

    #[test]
    fn test_resource_target_classification() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let ops = vec![
            AgentOperation::new("a", "lock", "deploy-slot").at(now),
            AgentOperation::new("b", "lock", "deploy-slot").at(now),
        ];
        let conflict = resolver.detect_conflict(&ops).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Resource);
        assert_eq!(conflict.severity, Severity::Low);
    }

    #[test]
    fn test_priority_and_backoff_strategies() {
        let resolver = resolver_with(&[]);
        let conflict = Conflict::new(
            ConflictType::File,
            ["agent-high-priority", "agent-low-priority"],
            "Both agents modifying app/page.tsx",
            Severity::Medium,
        )
        .with_task_ids(["task-1", "task-2"]);

        let equal = resolver.resolve_conflict(&conflict);
        assert_eq!(equal.strategy, ResolutionStrategy::Backoff);
        assert_eq!(equal.winner.as_deref(), Some("agent-high-priority"));
        assert_eq!(equal.backed_off, vec!["agent-low-priority".to_string()]);
        assert!(!equal.requires_human_review);

        let priorities = HashMap::from([
            ("agent-high-priority".to_string(), 3),
            ("agent-low-priority".to_string(), 9),
        ]);
        let ranked = resolver.resolve_conflict_with_priorities(&conflict, &priorities);
        assert_eq!(ranked.strategy, ResolutionStrategy::Priority);
        assert_eq!(ranked.winner.as_deref(), Some("agent-low-priority"));
        assert_eq!(ranked.backed_off, vec!["agent-high-priority".to_string()]);
    }

    #[test]
    fn test_read_only_collision_merges() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let ops = vec![
            AgentOperation::new("a", "file_read", "lib/utils.ts").at(now),
            AgentOperation::new("b", "file_read", "lib/utils.ts").at(now),
        ];
        let conflict = resolver.detect_conflict(&ops).unwrap();
        let resolution = resolver.resolve_conflict(&conflict);
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);
        assert!(resolution.backed_off.is_empty());
    }

    #[test]
    fn test_backoff_expires_on_its_own() {
        let resolver = resolver_with(&["agent-1"]);
        assert!(resolver.apply_backoff("agent-1", Duration::from_millis(30)));
        assert!(resolver.is_backed_off("agent-1"));
        assert!(resolver.backoff_remaining("agent-1").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(!resolver.is_backed_off("agent-1"));
        assert!(resolver.active_backoffs().is_empty());
    }

    #[test]
    fn test_backoff_on_unknown_agent_is_noop() {
        let resolver = resolver_with(&[]);
        assert!(!resolver.apply_backoff("ghost", Duration::from_secs(5)));
        assert!(!resolver.is_backed_off("ghost"));
    }

    #[test]
    fn test_conflict_id_is_stable() {
        let resolver = resolver_with(&[]);
        let now = Utc::now();
        let ops = vec![
            AgentOperation::new("a", "file_modify", "x.rs").at(now),
            AgentOperation::new("b", "file_modify", "x.rs").at(now),
        ];
        let first = resolver.detect_conflict(&ops).unwrap();
        let second = resolver.detect_conflict(&ops).unwrap();
        assert_eq!(first.id, second.id);
    }
}
