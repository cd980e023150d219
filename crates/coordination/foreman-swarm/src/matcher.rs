//! Capability matching
//!
//! Scores registered agents against a task's requirements. An agent is a
//! candidate only if it shares at least one required skill, tolerates the
//! task's risk level, is neither blocked nor full, and is not inside a
//! backoff window. Candidates score
//!
//! ```text
//! round(50 * skill_overlap + 20 * context_overlap + 15 * success_rate + status_bonus)
//! ```
//!
//! with a status bonus of 15 for idle agents and 0 for busy ones. The bonus
//! outweighs any success-rate difference, so an idle agent always beats a
//! busy agent of the same skill fit.

use crate::{conflict::BackoffTable, registry::AgentRegistry, types::*};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

const SKILL_WEIGHT: f64 = 50.0;
const CONTEXT_WEIGHT: f64 = 20.0;
const PERFORMANCE_WEIGHT: f64 = 15.0;
const IDLE_BONUS: f64 = 15.0;

/// Ranks agents for a set of requirements
pub struct CapabilityMatcher {
    registry: Arc<AgentRegistry>,
    backoffs: Arc<BackoffTable>,
}

impl CapabilityMatcher {
    pub fn new(registry: Arc<AgentRegistry>, backoffs: Arc<BackoffTable>) -> Self {
        Self { registry, backoffs }
    }

    /// Score of `agent` for `requirements`; 0 when the agent is not a candidate.
    ///
    /// Backoff windows are not consulted here, see [`Self::candidate_score`].
    pub fn calculate_match_score(&self, agent: &Agent, requirements: &TaskRequirements) -> u8 {
        score(agent, requirements).unwrap_or(0)
    }

    /// Score of `agent`, or `None` when it is excluded outright
    pub fn candidate_score(&self, agent: &Agent, requirements: &TaskRequirements) -> Option<u8> {
        if self.backoffs.is_backed_off(&agent.id) {
            return None;
        }
        score(agent, requirements)
    }

    /// Highest-ranked candidate, if any
    pub fn find_best_agent(&self, requirements: &TaskRequirements) -> Option<MatchResult> {
        self.find_all_matching_agents(requirements).into_iter().next()
    }

    /// All candidates, best first.
    ///
    /// Ties are broken by lower average response time, then by agent id.
    pub fn find_all_matching_agents(&self, requirements: &TaskRequirements) -> Vec<MatchResult> {
        let mut ranked: Vec<(u8, u64, AgentId)> = self
            .registry
            .agents()
            .into_iter()
            .filter_map(|agent| {
                self.candidate_score(&agent, requirements).map(|score| {
                    (score, agent.capability.performance.avg_response_time_ms, agent.id)
                })
            })
            .collect();

        ranked.sort_by(|a, b| match b.0.cmp(&a.0) {
            Ordering::Equal => (a.1, &a.2).cmp(&(b.1, &b.2)),
            other => other,
        });

        ranked
            .into_iter()
            .map(|(match_score, _, agent_id)| MatchResult { agent_id, match_score })
            .collect()
    }
}

/// Whether the agent passes the skill and risk filter, regardless of load
pub(crate) fn is_capable(agent: &Agent, requirements: &TaskRequirements) -> bool {
    let skill_fit = requirements.skills.is_empty()
        || overlap(&agent.capability.skills, &requirements.skills) > 0.0;
    skill_fit && agent.capability.risk_level >= requirements.risk_level
}

fn score(agent: &Agent, requirements: &TaskRequirements) -> Option<u8> {
    if !is_capable(agent, requirements) {
        return None;
    }
    let status_bonus = match agent.status {
        AgentStatus::Idle if agent.has_spare_capacity() => IDLE_BONUS,
        AgentStatus::Busy if agent.has_spare_capacity() => 0.0,
        _ => return None,
    };

    let skill = overlap(&agent.capability.skills, &requirements.skills);
    let context = overlap(&agent.capability.context, &requirements.context);
    let performance = agent.capability.performance.success_rate.clamp(0.0, 1.0);

    let raw = SKILL_WEIGHT * skill
        + CONTEXT_WEIGHT * context
        + PERFORMANCE_WEIGHT * performance
        + status_bonus;
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

/// `|have ∩ want| / |want|`, or 1.0 when nothing is wanted
fn overlap(have: &BTreeSet<String>, want: &BTreeSet<String>) -> f64 {
    if want.is_empty() {
        return 1.0;
    }
    want.intersection(have).count() as f64 / want.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (Arc<AgentRegistry>, Arc<BackoffTable>, CapabilityMatcher) {
        let registry = Arc::new(AgentRegistry::new());
        let backoffs = Arc::new(BackoffTable::new());
        let matcher = CapabilityMatcher::new(registry.clone(), backoffs.clone());
        (registry, backoffs, matcher)
    }

    fn agent(id: &str, skills: &[&str]) -> Agent {
        Agent::new(
            id,
            id,
            AgentCapability::new(AgentType::Builder)
                .with_skills(skills.iter().copied())
                .with_context(["frontend"])
                .with_risk_level(RiskLevel::Medium)
                .with_max_concurrent_tasks(3),
        )
    }

    #[test]
    fn test_full_match_scores_high() {
        let (_, _, matcher) = setup();
        let requirements = TaskRequirements::new("build")
            .with_skills(["typescript", "react"])
            .with_context(["frontend"]);

        let candidate = agent("a", &["typescript", "react"]);
        let score = matcher.calculate_match_score(&candidate, &requirements);
        assert_eq!(score, 100);
    }

    #[test]
    fn test_zero_skill_overlap_excludes() {
        let (registry, _, matcher) = setup();
        registry.register_agent(agent("a", &["python"])).unwrap();
        let requirements = TaskRequirements::new("build").with_skills(["typescript"]);

        assert_eq!(matcher.calculate_match_score(&agent("a", &["python"]), &requirements), 0);
        assert!(matcher.find_best_agent(&requirements).is_none());
    }

    #[test]
    fn test_risk_level_gate() {
        let (_, _, matcher) = setup();
        let requirements = TaskRequirements::new("deploy")
            .with_skills(["typescript"])
            .with_risk_level(RiskLevel::High);
        assert!(matcher.candidate_score(&agent("a", &["typescript"]), &requirements).is_none());
    }

    #[test]
    fn test_idle_beats_busy_with_better_history() {
        let (registry, _, matcher) = setup();
        let mut busy = agent("busy", &["typescript"]).with_current_tasks(["t0"]);
        busy.capability.performance.success_rate = 1.0;
        let mut idle = agent("idle", &["typescript"]);
        idle.capability.performance.success_rate = 0.7;
        registry.register_agent(busy).unwrap();
        registry.register_agent(idle).unwrap();

        let requirements = TaskRequirements::new("build").with_skills(["typescript"]);
        let best = matcher.find_best_agent(&requirements).unwrap();
        assert_eq!(best.agent_id, "idle");
    }

    #[test]
    fn test_ties_prefer_faster_agents() {
        let (registry, _, matcher) = setup();
        let mut slow = agent("a-slow", &["typescript"]);
        slow.capability.performance.avg_response_time_ms = 900;
        let mut fast = agent("b-fast", &["typescript"]);
        fast.capability.performance.avg_response_time_ms = 100;
        registry.register_agent(slow).unwrap();
        registry.register_agent(fast).unwrap();

        let requirements = TaskRequirements::new("build").with_skills(["typescript"]);
        let ranked = matcher.find_all_matching_agents(&requirements);
        assert_eq!(ranked[0].agent_id, "b-fast");
        assert_eq!(ranked[0].match_score, ranked[1].match_score);
    }

    #[test]
    fn test_backed_off_agent_is_not_a_candidate() {
        let (registry, backoffs, matcher) = setup();
        registry.register_agent(agent("a", &["typescript"])).unwrap();
        backoffs.insert("a", Duration::from_secs(60));

        let requirements = TaskRequirements::new("build").with_skills(["typescript"]);
        assert!(matcher.find_best_agent(&requirements).is_none());
    }
}
