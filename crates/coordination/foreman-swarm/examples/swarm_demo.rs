//! Demonstration of swarm coordination: matching, dependencies, conflicts and compliance

use foreman_swarm::prelude::*;
use foreman_swarm::compliance::TARGET_FILE_KEY;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,foreman_swarm=debug")
        .init();

    info!("🚀 Starting Swarm Coordination Demo");

    let config = match std::env::args().nth(1) {
        Some(path) => SwarmConfig::from_file(path)?,
        None => SwarmConfig {
            distribution_interval_ms: 200,
            ..SwarmConfig::default()
        },
    };
    let coordinator = SwarmCoordinator::new(config);
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                info!(target: "swarm_demo::events", "{line}");
            }
        }
    });

    coordinator
        .register_agent(Agent::new(
            "builder-ui",
            "UI Builder",
            AgentCapability::new(AgentType::Builder)
                .with_skills(["typescript", "react"])
                .with_context(["ui"])
                .with_risk_level(RiskLevel::Medium)
                .with_max_concurrent_tasks(2)
                .with_performance(900, 0.97),
        ))
        .await?;
    coordinator
        .register_agent(Agent::new(
            "builder-api",
            "API Builder",
            AgentCapability::new(AgentType::Builder)
                .with_skills(["typescript", "sql"])
                .with_context(["api"])
                .with_risk_level(RiskLevel::High)
                .with_max_concurrent_tasks(2)
                .with_performance(4200, 0.91),
        ))
        .await?;
    coordinator
        .register_agent(Agent::new(
            "qa-1",
            "QA Agent",
            AgentCapability::new(AgentType::Qa)
                .with_skills(["testing"])
                .with_max_concurrent_tasks(3),
        ))
        .await?;
    info!("✅ Registered 3 agents");

    coordinator
        .submit_task(Task::new(
            "schema",
            TaskRequirements::new("build")
                .with_skills(["sql"])
                .with_context(["api"])
                .with_risk_level(RiskLevel::Medium)
                .with_priority(8),
        ))
        .await?;
    coordinator
        .submit_task(
            Task::new(
                "endpoints",
                TaskRequirements::new("build").with_skills(["typescript"]).with_context(["api"]),
            )
            .with_dependencies(["schema"]),
        )
        .await?;
    coordinator
        .submit_task(
            Task::new(
                "page",
                TaskRequirements::new("build").with_skills(["react"]).with_context(["ui"]),
            )
            .with_dependencies(["endpoints"]),
        )
        .await?;
    coordinator
        .submit_task(
            Task::new("e2e", TaskRequirements::new("qa").with_skills(["testing"]))
                .with_dependencies(["page", "endpoints"]),
        )
        .await?;
    coordinator
        .submit_task(
            Task::new(
                "pipeline",
                TaskRequirements::new("modify")
                    .with_skills(["typescript"])
                    .with_governance_constraints(["CS2_PROTECTED_FILE"]),
            )
            .with_metadata(TARGET_FILE_KEY, serde_json::json!(".github/workflows/qiel.yml")),
        )
        .await?;

    info!(waves = ?coordinator.analyzer().get_execution_waves()?, "📋 Execution plan");

    coordinator.start().await?;

    let now = chrono::Utc::now();
    for (conflict, resolution) in coordinator
        .report_operations(vec![
            AgentOperation::new("builder-ui", "file_modify", "app/page.tsx").at(now),
            AgentOperation::new("builder-api", "file_modify", "app/page.tsx").at(now),
        ])
        .await
    {
        info!(
            "⚠️  {} conflict on {:?}: {} ({})",
            conflict.conflict_type.as_str(),
            conflict.target,
            resolution.strategy.as_str(),
            resolution.reason
        );
    }

    // Play the agents: run whatever is assigned until everything settles
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let assigned: Vec<Task> = coordinator
            .tasks()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Assigned)
            .collect();
        if assigned.is_empty() && coordinator.distributor().pending_tasks().is_empty() {
            break;
        }
        for task in assigned {
            coordinator.start_task(&task.id).await?;
            coordinator.complete_task(&task.id).await?;
            info!("✅ {} completed by {:?}", task.id, task.assigned_agent);
        }
    }

    for violation in coordinator
        .check_cs5_compliance()
        .into_iter()
        .chain(coordinator.check_cs6_compliance())
    {
        info!("🛡️  {}: {}", violation.code, violation.message);
    }

    let state = coordinator.state();
    info!(
        agents = state.agents.len(),
        tasks = state.tasks.len(),
        conflicts = state.conflicts.len(),
        "📊 Final state"
    );

    coordinator.shutdown().await?;
    info!("🏁 Demo finished");
    Ok(())
}
