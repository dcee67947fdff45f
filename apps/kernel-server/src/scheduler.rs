// apps/kernel-server/src/scheduler.rs
// Purpose: The dynamic DAG executor loop: dispatch ready agents, apply
// delegation, converge every failure mode through the Circuit Breaker. §4.7
// Architecture: Domain Logic
// Dependencies: dag, payload, protocol, surgeon, circuit_breaker, capability

use crate::circuit_breaker::{self, TripReason};
use crate::events::{EventType, RuntimeEvent};
use crate::fs_manager::WorkspaceInitializer;
use crate::models::{AgentInvocation, AgentNodeConfig, InvocationStatus, ModelVariant, RuntimeStatus};
use crate::payload;
use crate::protocol;
use crate::registry::PatternAction;
use crate::runtime::RARORuntime;
use crate::surgeon::{self, SurgeonError};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn model_variant_for(wire: &str) -> ModelVariant {
    match wire {
        "fast" => ModelVariant::Fast,
        "reasoning" => ModelVariant::Reasoning,
        "thinking" => ModelVariant::Thinking,
        other => ModelVariant::Custom(other.to_string()),
    }
}

/// Runs until the run reaches a terminal state, is paused by the Circuit
/// Breaker, or vanishes from the state store. Safe to call again on the same
/// `run_id` after a resume: it always re-derives the next ready agent from
/// current DAG + state rather than carrying loop-local progress.
pub async fn run(core: Arc<RARORuntime>, run_id: String) {
    tracing::info!("Starting dynamic DAG execution for run {}", run_id);

    loop {
        let Some(state) = core.state_store.get(&run_id) else {
            tracing::warn!("Run {} vanished from state store; stopping scheduler", run_id);
            break;
        };

        if state.status != RuntimeStatus::Running {
            tracing::info!("Run {} is {:?}; scheduler suspending", run_id, state.status);
            break;
        }

        let Some(dag) = core.dag_store.get(&run_id).map(|d| d.clone()) else {
            tracing::error!("DAG missing for run {}", run_id);
            break;
        };

        let order = match dag.topological_sort() {
            Ok(order) => order,
            Err(e) => {
                circuit_breaker::trip(
                    &run_id,
                    "SYSTEM",
                    TripReason::IntegrityError(format!("DAG cycle detected during execution: {}", e)),
                    &core.state_store,
                    &core.persistence,
                    &core.event_bus,
                    &core.pattern_registry,
                    &core.adapter,
                )
                .await;
                break;
            }
        };

        let next_agent_id = order.into_iter().find(|id| {
            !state.completed_agents.contains(id) && !state.failed_agents.contains(id) && !state.active_agents.contains(id)
        });

        let agent_id = match next_agent_id {
            Some(id) => id,
            None => {
                if !state.active_agents.is_empty() {
                    tokio::time::sleep(Duration::from_millis(core.config.poll_interval_ms)).await;
                    continue;
                }
                finalize_run(&core, &run_id, &state.client_id).await;
                break;
            }
        };

        let dependencies_met = dag
            .get_dependencies(&agent_id)
            .iter()
            .all(|d| state.completed_agents.contains(d));

        if !dependencies_met {
            tokio::time::sleep(Duration::from_millis(core.config.poll_interval_ms)).await;
            continue;
        }

        core.state_store.mark_active(&run_id, &agent_id);
        core.persistence.persist_state(&core.state_store.get(&run_id).unwrap()).await;
        core.event_bus.publish(RuntimeEvent::new(
            &run_id,
            EventType::AgentStarted,
            Some(agent_id.clone()),
            json!({ "agent_id": agent_id }),
        ));

        let agent_config: Option<AgentNodeConfig> = core
            .workflows
            .get(&run_id)
            .and_then(|wf| wf.agents.iter().find(|a| a.id == agent_id).cloned());

        let Some(agent_config) = agent_config else {
            circuit_breaker::trip(
                &run_id,
                &agent_id,
                TripReason::IntegrityError(format!("agent config for '{}' missing from manifest", agent_id)),
                &core.state_store,
                &core.persistence,
                &core.event_bus,
                &core.pattern_registry,
                &core.adapter,
            )
            .await;
            continue;
        };

        let all_agents: Vec<AgentNodeConfig> = core
            .workflows
            .get(&run_id)
            .map(|wf| wf.agents.clone())
            .unwrap_or_default();

        // Only entry agents (no dependencies) see the run's attached input
        // files directly; downstream agents get artifacts routed through
        // their parents' `files_generated` instead (handled in payload::build).
        let session_files = if agent_config.depends_on.is_empty() {
            core.workflows
                .get(&run_id)
                .map(|wf| {
                    wf.attached_files
                        .iter()
                        .map(|f| format!("{}/sessions/{}/input/{}", core.config.storage_root, run_id, f))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let payload = match payload::build(
            &run_id,
            &agent_config,
            &all_agents,
            &dag,
            &state,
            &core.signature_store,
            &core.cache_registry,
            &core.persistence,
            &core.config.storage_root,
            session_files,
        )
        .await
        {
            Ok(p) => p,
            Err(drought) => {
                circuit_breaker::trip(
                    &run_id,
                    &agent_id,
                    TripReason::ContextDrought(drought.reason),
                    &core.state_store,
                    &core.persistence,
                    &core.event_bus,
                    &core.pattern_registry,
                    &core.adapter,
                )
                .await;
                continue;
            }
        };

        let response = core.adapter.invoke(&payload).await;

        match response {
            Err(e) => {
                circuit_breaker::trip(
                    &run_id,
                    &agent_id,
                    TripReason::AdapterError(e),
                    &core.state_store,
                    &core.persistence,
                    &core.event_bus,
                    &core.pattern_registry,
                    &core.adapter,
                )
                .await;
            }
            Ok(res) if !res.success => {
                let error = res.error.unwrap_or_else(|| "adapter reported failure with no message".to_string());
                circuit_breaker::trip(
                    &run_id,
                    &agent_id,
                    TripReason::AdapterError(error),
                    &core.state_store,
                    &core.persistence,
                    &core.event_bus,
                    &core.pattern_registry,
                    &core.adapter,
                )
                .await;
            }
            Ok(res) => {
                if let Err(violation) = protocol::validate(&agent_id, &res.output, &res.executed_tools) {
                    circuit_breaker::trip(
                        &run_id,
                        &agent_id,
                        TripReason::ProtocolViolation(violation),
                        &core.state_store,
                        &core.persistence,
                        &core.event_bus,
                        &core.pattern_registry,
                        &core.adapter,
                    )
                    .await;
                    continue;
                }

                let mut pattern_tripped = false;
                for tool in &res.executed_tools {
                    core.event_bus.publish(RuntimeEvent::new(
                        &run_id,
                        EventType::ToolCall,
                        Some(agent_id.clone()),
                        json!({ "agent_id": agent_id, "tool": tool }),
                    ));

                    for pattern in core.pattern_registry.get_patterns_for_trigger("ToolCall") {
                        if pattern.condition == "*" || tool.contains(pattern.condition.as_str()) {
                            if let PatternAction::Interrupt { reason } | PatternAction::RequestApproval { reason } = &pattern.action {
                                circuit_breaker::trip(
                                    &run_id,
                                    &agent_id,
                                    TripReason::PatternTriggered(reason.clone()),
                                    &core.state_store,
                                    &core.persistence,
                                    &core.event_bus,
                                    &core.pattern_registry,
                                    &core.adapter,
                                )
                                .await;
                                pattern_tripped = true;
                                break;
                            }
                        }
                    }
                    if pattern_tripped {
                        break;
                    }
                }

                if pattern_tripped {
                    continue;
                }

                if let Some(delegation) = res.delegation {
                    if !agent_config.allow_delegation {
                        // Defense in depth (§4.10): even if the model
                        // hallucinates a delegation it was never authorized
                        // to issue, discard it silently. Must never fail the run.
                        tracing::warn!(
                            "Discarding delegation from unauthorized agent '{}' (allow_delegation=false)",
                            agent_id
                        );
                    } else {
                        let outcome = {
                            let mut dag_entry = core.dag_store.get_mut(&run_id).expect("dag present");
                            surgeon::apply_delegation(&mut dag_entry, &state, &agent_id, delegation)
                        };

                        match outcome {
                            Ok(result) => {
                                if !result.applied_nodes.is_empty() {
                                    for node in &result.applied_nodes {
                                        core.event_bus.publish(RuntimeEvent::new(
                                            &run_id,
                                            EventType::NodeCreated,
                                            Some(agent_id.clone()),
                                            json!({ "node_id": node.id, "spawned_by": agent_id }),
                                        ));
                                    }
                                    if let Some(mut wf) = core.workflows.get_mut(&run_id) {
                                        wf.agents.extend(result.applied_nodes);
                                    }
                                }
                            }
                            Err(SurgeonError::PrivilegeViolation(id)) => {
                                circuit_breaker::trip(
                                    &run_id,
                                    &agent_id,
                                    TripReason::DelegationRejected(format!(
                                        "'{}' attempted to spawn '{}' at a privilege tier it does not hold",
                                        agent_id, id
                                    )),
                                    &core.state_store,
                                    &core.persistence,
                                    &core.event_bus,
                                    &core.pattern_registry,
                                    &core.adapter,
                                )
                                .await;
                                continue;
                            }
                            Err(SurgeonError::DanglingDependency(id)) => {
                                circuit_breaker::trip(
                                    &run_id,
                                    &agent_id,
                                    TripReason::DelegationRejected(format!(
                                        "proposed node referenced unknown dependency '{}'",
                                        id
                                    )),
                                    &core.state_store,
                                    &core.persistence,
                                    &core.event_bus,
                                    &core.pattern_registry,
                                    &core.adapter,
                                )
                                .await;
                                continue;
                            }
                        }
                    }
                }

                if let Some(sig) = res.thought_signature {
                    let _ = core.signature_store.set(&run_id, &agent_id, sig);
                }

                let artifact_id = if let Some(output) = &res.output {
                    let already_stored = output.get("artifact_stored").and_then(|v| v.as_bool()).unwrap_or(false);
                    if already_stored {
                        Some(format!("run:{}:agent:{}:output", run_id, agent_id))
                    } else {
                        core.persistence.store_artifact(&run_id, &agent_id, output).await
                    }
                } else {
                    None
                };

                if let Some(cached) = res.cached_content_id {
                    core.cache_registry.set(&run_id, cached);
                }

                let _ = core.state_store.record_invocation(
                    &run_id,
                    AgentInvocation {
                        id: Uuid::new_v4().to_string(),
                        agent_id: agent_id.clone(),
                        model_variant: model_variant_for(&payload.model),
                        tools_used: payload.tools.clone(),
                        tokens_used: res.tokens_used,
                        latency_ms: res.latency_ms as u64,
                        status: InvocationStatus::Success,
                        timestamp: Utc::now().to_rfc3339(),
                        artifact_id,
                        error_message: None,
                    },
                );

                core.persistence.persist_state(&core.state_store.get(&run_id).unwrap()).await;

                core.event_bus.publish(RuntimeEvent::new(
                    &run_id,
                    EventType::AgentCompleted,
                    Some(agent_id.clone()),
                    json!({ "agent_id": agent_id, "tokens_used": res.tokens_used }),
                ));
            }
        }
    }

    core.event_bus.retire(&run_id);
}

async fn finalize_run(core: &Arc<RARORuntime>, run_id: &str, client_id: &str) {
    core.state_store.set_status(run_id, RuntimeStatus::Completed);
    core.state_store.set_end_time(run_id, Utc::now().to_rfc3339());

    if let Some(state) = core.state_store.get(run_id) {
        core.persistence.persist_state(&state).await;
    }

    tracing::info!("Workflow run {} completed successfully", run_id);

    // §6.1: a terminal run fires an outbound cleanup call so the adapter can
    // release any per-run sandbox resources it's holding. Best-effort.
    if let Err(e) = core.adapter.cleanup(run_id).await {
        tracing::warn!("Adapter cleanup failed for completed run {}: {}", run_id, e);
    }

    let produced_files = gather_produced_files(core, run_id).await;
    if !produced_files.is_empty() {
        match WorkspaceInitializer::promote_run_to_artifacts(&core.config.storage_root, client_id, run_id, produced_files).await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to promote artifacts for run {}: {}", run_id, e);
                core.event_bus.publish(RuntimeEvent::new(
                    run_id,
                    EventType::SystemIntervention,
                    None,
                    json!({ "action": "artifact_promotion_failed", "error": e.to_string() }),
                ));
            }
        }
    }
}

async fn gather_produced_files(core: &Arc<RARORuntime>, run_id: &str) -> Vec<String> {
    let Some(state) = core.state_store.get(run_id) else { return Vec::new() };
    let mut files = Vec::new();
    for agent_id in &state.completed_agents {
        if let Some(artifact) = core.persistence.fetch_artifact(run_id, agent_id).await {
            if let Some(list) = artifact.get("files_generated").and_then(|v| v.as_array()) {
                for f in list {
                    if let Some(name) = f.as_str() {
                        files.push(name.to_string());
                    }
                }
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapterClient;
    use crate::config::KernelConfig;
    use crate::models::{AgentRole, DelegationRequest, DelegationStrategy, RemoteAgentResponse, RuntimeStatus, WorkflowConfig};

    fn solo_workflow(allow_delegation: bool) -> WorkflowConfig {
        WorkflowConfig {
            id: "wf-delegation".to_string(),
            name: "solo".to_string(),
            agents: vec![AgentNodeConfig {
                id: "solo".to_string(),
                role: AgentRole::Worker,
                model: Default::default(),
                tools: vec![],
                prompt: "do the thing".to_string(),
                user_directive: String::new(),
                depends_on: vec![],
                accepts_directive: false,
                allow_delegation,
                cache_policy: Default::default(),
                position: None,
                input_schema: serde_json::Value::Null,
                output_schema: serde_json::Value::Null,
            }],
            max_token_budget: 0,
            timeout_ms: 0,
            attached_files: vec![],
        }
    }

    fn response_with_delegation() -> RemoteAgentResponse {
        RemoteAgentResponse {
            agent_id: "solo".to_string(),
            success: true,
            output: Some(json!({ "result": "done" })),
            error: None,
            tokens_used: 10,
            input_tokens: 5,
            output_tokens: 5,
            cache_hit: false,
            latency_ms: 1.0,
            cached_content_id: None,
            thought_signature: None,
            executed_tools: vec![],
            delegation: Some(DelegationRequest {
                reason: "spin up a helper".to_string(),
                new_nodes: vec![AgentNodeConfig {
                    id: "helper".to_string(),
                    role: AgentRole::Worker,
                    model: Default::default(),
                    tools: vec![],
                    prompt: "help".to_string(),
                    user_directive: String::new(),
                    depends_on: vec![],
                    accepts_directive: false,
                    allow_delegation: false,
                    cache_policy: Default::default(),
                    position: None,
                    input_schema: serde_json::Value::Null,
                    output_schema: serde_json::Value::Null,
                }],
                strategy: DelegationStrategy::Sibling,
            }),
        }
    }

    #[tokio::test]
    async fn unauthorized_delegation_is_discarded_without_failing_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![Ok(response_with_delegation())]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core
            .start_workflow(solo_workflow(false), "public".to_string())
            .await
            .unwrap();

        run(core.clone(), run_id.clone()).await;

        let state = core.get_state(&run_id).unwrap();
        assert_eq!(state.status, RuntimeStatus::Completed);
        assert!(state.completed_agents.contains(&"solo".to_string()));
        assert!(state.failed_agents.is_empty());

        let topology = core.get_topology_snapshot(&run_id).unwrap();
        let nodes = topology["nodes"].as_array().unwrap();
        assert!(!nodes.iter().any(|n| n == "helper"));
    }

    #[tokio::test]
    async fn authorized_delegation_splices_the_new_node_in() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![
            Ok(response_with_delegation()),
            Ok(RemoteAgentResponse {
                agent_id: "helper".to_string(),
                success: true,
                output: Some(json!({ "result": "done" })),
                error: None,
                tokens_used: 1,
                input_tokens: 1,
                output_tokens: 0,
                cache_hit: false,
                latency_ms: 1.0,
                cached_content_id: None,
                thought_signature: None,
                executed_tools: vec![],
                delegation: None,
            }),
        ]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core
            .start_workflow(solo_workflow(true), "public".to_string())
            .await
            .unwrap();

        run(core.clone(), run_id.clone()).await;

        let state = core.get_state(&run_id).unwrap();
        assert_eq!(state.status, RuntimeStatus::Completed);
        assert!(state.completed_agents.contains(&"helper".to_string()));

        let topology = core.get_topology_snapshot(&run_id).unwrap();
        let nodes = topology["nodes"].as_array().unwrap();
        assert!(nodes.iter().any(|n| n == "helper"));
    }

    fn plain_response(agent_id: &str) -> RemoteAgentResponse {
        RemoteAgentResponse {
            agent_id: agent_id.to_string(),
            success: true,
            output: Some(json!({ "result": "done" })),
            error: None,
            tokens_used: 1,
            input_tokens: 1,
            output_tokens: 0,
            cache_hit: false,
            latency_ms: 1.0,
            cached_content_id: None,
            thought_signature: None,
            executed_tools: vec![],
            delegation: None,
        }
    }

    #[tokio::test]
    async fn orchestrator_delegation_splices_new_node_between_parent_and_child() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let workflow = WorkflowConfig {
            id: "wf-chain".to_string(),
            name: "chain".to_string(),
            agents: vec![
                AgentNodeConfig {
                    id: "a".to_string(),
                    role: AgentRole::Orchestrator,
                    model: Default::default(),
                    tools: vec![],
                    prompt: "lead".to_string(),
                    user_directive: String::new(),
                    depends_on: vec![],
                    accepts_directive: false,
                    allow_delegation: true,
                    cache_policy: Default::default(),
                    position: None,
                    input_schema: serde_json::Value::Null,
                    output_schema: serde_json::Value::Null,
                },
                AgentNodeConfig {
                    id: "b".to_string(),
                    role: AgentRole::Worker,
                    model: Default::default(),
                    tools: vec![],
                    prompt: "follow up".to_string(),
                    user_directive: String::new(),
                    depends_on: vec!["a".to_string()],
                    accepts_directive: false,
                    allow_delegation: false,
                    cache_policy: Default::default(),
                    position: None,
                    input_schema: serde_json::Value::Null,
                    output_schema: serde_json::Value::Null,
                },
            ],
            max_token_budget: 0,
            timeout_ms: 0,
            attached_files: vec![],
        };

        let mut a_response = plain_response("a");
        a_response.delegation = Some(DelegationRequest {
            reason: "need a middle step".to_string(),
            new_nodes: vec![AgentNodeConfig {
                id: "m".to_string(),
                role: AgentRole::Worker,
                model: Default::default(),
                tools: vec![],
                prompt: "middle".to_string(),
                user_directive: String::new(),
                depends_on: vec![],
                accepts_directive: false,
                allow_delegation: false,
                cache_policy: Default::default(),
                position: None,
                input_schema: serde_json::Value::Null,
                output_schema: serde_json::Value::Null,
            }],
            strategy: DelegationStrategy::Child,
        });

        let adapter = Arc::new(MockAdapterClient::new(vec![
            Ok(a_response),
            Ok(plain_response("m")),
            Ok(plain_response("b")),
        ]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core.start_workflow(workflow, "public".to_string()).await.unwrap();

        run(core.clone(), run_id.clone()).await;

        let state = core.get_state(&run_id).unwrap();
        assert_eq!(state.status, RuntimeStatus::Completed);
        for id in ["a", "m", "b"] {
            assert!(state.completed_agents.contains(&id.to_string()));
        }

        let topology = core.get_topology_snapshot(&run_id).unwrap();
        let edges = topology["edges"].as_array().unwrap();
        let has_edge = |from: &str, to: &str| edges.iter().any(|e| e["from"] == from && e["to"] == to);
        assert!(has_edge("a", "m"));
        assert!(has_edge("m", "b"));
        assert!(!has_edge("a", "b"));
    }
}
