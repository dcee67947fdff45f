// apps/kernel-server/src/payload.rs
// Purpose: Assembles the full invocation payload sent to the LLM adapter. §4.6
// Architecture: Domain Logic
// Dependencies: dag, models, capability, graph_view, persistence, signatures, cache_registry

use crate::cache_registry::CacheRegistry;
use crate::capability::{self};
use crate::dag::DAG;
use crate::graph_view;
use crate::models::{AgentNodeConfig, ModelVariant, RuntimeState};
use crate::persistence::PersistenceLayer;
use crate::signatures::SignatureStore;
use serde::{Deserialize, Serialize};

const SEMANTIC_NULL_MARKER: &str = "[STATUS: NULL]";
const ANTI_DUPLICATION_NOTICE: &str =
    "\n\nDo not emit file contents in text; use the file-write tool once, terse prose only.";

/// The wire payload sent to the LLM adapter. Field names and shape mirror §6.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub run_id: String,
    pub agent_id: String,
    pub model: String,
    pub prompt: String,
    pub user_directive: String,
    pub input_data: serde_json::Value,
    pub parent_signature: Option<String>,
    pub cached_content_id: Option<String>,
    pub thinking_level: Option<i32>,
    pub file_paths: Vec<String>,
    pub tools: Vec<String>,
    pub allow_delegation: bool,
    pub graph_view: String,
}

/// Refusal to dispatch raised by the pre-flight context-drought guard (§4.6,
/// §7). Not a `KernelError`: the caller turns this into an AwaitingApproval
/// transition via the Circuit Breaker, not an HTTP-visible failure.
#[derive(Debug, Clone)]
pub struct ContextDrought {
    pub reason: String,
}

struct AssembledContext {
    appendix: String,
    input_data_map: serde_json::Map<String, serde_json::Value>,
    dynamic_files: Vec<String>,
}

fn extract_text(artifact: &serde_json::Value) -> Option<&str> {
    artifact
        .get("result")
        .and_then(|v| v.as_str())
        .or_else(|| artifact.get("output").and_then(|v| v.as_str()))
}

async fn assemble_parent_context(
    run_id: &str,
    depends_on: &[String],
    persistence: &PersistenceLayer,
    storage_root: &str,
) -> AssembledContext {
    let mut appendix = String::new();
    let mut input_data_map = serde_json::Map::new();
    let mut dynamic_files = Vec::new();

    for parent_id in depends_on {
        let Some(artifact) = persistence.fetch_artifact(run_id, parent_id).await else {
            continue;
        };

        if let Some(files) = artifact.get("files_generated").and_then(|v| v.as_array()) {
            for f in files {
                if let Some(name) = f.as_str() {
                    dynamic_files.push(format!("{}/sessions/{}/output/{}", storage_root, run_id, name));
                }
            }
        }

        if let Some(text) = extract_text(&artifact) {
            appendix.push_str(&format!("\n\n=== CONTEXT FROM AGENT {} ===\n{}\n", parent_id, text));
        }

        input_data_map.insert(parent_id.clone(), artifact);
    }

    AssembledContext {
        appendix,
        input_data_map,
        dynamic_files,
    }
}

/// Pre-flight context drought guard (§4.6, §7, §8 property 9): refuses to
/// dispatch an agent with parents when the assembled context is empty, or
/// is purely a semantic-null marker, and no files were produced either.
fn check_drought(agent: &AgentNodeConfig, ctx: &AssembledContext) -> Result<(), ContextDrought> {
    if agent.depends_on.is_empty() {
        return Ok(());
    }

    let trimmed = ctx.appendix.trim();
    let is_empty = trimmed.is_empty();
    let is_pure_null = trimmed.replace(SEMANTIC_NULL_MARKER, "").trim().is_empty() && trimmed.contains(SEMANTIC_NULL_MARKER);

    if (is_empty || is_pure_null) && ctx.dynamic_files.is_empty() {
        return Err(ContextDrought {
            reason: format!(
                "Context Drought: agent '{}' has no usable context from its parents and produced no files",
                agent.id
            ),
        });
    }

    Ok(())
}

fn thinking_level_for(model: &ModelVariant) -> Option<i32> {
    match model {
        ModelVariant::Thinking => Some(5),
        _ => None,
    }
}

/// Builds the full invocation payload for `agent`, or refuses with
/// `ContextDrought` if the pre-flight guard trips.
#[allow(clippy::too_many_arguments)]
pub async fn build(
    run_id: &str,
    agent: &AgentNodeConfig,
    all_agents: &[AgentNodeConfig],
    dag: &DAG,
    state: &RuntimeState,
    signature_store: &SignatureStore,
    cache_registry: &CacheRegistry,
    persistence: &PersistenceLayer,
    storage_root: &str,
    session_input_files: Vec<String>,
) -> Result<InvocationPayload, ContextDrought> {
    let ctx = assemble_parent_context(run_id, &agent.depends_on, persistence, storage_root).await;

    check_drought(agent, &ctx)?;

    let parent_signature = signature_store.first_available(run_id, &agent.depends_on);
    let cached_content_id = cache_registry.get(run_id);

    let has_dynamic_files = !ctx.dynamic_files.is_empty();
    let tools = capability::provision(&agent.id, &agent.tools, has_dynamic_files);

    // System/user split (§9): context and the operator's task live in the
    // user directive, never in the system prompt, so the model can't be
    // induced to echo its own persona back as output.
    let mut system_prompt = agent.prompt.clone();
    if tools.iter().any(|t| t == capability::FILE_WRITE) {
        system_prompt.push_str(ANTI_DUPLICATION_NOTICE);
    }

    let mut user_directive = String::new();
    if !ctx.appendix.trim().is_empty() {
        user_directive.push_str("[OPERATIONAL CONTEXT]");
        user_directive.push_str(&ctx.appendix);
        user_directive.push('\n');
    }
    user_directive.push_str(&agent.user_directive);

    let graph_view_str = graph_view::render(dag, all_agents, state, &agent.id, agent.allow_delegation);

    let mut file_paths = session_input_files;
    file_paths.extend(ctx.dynamic_files);

    Ok(InvocationPayload {
        run_id: run_id.to_string(),
        agent_id: agent.id.clone(),
        model: agent.model.as_wire_str().to_string(),
        prompt: system_prompt,
        user_directive,
        input_data: serde_json::Value::Object(ctx.input_data_map),
        parent_signature,
        cached_content_id,
        thinking_level: thinking_level_for(&agent.model),
        file_paths,
        tools,
        allow_delegation: agent.allow_delegation,
        graph_view: graph_view_str,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRole, CachePolicy, RuntimeStatus};
    use chrono::Utc;

    fn agent(id: &str, depends_on: Vec<&str>) -> AgentNodeConfig {
        AgentNodeConfig {
            id: id.to_string(),
            role: AgentRole::Worker,
            model: ModelVariant::Fast,
            tools: vec![],
            prompt: "You are a worker.".to_string(),
            user_directive: "do the task".to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            accepts_directive: true,
            allow_delegation: false,
            cache_policy: CachePolicy::Off,
            position: None,
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
        }
    }

    fn empty_state() -> RuntimeState {
        RuntimeState {
            run_id: "r1".to_string(),
            workflow_id: "wf".to_string(),
            client_id: "public".to_string(),
            status: RuntimeStatus::Running,
            active_agents: vec![],
            completed_agents: vec!["a".to_string()],
            failed_agents: vec![],
            invocations: vec![],
            total_tokens_used: 0,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            pause_reason: None,
        }
    }

    #[tokio::test]
    async fn no_parents_never_triggers_drought() {
        let a = agent("a", vec![]);
        let dag = {
            let mut d = DAG::new();
            d.add_node("a".to_string()).unwrap();
            d
        };
        let state = empty_state();
        let sig_store = SignatureStore::new();
        sig_store.init_run("r1");
        let cache = CacheRegistry::new();
        let persistence = PersistenceLayer::new(None, 86400, 3600);

        let payload = build(
            "r1", &a, &[a.clone()], &dag, &state, &sig_store, &cache, &persistence, "/app/storage", vec![],
        )
        .await
        .unwrap();

        assert_eq!(payload.agent_id, "a");
        assert!(payload.user_directive.contains("do the task"));
    }

    #[tokio::test]
    async fn drought_triggers_when_persistence_disabled_and_agent_has_parents() {
        // With persistence disabled, fetch_artifact always returns None, so
        // a dependent agent sees an empty appendix and no files.
        let b = agent("b", vec!["a"]);
        let mut dag = DAG::new();
        dag.add_node("a".to_string()).unwrap();
        dag.add_node("b".to_string()).unwrap();
        dag.add_edge("a".to_string(), "b".to_string()).unwrap();

        let state = empty_state();
        let sig_store = SignatureStore::new();
        sig_store.init_run("r1");
        let cache = CacheRegistry::new();
        let persistence = PersistenceLayer::new(None, 86400, 3600);

        let result = build(
            "r1", &b, &[agent("a", vec![]), b.clone()], &dag, &state, &sig_store, &cache, &persistence,
            "/app/storage", vec![],
        )
        .await;

        assert!(result.is_err());
    }
}
