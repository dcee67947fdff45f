// apps/kernel-server/src/graph_view.rs
// Purpose: Renders the [OPERATIONAL AWARENESS] context block injected into
// an agent's invocation. §4.5
// Architecture: Domain Logic
// Dependencies: dag, models

use crate::dag::DAG;
use crate::models::{AgentNodeConfig, RuntimeState};

const PREVIEW_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }
}

fn node_status(state: &RuntimeState, id: &str) -> NodeStatus {
    if state.completed_agents.iter().any(|a| a == id) {
        NodeStatus::Completed
    } else if state.failed_agents.iter().any(|a| a == id) {
        NodeStatus::Failed
    } else if state.active_agents.iter().any(|a| a == id) {
        NodeStatus::Running
    } else {
        NodeStatus::Pending
    }
}

fn specialty_preview(agents: &[AgentNodeConfig], id: &str) -> String {
    agents
        .iter()
        .find(|a| a.id == id)
        .map(|a| {
            let p = &a.prompt;
            if p.chars().count() > PREVIEW_LEN {
                let truncated: String = p.chars().take(PREVIEW_LEN).collect();
                format!("{}...", truncated)
            } else {
                p.clone()
            }
        })
        .unwrap_or_default()
}

/// Renders the `[OPERATIONAL AWARENESS]` block for `current_agent_id`.
/// Detailed mode (privileged delegators) lists every node with full
/// metadata; linear mode (workers) emits a single topologically-ordered
/// arrow chain.
pub fn render(
    dag: &DAG,
    agents: &[AgentNodeConfig],
    state: &RuntimeState,
    current_agent_id: &str,
    allow_delegation: bool,
) -> String {
    let order = match dag.topological_sort() {
        Ok(o) => o,
        Err(_) => return "[OPERATIONAL AWARENESS] diagnostic: graph topology is currently inconsistent".to_string(),
    };

    if allow_delegation {
        render_detailed(dag, agents, state, current_agent_id, &order)
    } else {
        render_linear(agents, state, current_agent_id, &order)
    }
}

fn render_detailed(
    dag: &DAG,
    agents: &[AgentNodeConfig],
    state: &RuntimeState,
    current_agent_id: &str,
    order: &[String],
) -> String {
    let mut lines = vec!["[OPERATIONAL AWARENESS]".to_string()];

    for id in order {
        let status = node_status(state, id);
        let is_you = id == current_agent_id;
        let deps = dag.get_dependencies(id);

        let mut line = format!(
            "- id={} status={} is_you={} dependencies=[{}]",
            id,
            status.as_str(),
            is_you,
            deps.join(", ")
        );

        if status == NodeStatus::Pending {
            let preview = specialty_preview(agents, id);
            if !preview.is_empty() {
                line.push_str(&format!(" specialty=\"{}\"", preview));
            }
        }

        lines.push(line);
    }

    lines.join("\n")
}

fn render_linear(agents: &[AgentNodeConfig], state: &RuntimeState, current_agent_id: &str, order: &[String]) -> String {
    let mut tokens = Vec::new();

    for id in order {
        let status = node_status(state, id);
        let mut token = format!("[{}:{}]", id, status.as_str().to_uppercase());

        if id == current_agent_id {
            token.push_str("(YOU)");
        }

        if status == NodeStatus::Pending {
            let preview = specialty_preview(agents, id);
            if !preview.is_empty() {
                token.push_str(&format!("({})", preview));
            }
        }

        tokens.push(token);
    }

    format!("[OPERATIONAL AWARENESS] {}", tokens.join(" -> "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRole, CachePolicy, RuntimeStatus};
    use chrono::Utc;

    fn agent(id: &str, prompt: &str) -> AgentNodeConfig {
        AgentNodeConfig {
            id: id.to_string(),
            role: AgentRole::Worker,
            model: Default::default(),
            tools: vec![],
            prompt: prompt.to_string(),
            user_directive: String::new(),
            depends_on: vec![],
            accepts_directive: false,
            allow_delegation: false,
            cache_policy: CachePolicy::Off,
            position: None,
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
        }
    }

    fn state(run_id: &str) -> RuntimeState {
        RuntimeState {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            client_id: "public".to_string(),
            status: RuntimeStatus::Running,
            active_agents: vec!["b".to_string()],
            completed_agents: vec!["a".to_string()],
            failed_agents: vec![],
            invocations: vec![],
            total_tokens_used: 0,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            pause_reason: None,
        }
    }

    fn chain_dag() -> DAG {
        let mut dag = DAG::new();
        for n in ["a", "b", "c"] {
            dag.add_node(n.to_string()).unwrap();
        }
        dag.add_edge("a".to_string(), "b".to_string()).unwrap();
        dag.add_edge("b".to_string(), "c".to_string()).unwrap();
        dag
    }

    #[test]
    fn linear_mode_marks_current_agent_and_previews_pending() {
        let dag = chain_dag();
        let agents = vec![agent("a", "summarize"), agent("b", "analyze data"), agent("c", "write the final report to disk")];
        let s = state("r1");

        let view = render(&dag, &agents, &s, "b", false);
        assert!(view.contains("(YOU)"));
        assert!(view.contains("[a:COMPLETED]"));
        assert!(view.contains("[b:RUNNING](YOU)"));
        assert!(view.contains("[c:PENDING]"));
        assert!(view.contains("write the final report to disk"));
    }

    #[test]
    fn detailed_mode_lists_dependencies_per_node() {
        let dag = chain_dag();
        let agents = vec![agent("a", "p"), agent("b", "p"), agent("c", "p")];
        let s = state("r1");

        let view = render(&dag, &agents, &s, "a", true);
        assert!(view.contains("id=b"));
        assert!(view.contains("dependencies=[a]"));
    }
}
