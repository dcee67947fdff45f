// apps/kernel-server/src/surgeon.rs
// Purpose: Applies a delegation proposal to the live DAG and agent manifest.
// §4.9
// Architecture: Domain Logic
// Dependencies: dag, models

use crate::dag::DAG;
use crate::models::{AgentNodeConfig, DelegationRequest, DelegationStrategy, RuntimeState};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurgeonError {
    /// A delegator tried to spawn a node whose id prefix implies a higher
    /// privilege tier than its own.
    PrivilegeViolation(String),
    /// `new_nodes` referenced a `depends_on` id that exists nowhere in the
    /// batch or the live graph.
    DanglingDependency(String),
}

fn privilege_of(id: &str) -> u8 {
    let lowered = id.to_lowercase();
    if lowered.starts_with("master") {
        2
    } else if lowered.starts_with("orch") {
        1
    } else {
        0
    }
}

fn mint_fresh_id(original: &str) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}_{}", original, suffix)
}

fn is_settled(state: &RuntimeState, id: &str) -> bool {
    state.active_agents.iter().any(|a| a == id)
        || state.completed_agents.iter().any(|a| a == id)
        || state.failed_agents.iter().any(|a| a == id)
}

/// Result of applying one delegation batch: the nodes that actually entered
/// the manifest (post id-collision rewriting), for the caller to append to
/// its agent list and persist.
pub struct SurgeryResult {
    pub applied_nodes: Vec<AgentNodeConfig>,
}

/// Splices `request.new_nodes` into `dag`, mutating it in place, and returns
/// the node configs (with any ids rewritten to resolve collisions) that the
/// caller must fold into the workflow's agent manifest.
///
/// Every strategy shares the same privilege check and id-collision
/// resolution; they differ only in how the new nodes attach to `delegator_id`
/// and its existing dependents.
pub fn apply_delegation(
    dag: &mut DAG,
    state: &RuntimeState,
    delegator_id: &str,
    request: DelegationRequest,
) -> Result<SurgeryResult, SurgeonError> {
    if request.new_nodes.is_empty() {
        return Ok(SurgeryResult { applied_nodes: vec![] });
    }

    let delegator_privilege = privilege_of(delegator_id);
    for node in &request.new_nodes {
        if privilege_of(&node.id) > delegator_privilege {
            return Err(SurgeonError::PrivilegeViolation(node.id.clone()));
        }
    }

    // Resolve id collisions before touching the graph: a collision with a
    // pending (not yet run) node is an adoption-and-overwrite; a collision
    // with a settled node (running/completed/failed) gets a fresh suffixed
    // id so history is never silently clobbered.
    let mut id_rewrite: HashMap<String, String> = HashMap::new();
    let mut adopted: Vec<String> = Vec::new();

    for node in &request.new_nodes {
        if dag.contains(&node.id) {
            if is_settled(state, &node.id) {
                let fresh = mint_fresh_id(&node.id);
                id_rewrite.insert(node.id.clone(), fresh);
            } else {
                adopted.push(node.id.clone());
            }
        }
    }

    let mut applied_nodes: Vec<AgentNodeConfig> = request
        .new_nodes
        .into_iter()
        .map(|mut node| {
            if let Some(fresh) = id_rewrite.get(&node.id) {
                node.id = fresh.clone();
            }
            node.depends_on = node
                .depends_on
                .into_iter()
                .map(|dep| id_rewrite.get(&dep).cloned().unwrap_or(dep))
                .collect();
            node
        })
        .collect();

    let new_ids: std::collections::HashSet<String> = applied_nodes.iter().map(|n| n.id.clone()).collect();

    // Validate every declared dependency resolves to either a sibling in this
    // batch or an existing graph node before mutating anything -- a bad
    // reference must fail the whole batch, not silently drop one edge.
    for node in &applied_nodes {
        for dep in &node.depends_on {
            if !new_ids.contains(dep) && !dag.contains(dep) {
                return Err(SurgeonError::DanglingDependency(dep.clone()));
            }
        }
    }

    for id in &adopted {
        dag.clear_incoming_edges(id);
    }
    for node in &applied_nodes {
        dag.add_node(node.id.clone()).ok();
    }

    // Entry nodes: no explicit depends_on of their own within or outside the
    // batch. Terminal nodes: not depended on by any sibling in the batch --
    // these are the attachment points for downstream rewiring.
    let referenced_as_dep: std::collections::HashSet<&String> = applied_nodes
        .iter()
        .flat_map(|n| n.depends_on.iter())
        .filter(|d| new_ids.contains(*d))
        .collect();

    let entry_ids: Vec<String> = applied_nodes
        .iter()
        .filter(|n| n.depends_on.is_empty())
        .map(|n| n.id.clone())
        .collect();
    let terminal_ids: Vec<String> = applied_nodes
        .iter()
        .filter(|n| !referenced_as_dep.contains(&n.id))
        .map(|n| n.id.clone())
        .collect();

    for node in &applied_nodes {
        for dep in &node.depends_on {
            if dag.contains(dep) {
                dag.add_edge(dep.clone(), node.id.clone()).ok();
            }
        }
    }

    match request.strategy {
        DelegationStrategy::Child => {
            // The bug this fixes: a proposed node can legitimately share an
            // id with one of the delegator's existing dependents (adoption).
            // Rewiring that dependent to depend on the just-added node of the
            // same id produces a self-loop unless the new ids are subtracted
            // from the dependent set before rewiring.
            let dependents: Vec<String> = dag
                .get_dependents(delegator_id)
                .into_iter()
                .filter(|d| !new_ids.contains(d))
                .collect();

            for entry in &entry_ids {
                dag.add_edge(delegator_id.to_string(), entry.clone()).ok();
            }
            for dependent in &dependents {
                dag.remove_edge(delegator_id, dependent).ok();
                for terminal in &terminal_ids {
                    dag.add_edge(terminal.clone(), dependent.clone()).ok();
                }
            }
        }
        DelegationStrategy::Append => {
            for entry in &entry_ids {
                dag.add_edge(delegator_id.to_string(), entry.clone()).ok();
            }
        }
        DelegationStrategy::Sibling => {
            let upstream = dag.get_dependencies(delegator_id);
            for entry in &entry_ids {
                for parent in &upstream {
                    dag.add_edge(parent.clone(), entry.clone()).ok();
                }
            }
        }
        DelegationStrategy::Replace => {
            // Per spec.md §4.9: Replace skips dependent rewiring entirely --
            // the delegator's existing children stay attached to it exactly
            // as they were. Only the new nodes get spliced in underneath the
            // delegator; nothing downstream is touched or removed.
            for entry in &entry_ids {
                dag.add_edge(delegator_id.to_string(), entry.clone()).ok();
            }
        }
    }

    applied_nodes.retain(|n| dag.contains(&n.id));

    Ok(SurgeryResult { applied_nodes })
}
