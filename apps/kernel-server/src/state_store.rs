// apps/kernel-server/src/state_store.rs
// Purpose: Per-run RuntimeState storage with fine-grained concurrent access.
// Architecture: Core Data Structure
// Dependencies: DashMap

use crate::models::{AgentInvocation, InvocationStatus, RuntimeState, RuntimeStatus};
use dashmap::DashMap;

/// Thread-safe mapping from run_id to RuntimeState. Readers/writers of one
/// run's entry never block readers/writers of another run's entry.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<String, RuntimeState>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore { states: DashMap::new() }
    }

    pub fn insert(&self, run_id: String, state: RuntimeState) {
        self.states.insert(run_id, state);
    }

    pub fn get(&self, run_id: &str) -> Option<RuntimeState> {
        self.states.get(run_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.states.contains_key(run_id)
    }

    /// Snapshot of every tracked run, for metrics export. O(n) in run count;
    /// not on any request hot path.
    pub fn all(&self) -> Vec<RuntimeState> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    pub fn set_status(&self, run_id: &str, status: RuntimeStatus) {
        if let Some(mut state) = self.states.get_mut(run_id) {
            state.status = status;
        }
    }

    pub fn set_pause_reason(&self, run_id: &str, reason: Option<String>) {
        if let Some(mut state) = self.states.get_mut(run_id) {
            state.pause_reason = reason;
        }
    }

    pub fn set_end_time(&self, run_id: &str, end_time: String) {
        if let Some(mut state) = self.states.get_mut(run_id) {
            state.end_time = Some(end_time);
        }
    }

    /// Removes `agent_id` from the failed set so the scheduler will pick it
    /// up again after a prompt edit + resume. No-op if it isn't there.
    pub fn clear_failure(&self, run_id: &str, agent_id: &str) {
        if let Some(mut state) = self.states.get_mut(run_id) {
            state.failed_agents.retain(|a| a != agent_id);
        }
    }

    /// Marks `agent_id` active unless it is already a member of any of the
    /// three sets (active/completed/failed stay pairwise disjoint).
    pub fn mark_active(&self, run_id: &str, agent_id: &str) {
        if let Some(mut state) = self.states.get_mut(run_id) {
            if !state.active_agents.iter().any(|a| a == agent_id)
                && !state.completed_agents.iter().any(|a| a == agent_id)
                && !state.failed_agents.iter().any(|a| a == agent_id)
            {
                state.active_agents.push(agent_id.to_string());
            }
        }
    }

    /// Appends the invocation record, updates the token counter, and moves
    /// `agent_id` between membership sets according to `invocation.status`.
    pub fn record_invocation(&self, run_id: &str, invocation: AgentInvocation) -> Result<(), String> {
        let mut state = self
            .states
            .get_mut(run_id)
            .ok_or_else(|| format!("run not found: {}", run_id))?;

        state.total_tokens_used += invocation.tokens_used;
        state.active_agents.retain(|a| a != &invocation.agent_id);

        match invocation.status {
            InvocationStatus::Running => {
                if !state.active_agents.contains(&invocation.agent_id) {
                    state.active_agents.push(invocation.agent_id.clone());
                }
            }
            InvocationStatus::Success => {
                state.completed_agents.retain(|a| a != &invocation.agent_id);
                state.completed_agents.push(invocation.agent_id.clone());
            }
            InvocationStatus::Failed => {
                state.failed_agents.retain(|a| a != &invocation.agent_id);
                state.failed_agents.push(invocation.agent_id.clone());
            }
        }

        state.invocations.push(invocation);
        Ok(())
    }

    pub fn is_status(&self, run_id: &str, status: RuntimeStatus) -> bool {
        self.states.get(run_id).map(|s| s.status == status).unwrap_or(false)
    }
}
