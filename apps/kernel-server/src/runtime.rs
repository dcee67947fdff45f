// apps/kernel-server/src/runtime.rs
// Purpose: Composition root wiring every store, layer, and adapter together
// and exposing the run lifecycle operations handlers call into. §4.1
// Architecture: Domain Logic Layer
// Dependencies: dashmap, uuid, chrono

use crate::adapter::LlmAdapterClient;
use crate::cache_registry::CacheRegistry;
use crate::config::KernelConfig;
use crate::dag::DAG;
use crate::error::KernelError;
use crate::event_bus::EventBus;
use crate::events::{EventType, RuntimeEvent};
use crate::fs_manager::WorkspaceInitializer;
use crate::models::{RuntimeState, RuntimeStatus, ThoughtSignatureStore, WorkflowConfig};
use crate::persistence::PersistenceLayer;
use crate::registry::PatternRegistry;
use crate::scheduler;
use crate::signatures::SignatureStore;
use crate::state_store::StateStore;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Holds every piece of mutable kernel state plus the outbound adapter. One
/// instance per server process, shared behind an `Arc` between handlers and
/// every spawned scheduler loop.
///
/// `workflows` and `dag_store` are keyed by `run_id`, not `workflow_id`: two
/// concurrent runs started from the same workflow definition each get their
/// own mutable agent manifest and graph, so a delegation on one run can never
/// bleed into the other.
pub struct RARORuntime {
    pub workflows: DashMap<String, WorkflowConfig>,
    pub dag_store: DashMap<String, DAG>,
    pub state_store: StateStore,
    pub signature_store: SignatureStore,
    pub cache_registry: CacheRegistry,
    pub persistence: PersistenceLayer,
    pub event_bus: EventBus,
    pub pattern_registry: Arc<PatternRegistry>,
    pub adapter: Arc<dyn LlmAdapterClient>,
    pub config: KernelConfig,
}

impl RARORuntime {
    pub fn new(config: KernelConfig, adapter: Arc<dyn LlmAdapterClient>) -> Self {
        let persistence = PersistenceLayer::new(
            config.redis_url.as_deref(),
            config.active_run_ttl_secs,
            config.artifact_ttl_secs,
        );
        let event_bus = EventBus::new(config.event_bus_capacity);

        RARORuntime {
            workflows: DashMap::new(),
            dag_store: DashMap::new(),
            state_store: StateStore::new(),
            signature_store: SignatureStore::new(),
            cache_registry: CacheRegistry::new(),
            persistence,
            event_bus,
            pattern_registry: Arc::new(PatternRegistry::new()),
            adapter,
            config,
        }
    }

    /// Loads every run the persistence layer still has marked active. They
    /// always come back demoted to Failed (the DAG itself isn't persisted,
    /// so there is nothing to actually resume) -- this just makes them
    /// visible in state queries again after a restart.
    pub async fn rehydrate(&self) {
        let states = self.persistence.rehydrate().await;
        let count = states.len();
        for state in states {
            self.state_store.insert(state.run_id.clone(), state);
        }
        if count > 0 {
            tracing::warn!("Rehydrated {} run(s) into Failed state after restart", count);
        }
    }

    /// Validates the workflow's DAG, allocates a run id, materializes its
    /// session workspace, and spawns the scheduler loop for it.
    pub async fn start_workflow(self: &Arc<Self>, config: WorkflowConfig, client_id: String) -> Result<String, KernelError> {
        if config.agents.is_empty() {
            return Err(KernelError::Validation("workflow manifest must declare at least one agent".to_string()));
        }

        let mut dag = DAG::new();

        for agent in &config.agents {
            dag.add_node(agent.id.clone())?;
        }
        for agent in &config.agents {
            for dep in &agent.depends_on {
                dag.add_edge(dep.clone(), agent.id.clone())?;
            }
        }
        dag.topological_sort()?;

        let run_id = Uuid::new_v4().to_string();
        let workflow_id = config.id.clone();

        WorkspaceInitializer::init_run_session(&self.config.storage_root, &run_id, &client_id, config.attached_files.clone())
            .await
            .map_err(|e| KernelError::Internal(format!("workspace init failed: {}", e)))?;

        let state = RuntimeState {
            run_id: run_id.clone(),
            workflow_id,
            client_id,
            status: RuntimeStatus::Running,
            active_agents: Vec::new(),
            completed_agents: Vec::new(),
            failed_agents: Vec::new(),
            invocations: Vec::new(),
            total_tokens_used: 0,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            pause_reason: None,
        };

        self.dag_store.insert(run_id.clone(), dag);
        self.workflows.insert(run_id.clone(), config);
        self.state_store.insert(run_id.clone(), state.clone());
        self.signature_store.init_run(&run_id);

        self.persistence.persist_state(&state).await;

        self.event_bus.publish(RuntimeEvent::new(
            &run_id,
            EventType::SystemIntervention,
            None,
            serde_json::json!({ "action": "start", "workflow_id": state.workflow_id }),
        ));

        let core = self.clone();
        let run_id_for_task = run_id.clone();
        tokio::spawn(async move {
            scheduler::run(core, run_id_for_task).await;
        });

        Ok(run_id)
    }

    pub fn get_state(&self, run_id: &str) -> Option<RuntimeState> {
        self.state_store.get(run_id)
    }

    pub fn has_dag(&self, run_id: &str) -> bool {
        self.dag_store.contains_key(run_id)
    }

    pub fn get_all_signatures(&self, run_id: &str) -> Option<ThoughtSignatureStore> {
        self.signature_store.get_all(run_id)
    }

    /// A JSON snapshot of the current graph shape for the dashboard and the
    /// graph-view renderer; reflects every delegation applied so far.
    pub fn get_topology_snapshot(&self, run_id: &str) -> Option<serde_json::Value> {
        let dag = self.dag_store.get(run_id)?;
        let nodes = dag.export_nodes();
        let edges = dag.export_edges();

        Some(serde_json::json!({
            "nodes": nodes,
            "edges": edges.into_iter().map(|(from, to)| serde_json::json!({ "from": from, "to": to })).collect::<Vec<_>>(),
        }))
    }

    /// Resumes a run the Circuit Breaker paused: clears the pause reason,
    /// flips status back to Running, and respawns the scheduler loop, which
    /// safely re-derives the next ready agent from current DAG + state.
    pub async fn resume_run(self: &Arc<Self>, run_id: &str) -> Result<(), KernelError> {
        if !self.has_dag(run_id) {
            return Err(KernelError::RunNotFound(run_id.to_string()));
        }

        let is_paused = self
            .state_store
            .get(run_id)
            .map(|s| s.status == RuntimeStatus::AwaitingApproval)
            .unwrap_or(false);

        if !is_paused {
            return Err(KernelError::Validation(format!("run {} is not awaiting approval", run_id)));
        }

        self.state_store.set_pause_reason(run_id, None);
        self.state_store.set_status(run_id, RuntimeStatus::Running);

        if let Some(state) = self.state_store.get(run_id) {
            self.persistence.persist_state(&state).await;
        }

        self.event_bus.publish(RuntimeEvent::new(
            run_id,
            EventType::SystemIntervention,
            None,
            serde_json::json!({ "action": "resume" }),
        ));

        let core = self.clone();
        let run_id_owned = run_id.to_string();
        tokio::spawn(async move {
            scheduler::run(core, run_id_owned).await;
        });

        Ok(())
    }

    /// Rejects a paused run outright: it stays Failed rather than resuming.
    pub async fn reject_run(&self, run_id: &str, reason: &str) -> Result<(), KernelError> {
        if !self.state_store.contains(run_id) {
            return Err(KernelError::RunNotFound(run_id.to_string()));
        }

        self.state_store.set_pause_reason(run_id, Some(reason.to_string()));
        self.state_store.set_status(run_id, RuntimeStatus::Failed);
        self.state_store.set_end_time(run_id, Utc::now().to_rfc3339());

        if let Some(state) = self.state_store.get(run_id) {
            self.persistence.persist_state(&state).await;
        }

        // §6.1: rejection is a terminal transition too; fire the same
        // best-effort adapter cleanup a Completed/Failed run gets.
        if let Err(e) = self.adapter.cleanup(run_id).await {
            tracing::warn!("Adapter cleanup failed for rejected run {}: {}", run_id, e);
        }

        self.event_bus.publish(RuntimeEvent::new(
            run_id,
            EventType::SystemIntervention,
            None,
            serde_json::json!({ "action": "reject", "reason": reason }),
        ));

        Ok(())
    }

    /// Edits the prompt or user directive of the agent that tripped the
    /// Circuit Breaker. Only available while the run is `AwaitingApproval`,
    /// and only on that trip's agent -- every other node either already
    /// dispatched or hasn't been reached yet, and editing either would leave
    /// the manifest inconsistent with what the scheduler already observed.
    /// Always resumes the run on success.
    pub async fn patch_agent_prompt(
        self: &Arc<Self>,
        run_id: &str,
        agent_id: &str,
        prompt: Option<String>,
        user_directive: Option<String>,
    ) -> Result<(), KernelError> {
        let state = self
            .state_store
            .get(run_id)
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?;

        if state.status != RuntimeStatus::AwaitingApproval {
            return Err(KernelError::Validation(format!(
                "run {} is not awaiting approval; agent prompts can only be edited at a pause",
                run_id
            )));
        }

        if !state.failed_agents.iter().any(|a| a == agent_id) {
            return Err(KernelError::Validation(format!(
                "agent '{}' did not cause this run's pause and cannot be edited",
                agent_id
            )));
        }

        {
            let mut workflow = self
                .workflows
                .get_mut(run_id)
                .ok_or_else(|| KernelError::WorkflowNotFound(run_id.to_string()))?;
            let agent = workflow
                .agents
                .iter_mut()
                .find(|a| a.id == agent_id)
                .ok_or_else(|| KernelError::AgentNotFound(agent_id.to_string()))?;

            if let Some(p) = prompt {
                agent.prompt = p;
            }
            if let Some(d) = user_directive {
                agent.user_directive = d;
            }
        }

        self.state_store.clear_failure(run_id, agent_id);

        self.event_bus.publish(RuntimeEvent::new(
            run_id,
            EventType::SystemIntervention,
            Some(agent_id.to_string()),
            serde_json::json!({ "action": "patch_prompt" }),
        ));

        self.resume_run(run_id).await?;

        Ok(())
    }

    pub async fn cleanup_session(&self, run_id: &str) -> Result<(), KernelError> {
        WorkspaceInitializer::cleanup_run(&self.config.storage_root, run_id)
            .await
            .map_err(|e| KernelError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapterClient;
    use crate::models::{AgentNodeConfig, AgentRole};

    fn simple_workflow() -> WorkflowConfig {
        WorkflowConfig {
            id: "wf-1".to_string(),
            name: "trivial".to_string(),
            agents: vec![AgentNodeConfig {
                id: "solo".to_string(),
                role: AgentRole::Worker,
                model: Default::default(),
                tools: vec![],
                prompt: "do the thing".to_string(),
                user_directive: String::new(),
                depends_on: vec![],
                accepts_directive: false,
                allow_delegation: false,
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

    #[tokio::test]
    async fn start_workflow_registers_run_in_every_store() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![]));
        let core = Arc::new(RARORuntime::new(config, adapter));

        let run_id = core.start_workflow(simple_workflow(), "tenant-a".to_string()).await.unwrap();

        assert!(core.has_dag(&run_id));
        assert!(core.get_state(&run_id).is_some());
        assert_eq!(core.get_state(&run_id).unwrap().client_id, "tenant-a");
    }

    #[tokio::test]
    async fn start_workflow_rejects_empty_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![]));
        let core = Arc::new(RARORuntime::new(config, adapter));

        let mut empty_workflow = simple_workflow();
        empty_workflow.agents.clear();

        let result = core.start_workflow(empty_workflow, "public".to_string()).await;
        assert!(matches!(result, Err(KernelError::Validation(_))));
    }

    #[tokio::test]
    async fn resume_rejects_run_not_currently_paused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core.start_workflow(simple_workflow(), "public".to_string()).await.unwrap();

        let result = core.resume_run(&run_id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn patch_agent_prompt_rejects_unknown_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core.start_workflow(simple_workflow(), "public".to_string()).await.unwrap();

        let result = core
            .patch_agent_prompt(&run_id, "ghost", Some("new prompt".to_string()), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn patch_agent_prompt_edits_trip_cause_and_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.storage_root = tmp.path().to_str().unwrap().to_string();

        let adapter = Arc::new(MockAdapterClient::new(vec![]));
        let core = Arc::new(RARORuntime::new(config, adapter));
        let run_id = core.start_workflow(simple_workflow(), "public".to_string()).await.unwrap();

        crate::circuit_breaker::trip(
            &run_id,
            "solo",
            crate::circuit_breaker::TripReason::ProtocolViolation("simulated bad output".to_string()),
            &core.state_store,
            &core.persistence,
            &core.event_bus,
            &core.pattern_registry,
            &core.adapter,
        )
        .await;
        assert!(core.state_store.is_status(&run_id, RuntimeStatus::AwaitingApproval));

        core.patch_agent_prompt(&run_id, "solo", Some("revised prompt".to_string()), None)
            .await
            .unwrap();

        let state = core.get_state(&run_id).unwrap();
        assert!(!state.failed_agents.contains(&"solo".to_string()));
        assert_eq!(state.status, RuntimeStatus::Running);

        let workflow = core.workflows.get(&run_id).unwrap();
        let agent = workflow.agents.iter().find(|a| a.id == "solo").unwrap();
        assert_eq!(agent.prompt, "revised prompt");
    }
}
