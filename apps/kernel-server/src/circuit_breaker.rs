// apps/kernel-server/src/circuit_breaker.rs
// Purpose: Converges every failure path (pre-flight refusal, adapter error,
// post-flight protocol violation, delegation rejection, pattern trip) onto
// one of two terminal dispositions: pause for human review, or fail the
// run outright. §4.8, §7
// Architecture: Domain Logic
// Dependencies: state_store, persistence, event_bus, registry, adapter, models, events

use crate::adapter::LlmAdapterClient;
use crate::event_bus::EventBus;
use crate::events::{EventType, RuntimeEvent};
use crate::models::{AgentInvocation, InvocationStatus, ModelVariant, RuntimeStatus};
use crate::persistence::PersistenceLayer;
use crate::registry::{PatternAction, PatternRegistry};
use crate::state_store::StateStore;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Consecutive failures the same agent id must rack up within a run before
/// the default `guard_max_failures` pattern (registry.rs) requests approval
/// on a failure that would otherwise terminate the run outright.
const MAX_FAILURES_BEFORE_PATTERN_TRIP: usize = 3;

/// The distinct causes that can trip the breaker. Each carries its own
/// human-readable detail and implies a distinct recovery hint surfaced to
/// whoever resumes or inspects the run.
#[derive(Debug, Clone)]
pub enum TripReason {
    ContextDrought(String),
    ProtocolViolation(String),
    AdapterError(String),
    BudgetExceeded(String),
    DelegationRejected(String),
    PatternTriggered(String),
    /// DAG/manifest integrity broken mid-execution (a cycle surfaced by a
    /// defensive re-sort, or a node the manifest no longer has a config
    /// for). Nothing an operator can edit-and-resume fixes this.
    IntegrityError(String),
}

impl TripReason {
    fn detail(&self) -> &str {
        match self {
            TripReason::ContextDrought(d)
            | TripReason::ProtocolViolation(d)
            | TripReason::AdapterError(d)
            | TripReason::BudgetExceeded(d)
            | TripReason::DelegationRejected(d)
            | TripReason::PatternTriggered(d)
            | TripReason::IntegrityError(d) => d,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TripReason::ContextDrought(_) => "context_drought",
            TripReason::ProtocolViolation(_) => "protocol_violation",
            TripReason::AdapterError(_) => "adapter_error",
            TripReason::BudgetExceeded(_) => "budget_exceeded",
            TripReason::DelegationRejected(_) => "delegation_rejected",
            TripReason::PatternTriggered(_) => "pattern_triggered",
            TripReason::IntegrityError(_) => "integrity_error",
        }
    }

    fn recovery_hint(&self) -> &'static str {
        match self {
            TripReason::ContextDrought(_) => {
                "Inspect upstream agents' outputs; resume after fixing the prompt or providing input files."
            }
            TripReason::ProtocolViolation(_) => {
                "The adapter response did not satisfy the required response contract; inspect the raw output and resume or edit the agent's prompt."
            }
            TripReason::AdapterError(_) => {
                "The LLM adapter call failed in transport; the run has been terminated. Check adapter health and start a new run."
            }
            TripReason::BudgetExceeded(_) => {
                "The workflow's token budget was exhausted; raise the budget or resume to accept partial results."
            }
            TripReason::DelegationRejected(_) => {
                "A delegation proposal violated graph or privilege invariants; the run has been terminated."
            }
            TripReason::PatternTriggered(_) => {
                "A registered safety pattern intercepted this agent's behavior; review the pattern's condition before resuming."
            }
            TripReason::IntegrityError(_) => {
                "The run's graph or manifest is no longer internally consistent; the run has been terminated."
            }
        }
    }

    /// The base disposition a reason implies on its own, before the Pattern
    /// Engine gets a chance to override it (§7): transport failures,
    /// rejected delegations, and integrity breaks terminate the run;
    /// everything else pauses it for human review, since an operator can
    /// plausibly edit a prompt and resume.
    fn base_status(&self) -> RuntimeStatus {
        match self {
            TripReason::AdapterError(_) | TripReason::DelegationRejected(_) | TripReason::IntegrityError(_) => {
                RuntimeStatus::Failed
            }
            TripReason::ContextDrought(_)
            | TripReason::ProtocolViolation(_)
            | TripReason::BudgetExceeded(_)
            | TripReason::PatternTriggered(_) => RuntimeStatus::AwaitingApproval,
        }
    }
}

/// Fails `agent_id` with `reason`, then resolves the run to either `Failed`
/// or `AwaitingApproval` (§7), persists the new state, fires cleanup on the
/// adapter if the run is now terminal, and broadcasts `AgentFailed`.
///
/// This is the single place every failure path converges on (§4.8): the
/// scheduler never sets `AwaitingApproval` or `Failed` directly.
#[allow(clippy::too_many_arguments)]
pub async fn trip(
    run_id: &str,
    agent_id: &str,
    reason: TripReason,
    state_store: &StateStore,
    persistence: &PersistenceLayer,
    event_bus: &EventBus,
    pattern_registry: &PatternRegistry,
    adapter: &Arc<dyn LlmAdapterClient>,
) {
    let pause_message = format!("[{}] {}", reason.label(), reason.detail());

    state_store
        .record_invocation(
            run_id,
            AgentInvocation {
                id: Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                model_variant: ModelVariant::Fast,
                tools_used: vec![],
                tokens_used: 0,
                latency_ms: 0,
                status: InvocationStatus::Failed,
                timestamp: Utc::now().to_rfc3339(),
                artifact_id: None,
                error_message: Some(pause_message.clone()),
            },
        )
        .ok();

    let mut status = reason.base_status();

    // Pattern Engine override (§2, §4.7): once this agent has failed enough
    // times in this run to meet `guard_max_failures`'s threshold, a
    // registered AgentFailed pattern can still request approval even for a
    // failure that would otherwise terminate the run.
    let failure_count = state_store
        .get(run_id)
        .map(|s| {
            s.invocations
                .iter()
                .filter(|i| i.agent_id == agent_id && i.status == InvocationStatus::Failed)
                .count()
        })
        .unwrap_or(0);

    if status == RuntimeStatus::Failed && failure_count >= MAX_FAILURES_BEFORE_PATTERN_TRIP {
        for pattern in pattern_registry.get_patterns_for_trigger("AgentFailed") {
            if pattern.condition == "*" || agent_id.contains(pattern.condition.as_str()) {
                if let PatternAction::RequestApproval { .. } | PatternAction::Interrupt { .. } = &pattern.action {
                    tracing::warn!(
                        "Pattern '{}' intervened on run {} after {} failures of agent '{}': pausing instead of failing",
                        pattern.id,
                        run_id,
                        failure_count,
                        agent_id
                    );
                    status = RuntimeStatus::AwaitingApproval;
                    break;
                }
            }
        }
    }

    state_store.set_status(run_id, status);
    state_store.set_pause_reason(run_id, Some(pause_message.clone()));

    if status == RuntimeStatus::Failed {
        state_store.set_end_time(run_id, Utc::now().to_rfc3339());
    }

    if let Some(state) = state_store.get(run_id) {
        persistence.persist_state(&state).await;
    }

    if status == RuntimeStatus::Failed {
        if let Err(e) = adapter.cleanup(run_id).await {
            tracing::warn!("Adapter cleanup failed for terminated run {}: {}", run_id, e);
        }
    }

    event_bus.publish(RuntimeEvent::new(
        run_id,
        EventType::AgentFailed,
        Some(agent_id.to_string()),
        json!({
            "reason": reason.label(),
            "detail": reason.detail(),
            "recovery_hint": reason.recovery_hint(),
            "run_status": status,
        }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapterClient;
    use crate::models::RuntimeState;

    fn fresh_state(run_id: &str) -> RuntimeState {
        RuntimeState {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            client_id: "public".to_string(),
            status: RuntimeStatus::Running,
            active_agents: vec!["a".to_string()],
            completed_agents: vec![],
            failed_agents: vec![],
            invocations: vec![],
            total_tokens_used: 0,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            pause_reason: None,
        }
    }

    fn harness() -> (StateStore, PersistenceLayer, EventBus, PatternRegistry, Arc<dyn LlmAdapterClient>) {
        (
            StateStore::new(),
            PersistenceLayer::new(None, 86400, 3600),
            EventBus::new(16),
            PatternRegistry::new(),
            Arc::new(MockAdapterClient::new(vec![])),
        )
    }

    #[tokio::test]
    async fn context_drought_pauses_run_and_fails_agent() {
        let (state_store, persistence, event_bus, patterns, adapter) = harness();
        state_store.insert("r1".to_string(), fresh_state("r1"));
        let mut rx = event_bus.subscribe("r1");

        trip(
            "r1",
            "a",
            TripReason::ContextDrought("no parent output".to_string()),
            &state_store,
            &persistence,
            &event_bus,
            &patterns,
            &adapter,
        )
        .await;

        let state = state_store.get("r1").unwrap();
        assert_eq!(state.status, RuntimeStatus::AwaitingApproval);
        assert!(state.failed_agents.contains(&"a".to_string()));
        assert!(!state.active_agents.contains(&"a".to_string()));
        assert!(state.pause_reason.is_some());
        assert!(state.end_time.is_none());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::AgentFailed);
    }

    #[tokio::test]
    async fn adapter_error_fails_the_run_instead_of_pausing() {
        let (state_store, persistence, event_bus, patterns, adapter) = harness();
        state_store.insert("r1".to_string(), fresh_state("r1"));

        trip(
            "r1",
            "a",
            TripReason::AdapterError("connection refused".to_string()),
            &state_store,
            &persistence,
            &event_bus,
            &patterns,
            &adapter,
        )
        .await;

        let state = state_store.get("r1").unwrap();
        assert_eq!(state.status, RuntimeStatus::Failed);
        assert!(state.end_time.is_some());
    }

    #[tokio::test]
    async fn delegation_rejected_fails_the_run_instead_of_pausing() {
        let (state_store, persistence, event_bus, patterns, adapter) = harness();
        state_store.insert("r1".to_string(), fresh_state("r1"));

        trip(
            "r1",
            "a",
            TripReason::DelegationRejected("privilege violation".to_string()),
            &state_store,
            &persistence,
            &event_bus,
            &patterns,
            &adapter,
        )
        .await;

        let state = state_store.get("r1").unwrap();
        assert_eq!(state.status, RuntimeStatus::Failed);
    }

    #[tokio::test]
    async fn repeated_adapter_errors_eventually_pause_instead_of_fail() {
        let (state_store, persistence, event_bus, patterns, adapter) = harness();
        state_store.insert("r1".to_string(), fresh_state("r1"));

        for _ in 0..MAX_FAILURES_BEFORE_PATTERN_TRIP - 1 {
            state_store.mark_active("r1", "a");
            trip(
                "r1",
                "a",
                TripReason::AdapterError("flaky".to_string()),
                &state_store,
                &persistence,
                &event_bus,
                &patterns,
                &adapter,
            )
            .await;
            assert_eq!(state_store.get("r1").unwrap().status, RuntimeStatus::Failed);
            state_store.set_status("r1", RuntimeStatus::Running);
            state_store.clear_failure("r1", "a");
        }

        state_store.mark_active("r1", "a");
        trip(
            "r1",
            "a",
            TripReason::AdapterError("flaky".to_string()),
            &state_store,
            &persistence,
            &event_bus,
            &patterns,
            &adapter,
        )
        .await;

        assert_eq!(state_store.get("r1").unwrap().status, RuntimeStatus::AwaitingApproval);
    }
}
