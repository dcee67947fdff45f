// apps/kernel-server/src/events.rs
// Purpose: Structured runtime events broadcast to WS subscribers and the Pattern Engine.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    /// A new agent node has been added to the DAG (static or dynamic).
    NodeCreated,
    /// An agent started execution.
    AgentStarted,
    /// An agent completed successfully.
    AgentCompleted,
    /// An agent failed, was paused by the Circuit Breaker, or had its
    /// delegation silently discarded.
    AgentFailed,
    /// An agent invoked a tool (bridged from live logs or adapter response).
    ToolCall,
    /// A human/system intervention: pause, resume, reject, pattern trip.
    SystemIntervention,
    /// Real-time intermediate log bridged from the LLM adapter's pub/sub bus.
    IntermediateLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub agent_id: Option<String>,
    pub timestamp: String,
    pub payload: Value,
}

impl RuntimeEvent {
    pub fn new(run_id: &str, event_type: EventType, agent_id: Option<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            event_type,
            agent_id,
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }
}
