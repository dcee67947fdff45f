// apps/kernel-server/src/models.rs
// Purpose: Core data models shared across the kernel.
// Architecture: Shared Data Layer
// Dependencies: Serde

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// {fast, reasoning, thinking} or an opaque passthrough string (§3). Wire
/// representation is always a bare string, so this carries a hand-written
/// `Serialize`/`Deserialize` pair rather than deriving: the derive macros
/// have no attribute that serializes a unit-variant set and a newtype
/// fallback variant as the same flat string representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    Fast,
    Reasoning,
    Thinking,
    Custom(String),
}

impl Default for ModelVariant {
    fn default() -> Self {
        ModelVariant::Fast
    }
}

impl ModelVariant {
    /// The wire string sent to the LLM adapter (§6.1).
    pub fn as_wire_str(&self) -> &str {
        match self {
            ModelVariant::Fast => "fast",
            ModelVariant::Reasoning => "reasoning",
            ModelVariant::Thinking => "thinking",
            ModelVariant::Custom(s) => s.as_str(),
        }
    }

    fn from_wire_str(s: &str) -> Self {
        match s {
            "fast" => ModelVariant::Fast,
            "reasoning" => ModelVariant::Reasoning,
            "thinking" => ModelVariant::Thinking,
            other => ModelVariant::Custom(other.to_string()),
        }
    }
}

impl Serialize for ModelVariant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

struct ModelVariantVisitor;

impl<'de> Visitor<'de> for ModelVariantVisitor {
    type Value = ModelVariant;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a model variant string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(ModelVariant::from_wire_str(v))
    }
}

impl<'de> Deserialize<'de> for ModelVariant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ModelVariantVisitor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Worker,
    Observer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    Local,
    Global,
    Off,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Configuration for a single agent node. Used in both static workflow
/// definitions and dynamic delegation proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNodeConfig {
    pub id: String,
    pub role: AgentRole,
    #[serde(default)]
    pub model: ModelVariant,
    #[serde(default)]
    pub tools: Vec<String>,
    pub prompt: String,
    #[serde(default)]
    pub user_directive: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub accepts_directive: bool,
    #[serde(default)]
    pub allow_delegation: bool,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default)]
    pub position: Option<Position>,

    // Opaque to the kernel; forwarded as-is for the architect/console to use.
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub agents: Vec<AgentNodeConfig>,
    #[serde(default)]
    pub max_token_budget: usize,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub attached_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStrategy {
    /// New nodes splice in between the parent and its current children.
    Child,
    /// New nodes attach as additional children of the parent; the parent's
    /// existing children are left exactly as they were.
    Append,
    /// New nodes run alongside the parent's existing children without
    /// blocking them.
    Sibling,
    /// The parent's pending plan is replaced by `new_nodes`; already-wired
    /// downstream dependents stay attached to the parent.
    Replace,
}

fn default_strategy() -> DelegationStrategy {
    DelegationStrategy::Child
}

/// A request from an active agent to mutate the graph it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub reason: String,
    pub new_nodes: Vec<AgentNodeConfig>,
    #[serde(default = "default_strategy")]
    pub strategy: DelegationStrategy,
}

/// The standardized response contract from the LLM adapter (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAgentResponse {
    pub agent_id: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: usize,
    #[serde(default)]
    pub input_tokens: usize,
    #[serde(default)]
    pub output_tokens: usize,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub cached_content_id: Option<String>,
    #[serde(default)]
    pub thought_signature: Option<String>,
    #[serde(default)]
    pub executed_tools: Vec<String>,
    #[serde(default)]
    pub delegation: Option<DelegationRequest>,
}

// === RUNTIME STATE ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: String,
    pub agent_id: String,
    pub model_variant: ModelVariant,
    pub tools_used: Vec<String>,
    pub tokens_used: usize,
    pub latency_ms: u64,
    pub status: InvocationStatus,
    pub timestamp: String,
    pub artifact_id: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub run_id: String,
    pub workflow_id: String,
    pub client_id: String,
    pub status: RuntimeStatus,
    pub active_agents: Vec<String>,
    pub completed_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub invocations: Vec<AgentInvocation>,
    pub total_tokens_used: usize,
    pub start_time: String,
    pub end_time: Option<String>,
    /// Set by the Circuit Breaker when status becomes AwaitingApproval; cleared on resume.
    #[serde(default)]
    pub pause_reason: Option<String>,
}

impl RuntimeState {
    /// Invariant check used by tests and defensively by the scheduler:
    /// active/completed/failed are pairwise disjoint.
    pub fn memberships_disjoint(&self) -> bool {
        let sets: [&Vec<String>; 3] = [&self.active_agents, &self.completed_agents, &self.failed_agents];
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                if sets[i].iter().any(|a| sets[j].contains(a)) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThoughtSignatureStore {
    pub signatures: HashMap<String, String>,
}
