// apps/kernel-server/src/persistence.rs
// Purpose: Redis-backed persistence with graceful no-op degradation. §4.3
// Architecture: Infrastructure Layer
// Dependencies: redis, serde_json

use crate::models::{AgentInvocation, InvocationStatus, ModelVariant, RuntimeState, RuntimeStatus};
use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

const ACTIVE_RUNS_KEY: &str = "sys:active_runs";

fn state_key(run_id: &str) -> String {
    format!("run:{}:state", run_id)
}

fn artifact_key(run_id: &str, agent_id: &str) -> String {
    format!("run:{}:agent:{}:output", run_id, agent_id)
}

/// Wraps an optional Redis client. Every operation degrades to a logged
/// no-op when no client is configured, per §4.3 and §7 (persistence
/// failures are logged and swallowed; the run continues in memory).
pub struct PersistenceLayer {
    client: Option<redis::Client>,
    active_run_ttl_secs: i64,
    artifact_ttl_secs: i64,
}

impl PersistenceLayer {
    pub fn new(redis_url: Option<&str>, active_run_ttl_secs: i64, artifact_ttl_secs: i64) -> Self {
        let client = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(c) => {
                tracing::info!("Redis client initialized: {}", url);
                Some(c)
            }
            Err(e) => {
                tracing::warn!("Failed to create Redis client: {}. Persistence disabled.", e);
                None
            }
        });

        if client.is_none() {
            tracing::warn!("Persistence layer running without Redis; state is in-memory only.");
        }

        PersistenceLayer {
            client,
            active_run_ttl_secs,
            artifact_ttl_secs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Serializes state and manages the active-run index: terminal statuses
    /// are removed from the index and given an expiry; non-terminal statuses
    /// are (re-)added with no expiry.
    pub async fn persist_state(&self, state: &RuntimeState) {
        let Some(client) = &self.client else { return };

        let json = match serde_json::to_string(state) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize state for {}: {}", state.run_id, e);
                return;
            }
        };

        let mut con = match client.get_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Redis connection failed during persist: {}", e);
                return;
            }
        };

        let key = state_key(&state.run_id);
        let _: redis::RedisResult<()> = con.set(&key, json).await;

        let is_terminal = matches!(state.status, RuntimeStatus::Completed | RuntimeStatus::Failed);
        if is_terminal {
            let _: redis::RedisResult<()> = con.srem(ACTIVE_RUNS_KEY, &state.run_id).await;
            let _: redis::RedisResult<()> = con.expire(&key, self.active_run_ttl_secs).await;
        } else {
            let _: redis::RedisResult<()> = con.sadd(ACTIVE_RUNS_KEY, &state.run_id).await;
        }
    }

    /// Reads every run in the active-run index and returns its deserialized
    /// state, with any run still marked Running demoted to Failed and a
    /// synthetic restart invocation appended (prefix-consistency, §3).
    pub async fn rehydrate(&self) -> Vec<RuntimeState> {
        let Some(client) = &self.client else { return Vec::new() };

        let mut con = match client.get_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to connect to Redis for rehydration: {}", e);
                return Vec::new();
            }
        };

        let active_ids: Vec<String> = con.smembers(ACTIVE_RUNS_KEY).await.unwrap_or_default();
        tracing::info!("Found {} active runs in persistence layer.", active_ids.len());

        let mut out = Vec::new();
        for run_id in active_ids {
            let key = state_key(&run_id);
            let state_json: Option<String> = con.get(&key).await.unwrap_or(None);

            let Some(json) = state_json else { continue };
            let mut state: RuntimeState = match serde_json::from_str(&json) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to deserialize state for {}: {}", run_id, e);
                    continue;
                }
            };

            tracing::warn!("Rehydrating run: {} (status: {:?})", state.run_id, state.status);

            // §6.6: only a run still marked Running implies the kernel
            // crashed mid-execution. A run paused AwaitingApproval was
            // already suspended -- no invocation was in flight -- so it is
            // left exactly as stored, visible and still pending approval.
            let was_demoted = state.status == RuntimeStatus::Running;
            if was_demoted {
                state.status = RuntimeStatus::Failed;
                state.end_time = Some(Utc::now().to_rfc3339());
                state.invocations.push(AgentInvocation {
                    id: Uuid::new_v4().to_string(),
                    agent_id: "KERNEL".to_string(),
                    model_variant: ModelVariant::Fast,
                    tools_used: vec![],
                    tokens_used: 0,
                    latency_ms: 0,
                    status: InvocationStatus::Failed,
                    timestamp: Utc::now().to_rfc3339(),
                    artifact_id: None,
                    error_message: Some("Kernel restarted unexpectedly. Workflow terminated.".to_string()),
                });

                if let Ok(json) = serde_json::to_string(&state) {
                    let _: redis::RedisResult<()> = con.set(&key, json).await;
                    let _: redis::RedisResult<()> = con.expire(&key, self.active_run_ttl_secs).await;
                }
            }

            // A run demoted to Failed is now terminal and leaves the active
            // index (§4.3's invariant: the index holds only non-terminal
            // runs). A run left AwaitingApproval is still non-terminal and
            // stays, exactly as persist_state would keep it.
            if was_demoted {
                let _: redis::RedisResult<()> = con.srem(ACTIVE_RUNS_KEY, &run_id).await;
            }
            out.push(state);
        }

        out
    }

    /// Stores an agent's artifact output with a short TTL, keyed for
    /// child-to-parent context passing.
    pub async fn store_artifact(&self, run_id: &str, agent_id: &str, output: &serde_json::Value) -> Option<String> {
        let client = self.client.as_ref()?;
        let key = artifact_key(run_id, agent_id);

        let json_str = match serde_json::to_string(output) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to serialize artifact for {}: {}", agent_id, e);
                return None;
            }
        };

        let mut con = match client.get_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to get Redis connection: {}", e);
                return None;
            }
        };

        match con.set_ex::<_, _, ()>(&key, json_str, self.artifact_ttl_secs as u64).await {
            Ok(_) => {
                tracing::debug!("Stored artifact: {}", key);
                Some(key)
            }
            Err(e) => {
                tracing::error!("Failed to write artifact to Redis: {}", e);
                None
            }
        }
    }

    pub async fn fetch_artifact(&self, run_id: &str, agent_id: &str) -> Option<serde_json::Value> {
        let client = self.client.as_ref()?;
        let key = artifact_key(run_id, agent_id);

        let mut con = client.get_async_connection().await.ok()?;
        let data: Option<String> = con.get(&key).await.unwrap_or(None);
        data.and_then(|s| serde_json::from_str(&s).ok())
    }

    pub async fn fetch_artifact_raw(&self, run_id: &str, agent_id: &str) -> Result<String, String> {
        let client = self.client.as_ref().ok_or_else(|| "persistence disabled".to_string())?;
        let key = artifact_key(run_id, agent_id);
        let mut con = client
            .get_async_connection()
            .await
            .map_err(|e| format!("redis connection failed: {}", e))?;
        con.get(&key).await.map_err(|e| format!("artifact not found: {}", e))
    }
}
