// apps/kernel-server/src/adapter.rs
// Purpose: Abstracts the transport to the LLM adapter service behind a trait
// so the scheduler can be exercised without a live adapter. §4.7, §6.1
// Architecture: Infrastructure Layer
// Dependencies: reqwest, async-trait

use crate::models::RemoteAgentResponse;
use crate::payload::InvocationPayload;
use async_trait::async_trait;

/// Transport for agent invocations. The HTTP implementation is what ships;
/// the mock exists so scheduler logic can be tested without a running
/// adapter process.
#[async_trait]
pub trait LlmAdapterClient: Send + Sync {
    async fn invoke(&self, payload: &InvocationPayload) -> Result<RemoteAgentResponse, String>;

    /// Fired once a run reaches a terminal status (§6.1) so the adapter can
    /// release per-run sandbox resources. Best-effort: callers log failures
    /// but never fail the run over a cleanup error.
    async fn cleanup(&self, run_id: &str) -> Result<(), String>;
}

pub struct HttpAdapterClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAdapterClient {
    pub fn new(base_url: String) -> Self {
        HttpAdapterClient {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl LlmAdapterClient for HttpAdapterClient {
    async fn invoke(&self, payload: &InvocationPayload) -> Result<RemoteAgentResponse, String> {
        let url = format!("{}/invoke", self.base_url);
        tracing::debug!("Sending invocation request to: {}", url);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("adapter transport error: {}", e))?;

        response
            .json::<RemoteAgentResponse>()
            .await
            .map_err(|e| format!("adapter returned malformed response: {}", e))
    }

    async fn cleanup(&self, run_id: &str) -> Result<(), String> {
        let url = format!("{}/runtime/{}/cleanup", self.base_url, run_id);
        tracing::debug!("Requesting adapter cleanup: {}", url);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| format!("adapter cleanup transport error: {}", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("adapter cleanup returned status {}", response.status()))
        }
    }
}

/// A scripted adapter for tests: responds from a queue of canned responses,
/// one per call, in order. Panics (loudly, in test code only) if called more
/// times than it has responses queued, since an unexpectedly-long scheduler
/// loop usually signals a bug rather than a legitimate extra call.
#[cfg(any(test, feature = "test-support"))]
pub struct MockAdapterClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<RemoteAgentResponse, String>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MockAdapterClient {
    pub fn new(responses: Vec<Result<RemoteAgentResponse, String>>) -> Self {
        MockAdapterClient {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl LlmAdapterClient for MockAdapterClient {
    async fn invoke(&self, _payload: &InvocationPayload) -> Result<RemoteAgentResponse, String> {
        let mut queue = self.responses.lock().unwrap();
        queue
            .pop_front()
            .unwrap_or_else(|| panic!("MockAdapterClient called with no queued response left"))
    }

    async fn cleanup(&self, _run_id: &str) -> Result<(), String> {
        Ok(())
    }
}
