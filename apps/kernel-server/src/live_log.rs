// apps/kernel-server/src/live_log.rs
// Purpose: Bridges the LLM adapter's live-log pub/sub channel onto the
// kernel's own event bus as `IntermediateLog` events. §6.2
// Architecture: Infrastructure Layer
// Dependencies: redis (aio pub/sub), futures, runtime

use crate::events::{EventType, RuntimeEvent};
use crate::runtime::RARORuntime;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Subscribes to `channel` on the configured Redis instance and re-emits
/// every message as an `IntermediateLog` event on the run it names, for the
/// lifetime of the process. A missing `redis_url` disables the bridge
/// entirely, with a warning, matching the rest of the persistence layer's
/// no-Redis degradation (§4.3). A connection that drops is retried with a
/// short backoff rather than ending the task.
pub async fn run(core: Arc<RARORuntime>, channel: String) {
    let Some(redis_url) = core.config.redis_url.clone() else {
        tracing::warn!("No redis_url configured; live-log bridge (§6.2) is disabled");
        return;
    };

    loop {
        match subscribe_once(&core, &redis_url, &channel).await {
            Ok(()) => tracing::warn!("Live-log subscription on '{}' ended; reconnecting", channel),
            Err(e) => tracing::error!("Live-log bridge error on '{}': {}", channel, e),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn subscribe_once(core: &Arc<RARORuntime>, redis_url: &str, channel: &str) -> Result<(), String> {
    let client = redis::Client::open(redis_url).map_err(|e| e.to_string())?;
    let con = client.get_async_connection().await.map_err(|e| e.to_string())?;
    let mut pubsub = con.into_pubsub();
    pubsub.subscribe(channel).await.map_err(|e| e.to_string())?;

    tracing::info!("Live-log bridge subscribed to '{}'", channel);
    let mut stream = pubsub.on_message();

    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Live-log message with non-string payload: {}", e);
                continue;
            }
        };

        let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) else {
            tracing::warn!("Live-log message was not valid JSON: {}", payload);
            continue;
        };

        let Some(run_id) = value.get("run_id").and_then(|v| v.as_str()) else {
            tracing::warn!("Live-log message missing run_id: {}", payload);
            continue;
        };

        let agent_id = value.get("agent_id").and_then(|v| v.as_str()).map(str::to_string);

        core.event_bus
            .publish(RuntimeEvent::new(run_id, EventType::IntermediateLog, agent_id, value.clone()));
    }

    Ok(())
}
