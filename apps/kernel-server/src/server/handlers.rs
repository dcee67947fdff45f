// apps/kernel-server/src/server/handlers.rs
// Purpose: HTTP/WS API surface over RARORuntime. §4.12, §6.5
// Architecture: API Layer
// Dependencies: Axum, runtime, fs_manager, security

use axum::{
    body::Body,
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::events::EventType;
use crate::fs_manager::{ArtifactMetadata, WorkspaceInitializer};
use crate::models::{RuntimeState, WorkflowConfig};
use crate::runtime::RARORuntime;
use crate::security::ClientSession;

#[derive(serde::Deserialize)]
pub struct RunQuery {
    run_id: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct PatchAgentRequest {
    pub prompt: Option<String>,
    pub user_directive: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct RejectRequest {
    #[serde(default = "default_reject_reason")]
    pub reason: String,
}

fn default_reject_reason() -> String {
    "rejected by operator".to_string()
}

#[derive(serde::Serialize)]
pub struct HealthResponse {
    status: String,
    message: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "RARO Kernel Server is running".to_string(),
    })
}

/// GET /metrics -- Prometheus-style text exposition of the few counters the
/// kernel tracks in-process. See observability.rs for the metric catalog.
pub async fn metrics(State(runtime): State<Arc<RARORuntime>>) -> String {
    crate::observability::render_prometheus(&runtime)
}

// === WORKFLOW LIFECYCLE ===

pub async fn start_workflow(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
    Json(config): Json<WorkflowConfig>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    runtime
        .start_workflow(config, client_id)
        .await
        .map(|run_id| Json(json!({ "success": true, "run_id": run_id })))
        .map_err(|e| {
            tracing::error!("Failed to start workflow: {}", e);
            e.status_code()
        })
}

pub async fn resume_run(State(runtime): State<Arc<RARORuntime>>, Path(run_id): Path<String>) -> impl IntoResponse {
    match runtime.resume_run(&run_id).await {
        Ok(()) => StatusCode::OK,
        Err(e) => e.status_code(),
    }
}

/// POST /runtime/:run_id/approve -- the approval-gate counterpart to
/// `resume`: the operator signs off on the paused run as-is, with no prompt
/// edit, and the scheduler re-enters exactly as `resume` would. Kept as a
/// distinct route per spec.md §4.12's approve/reject pairing even though it
/// shares `resume_run`'s implementation.
pub async fn approve_run(State(runtime): State<Arc<RARORuntime>>, Path(run_id): Path<String>) -> impl IntoResponse {
    match runtime.resume_run(&run_id).await {
        Ok(()) => StatusCode::OK,
        Err(e) => e.status_code(),
    }
}

pub async fn reject_run(
    State(runtime): State<Arc<RARORuntime>>,
    Path(run_id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> impl IntoResponse {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_else(default_reject_reason);
    match runtime.reject_run(&run_id, &reason).await {
        Ok(()) => StatusCode::OK,
        Err(e) => e.status_code(),
    }
}

/// PATCH /runtime/:run_id/agent/:agent_id -- edit a pending agent's prompt
/// or user directive before it dispatches, optionally resuming a paused run.
pub async fn patch_agent(
    State(runtime): State<Arc<RARORuntime>>,
    Path((run_id, agent_id)): Path<(String, String)>,
    Json(body): Json<PatchAgentRequest>,
) -> impl IntoResponse {
    match runtime
        .patch_agent_prompt(&run_id, &agent_id, body.prompt, body.user_directive)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(e) => e.status_code(),
    }
}

pub async fn get_runtime_state(
    State(runtime): State<Arc<RARORuntime>>,
    Query(query): Query<RunQuery>,
) -> Result<Json<RuntimeState>, StatusCode> {
    let run_id = query.run_id.ok_or(StatusCode::BAD_REQUEST)?;
    runtime.get_state(&run_id).ok_or(StatusCode::NOT_FOUND).map(Json)
}

pub async fn get_signatures(
    State(runtime): State<Arc<RARORuntime>>,
    Query(query): Query<RunQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run_id = query.run_id.ok_or(StatusCode::BAD_REQUEST)?;
    let signatures = runtime.get_all_signatures(&run_id).ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(json!({
        "run_id": run_id,
        "signatures": signatures.signatures
    })))
}

pub async fn get_topology(
    State(runtime): State<Arc<RARORuntime>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    runtime.get_topology_snapshot(&run_id).ok_or(StatusCode::NOT_FOUND).map(Json)
}

pub async fn cleanup_run(
    State(runtime): State<Arc<RARORuntime>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match runtime.cleanup_session(&run_id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => e.status_code(),
    }
}

// === SESSION FILE SERVING ===

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".png") {
        "image/png"
    } else if filename.ends_with(".jpg") || filename.ends_with(".jpeg") {
        "image/jpeg"
    } else if filename.ends_with(".csv") {
        "text/csv"
    } else if filename.ends_with(".json") {
        "application/json"
    } else if filename.ends_with(".md") {
        "text/markdown"
    } else if filename.ends_with(".txt") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

async fn stream_file(path: &std::path::Path, cache_control: &'static str) -> Result<impl IntoResponse, StatusCode> {
    if !path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }

    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let content_type = content_type_for(filename);

    let file = tokio::fs::File::open(path).await.map_err(|e| {
        tracing::error!("Failed to open file {:?}: {}", path, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let headers = [("Content-Type", content_type), ("Cache-Control", cache_control)];

    Ok((headers, body))
}

/// GET /runtime/:run_id/files/:filename
pub async fn serve_session_file(
    State(runtime): State<Arc<RARORuntime>>,
    Path((run_id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    if filename.contains("..") || filename.starts_with('/') {
        return Err(StatusCode::FORBIDDEN);
    }

    let path = std::path::Path::new(&runtime.config.storage_root)
        .join("sessions")
        .join(&run_id)
        .join("output")
        .join(&filename);

    stream_file(&path, "public, max-age=3600").await
}

// === LIBRARY ===

/// GET /runtime/library
pub async fn list_library_files(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let files = WorkspaceInitializer::list_library_files(&runtime.config.storage_root, &client_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to list library for {}: {}", client_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({ "files": files })))
}

/// POST /runtime/library/upload
pub async fn upload_library_file(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, StatusCode> {
    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.file_name().unwrap_or("unknown_file").to_string();
        let data = field.bytes().await.map_err(|e| {
            tracing::error!("Failed to read upload bytes: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        WorkspaceInitializer::save_to_library(&runtime.config.storage_root, &client_id, &name, &data)
            .await
            .map_err(|e| {
                tracing::error!("Failed to write {} to library: {}", name, e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
    }

    Ok(Json(json!({ "success": true, "message": "Upload complete" })))
}

// === ARTIFACTS ===

/// GET /runtime/artifacts
pub async fn list_all_artifacts(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let runs = WorkspaceInitializer::list_artifact_runs(&runtime.config.storage_root, &client_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to list artifact runs for {}: {}", client_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let mut artifacts = Vec::new();
    for run_id in runs {
        if let Ok(metadata) = WorkspaceInitializer::get_artifact_metadata(&runtime.config.storage_root, &client_id, &run_id).await {
            artifacts.push(json!({ "run_id": run_id, "metadata": metadata }));
        }
    }

    Ok(Json(json!({ "artifacts": artifacts })))
}

/// GET /runtime/artifacts/:run_id
pub async fn get_run_artifacts(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
    Path(run_id): Path<String>,
) -> Result<Json<ArtifactMetadata>, StatusCode> {
    WorkspaceInitializer::get_artifact_metadata(&runtime.config.storage_root, &client_id, &run_id)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!("Artifact metadata not found for run {}: {}", run_id, e);
            StatusCode::NOT_FOUND
        })
}

/// GET /runtime/artifacts/:run_id/files/:filename
pub async fn serve_artifact_file(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
    Path((run_id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    if filename.contains("..") || filename.starts_with('/') {
        tracing::warn!("Blocked suspicious artifact filename: {}", filename);
        return Err(StatusCode::FORBIDDEN);
    }

    let path = std::path::Path::new(&runtime.config.storage_root)
        .join("artifacts")
        .join(&client_id)
        .join(&run_id)
        .join(&filename);

    stream_file(&path, "public, max-age=86400").await
}

/// POST /runtime/artifacts/:run_id/files/:filename/promote
pub async fn promote_artifact_to_library(
    State(runtime): State<Arc<RARORuntime>>,
    ClientSession(client_id): ClientSession,
    Path((run_id, filename)): Path<(String, String)>,
) -> impl IntoResponse {
    if filename.contains("..") || filename.starts_with('/') {
        return StatusCode::FORBIDDEN;
    }

    let src = std::path::Path::new(&runtime.config.storage_root)
        .join("artifacts")
        .join(&client_id)
        .join(&run_id)
        .join(&filename);

    if !src.exists() {
        return StatusCode::NOT_FOUND;
    }

    let dst_dir = std::path::Path::new(&runtime.config.storage_root).join("library").join(&client_id);
    if let Err(e) = tokio::fs::create_dir_all(&dst_dir).await {
        tracing::error!("Failed to create library dir for {}: {}", client_id, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    if let Err(e) = tokio::fs::copy(&src, dst_dir.join(&filename)).await {
        tracing::error!("Failed to promote artifact {} to library: {}", filename, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    if let Err(e) = WorkspaceInitializer::mark_promoted_to_library(&runtime.config.storage_root, &client_id, &run_id, &filename).await {
        tracing::warn!("Promoted {} but failed to update sidecar: {}", filename, e);
    }

    tracing::info!("Promoted artifact {} from run {} to library for {}", filename, run_id, client_id);
    StatusCode::CREATED
}

// === LIVE STREAM ===

pub async fn ws_runtime_stream(
    State(runtime): State<Arc<RARORuntime>>,
    Path(run_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_runtime_stream(socket, runtime, run_id))
}

async fn handle_runtime_stream(socket: WebSocket, runtime: Arc<RARORuntime>, run_id: String) {
    let (mut sender, mut receiver) = socket.split();

    if runtime.get_state(&run_id).is_none() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if runtime.get_state(&run_id).is_none() {
        let _ = sender.send(Message::Text(json!({"error": "Run not found"}).to_string())).await;
        return;
    }

    if let Some(state) = runtime.get_state(&run_id) {
        let _ = sender
            .send(Message::Text(
                json!({
                    "type": "state_update",
                    "state": state,
                    "timestamp": chrono::Utc::now().to_rfc3339()
                })
                .to_string(),
            ))
            .await;
    }

    let mut interval = tokio::time::interval(Duration::from_millis(runtime.config.ws_snapshot_interval_ms));
    let mut bus_rx = runtime.event_bus.subscribe(&run_id);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                if msg.is_none() {
                    tracing::info!("Client disconnected from runtime stream: {}", run_id);
                    break;
                }
            }

            _ = interval.tick() => {
                let Some(state) = runtime.get_state(&run_id) else {
                    break;
                };

                let topology = runtime.get_topology_snapshot(&run_id);
                let update = json!({
                    "type": "state_update",
                    "state": &state,
                    "signatures": runtime.get_all_signatures(&run_id).map(|s| s.signatures),
                    "topology": topology,
                    "timestamp": chrono::Utc::now().to_rfc3339()
                });

                if sender.send(Message::Text(update.to_string())).await.is_err() {
                    tracing::info!("Failed to send state update, client disconnected");
                    break;
                }

                if state.status == crate::models::RuntimeStatus::Completed || state.status == crate::models::RuntimeStatus::Failed {
                    tracing::info!("Run {} reached terminal state: {:?}. Closing stream.", run_id, state.status);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let _ = sender.close().await;
                    break;
                }
            }

            Ok(event) = bus_rx.recv() => {
                if event.run_id != run_id {
                    continue;
                }

                let should_forward = matches!(
                    event.event_type,
                    EventType::IntermediateLog
                        | EventType::SystemIntervention
                        | EventType::AgentStarted
                        | EventType::AgentCompleted
                        | EventType::AgentFailed
                        | EventType::NodeCreated
                );

                if !should_forward {
                    continue;
                }

                let event_type_name = match event.event_type {
                    EventType::IntermediateLog => "log_event",
                    EventType::SystemIntervention => "intervention_event",
                    EventType::AgentStarted => "agent_started",
                    EventType::AgentCompleted => "agent_completed",
                    EventType::AgentFailed => "agent_failed",
                    EventType::NodeCreated => "node_created",
                    EventType::ToolCall => "tool_call",
                };

                let ws_msg = json!({
                    "type": event_type_name,
                    "agent_id": event.agent_id,
                    "payload": event.payload,
                    "timestamp": event.timestamp
                });

                if sender.send(Message::Text(ws_msg.to_string())).await.is_err() {
                    tracing::info!("Failed to send event, client disconnected");
                    break;
                }
            }
        }
    }

    runtime.event_bus.retire(&run_id);
}
