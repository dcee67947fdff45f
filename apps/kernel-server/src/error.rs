// apps/kernel-server/src/error.rs
// Purpose: Crate-wide error taxonomy and its HTTP mapping.
// Architecture: Shared Data Layer
// Dependencies: thiserror, axum

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced synchronously to an HTTP caller, or used internally to
/// fail a run. Protocol violations, semantic nulls, and context drought are
/// deliberately NOT representable here — those pause a run via the Circuit
/// Breaker rather than erroring (see §7).
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("dag topology error: {0}")]
    Topology(String),

    #[error("dependency not found: {0}")]
    DependencyMissing(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("delegation conflict: {0}")]
    Delegation(String),

    #[error("invalid client session id")]
    InvalidClientId,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct KernelErrorBody {
    error: String,
    message: String,
}

impl KernelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            KernelError::Validation(_) => StatusCode::BAD_REQUEST,
            KernelError::Topology(_) => StatusCode::BAD_REQUEST,
            KernelError::DependencyMissing(_) => StatusCode::BAD_REQUEST,
            KernelError::RunNotFound(_) => StatusCode::NOT_FOUND,
            KernelError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            KernelError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            KernelError::Transport(_) => StatusCode::BAD_GATEWAY,
            KernelError::Delegation(_) => StatusCode::CONFLICT,
            KernelError::InvalidClientId => StatusCode::BAD_REQUEST,
            KernelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Validation(_) => "validation_error",
            KernelError::Topology(_) => "topology_error",
            KernelError::DependencyMissing(_) => "dependency_missing",
            KernelError::RunNotFound(_) => "run_not_found",
            KernelError::AgentNotFound(_) => "agent_not_found",
            KernelError::WorkflowNotFound(_) => "workflow_not_found",
            KernelError::Transport(_) => "transport_error",
            KernelError::Delegation(_) => "delegation_conflict",
            KernelError::InvalidClientId => "invalid_client_id",
            KernelError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for KernelError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = KernelErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        tracing::error!(kind = self.kind(), "{}", self);
        (status, Json(body)).into_response()
    }
}

impl From<crate::dag::DAGError> for KernelError {
    fn from(e: crate::dag::DAGError) -> Self {
        use crate::dag::DAGError::*;
        match e {
            CycleDetected => KernelError::Topology(e.to_string()),
            InvalidNode(_) => KernelError::DependencyMissing(e.to_string()),
            DependencyNotFound(_) => KernelError::DependencyMissing(e.to_string()),
            EdgeNotFound(_, _) => KernelError::Topology(e.to_string()),
        }
    }
}
