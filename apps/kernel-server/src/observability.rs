// apps/kernel-server/src/observability.rs
// Purpose: In-process metrics derived from live runtime state, exported in
// Prometheus text exposition format. §4.11 (ambient)
// Architecture: Ambient Infrastructure
// Dependencies: models

use crate::models::RuntimeStatus;
use crate::runtime::RARORuntime;
use serde::{Deserialize, Serialize};

/// Snapshot of the counters `render_prometheus` derives from live state.
/// Kept as a plain struct (rather than computed inline) so it's directly
/// testable without standing up an HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub runs_running: usize,
    pub runs_awaiting_approval: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub total_invocations: usize,
    pub failed_invocations: usize,
    pub total_tokens_used: usize,
    pub average_tokens_per_invocation: f64,
}

pub fn snapshot(runtime: &RARORuntime) -> Metrics {
    let states = runtime.state_store.all();
    let mut m = Metrics::default();

    for state in &states {
        match state.status {
            RuntimeStatus::Running => m.runs_running += 1,
            RuntimeStatus::AwaitingApproval => m.runs_awaiting_approval += 1,
            RuntimeStatus::Completed => m.runs_completed += 1,
            RuntimeStatus::Failed => m.runs_failed += 1,
        }

        m.total_tokens_used += state.total_tokens_used;
        for inv in &state.invocations {
            m.total_invocations += 1;
            if inv.status == crate::models::InvocationStatus::Failed {
                m.failed_invocations += 1;
            }
        }
    }

    m.average_tokens_per_invocation = if m.total_invocations > 0 {
        m.total_tokens_used as f64 / m.total_invocations as f64
    } else {
        0.0
    };

    m
}

/// Renders the snapshot as Prometheus text exposition. No external metrics
/// crate is pulled in for this: the format is simple enough to hand-roll and
/// the kernel has no other timeseries needs.
pub fn render_prometheus(runtime: &RARORuntime) -> String {
    let m = snapshot(runtime);

    format!(
        "# HELP raro_runs_running Number of runs currently executing.\n\
         # TYPE raro_runs_running gauge\n\
         raro_runs_running {}\n\
         # HELP raro_runs_awaiting_approval Number of runs paused by the circuit breaker.\n\
         # TYPE raro_runs_awaiting_approval gauge\n\
         raro_runs_awaiting_approval {}\n\
         # HELP raro_runs_completed Total runs that reached Completed.\n\
         # TYPE raro_runs_completed counter\n\
         raro_runs_completed {}\n\
         # HELP raro_runs_failed Total runs that reached Failed.\n\
         # TYPE raro_runs_failed counter\n\
         raro_runs_failed {}\n\
         # HELP raro_invocations_total Total agent invocations recorded across all tracked runs.\n\
         # TYPE raro_invocations_total counter\n\
         raro_invocations_total {}\n\
         # HELP raro_invocations_failed_total Total failed agent invocations.\n\
         # TYPE raro_invocations_failed_total counter\n\
         raro_invocations_failed_total {}\n\
         # HELP raro_tokens_used_total Total tokens consumed across all tracked runs.\n\
         # TYPE raro_tokens_used_total counter\n\
         raro_tokens_used_total {}\n\
         # HELP raro_average_tokens_per_invocation Mean tokens per recorded invocation.\n\
         # TYPE raro_average_tokens_per_invocation gauge\n\
         raro_average_tokens_per_invocation {:.2}\n",
        m.runs_running,
        m.runs_awaiting_approval,
        m.runs_completed,
        m.runs_failed,
        m.total_invocations,
        m.failed_invocations,
        m.total_tokens_used,
        m.average_tokens_per_invocation,
    )
}
