// [[RARO]]/apps/kernel-server/src/main.rs
// Purpose: Entry point. Loads configuration, wires the composition root, and
// serves the API. Invokes state hydration before accepting traffic.
// Architecture: Application Boot
// Dependencies: Axum, Tower, Tokio, clap

use axum::{
    http::Method,
    routing::{delete, get, patch, post},
    Router,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use raro_kernel::adapter::HttpAdapterClient;
use raro_kernel::config::KernelConfig;
use raro_kernel::runtime::RARORuntime;
use raro_kernel::server::handlers;

/// RARO Runtime Kernel server.
#[derive(Parser, Debug)]
#[command(name = "raro-kernel")]
struct Cli {
    /// Path to an optional YAML config file. Missing file falls back to defaults.
    #[arg(long, env = "KERNEL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("raro_kernel=debug".parse().unwrap())
                .add_directive("tower_http=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref())?;

    tracing::info!("Initializing RARO Kernel with config: {:?}", config);

    let adapter = Arc::new(HttpAdapterClient::new(config.agent_base_url()));
    let runtime = Arc::new(RARORuntime::new(config.clone(), adapter));

    // === PERSISTENCE RECOVERY ===
    // Load previous run states from Redis into memory before accepting traffic.
    runtime.rehydrate().await;

    // === LIVE LOG BRIDGE (§6.2) ===
    // Subscribes to the LLM adapter's live-log pub/sub channel for the life
    // of the process and re-emits each message as an IntermediateLog event.
    tokio::spawn(raro_kernel::live_log::run(runtime.clone(), config.live_log_channel.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/runtime/start", post(handlers::start_workflow))
        .route("/runtime/state", get(handlers::get_runtime_state))
        .route("/runtime/signatures", get(handlers::get_signatures))
        .route("/runtime/:run_id/resume", post(handlers::resume_run))
        .route("/runtime/:run_id/approve", post(handlers::approve_run))
        .route("/runtime/:run_id/reject", post(handlers::reject_run))
        .route("/runtime/:run_id/agent/:agent_id", patch(handlers::patch_agent))
        .route("/runtime/:run_id/topology", get(handlers::get_topology))
        .route("/runtime/:run_id/cleanup", delete(handlers::cleanup_run))
        .route("/runtime/:run_id/files/:filename", get(handlers::serve_session_file))
        .route("/runtime/library", get(handlers::list_library_files))
        .route("/runtime/library/upload", post(handlers::upload_library_file))
        .route("/runtime/artifacts", get(handlers::list_all_artifacts))
        .route("/runtime/artifacts/:run_id", get(handlers::get_run_artifacts))
        .route("/runtime/artifacts/:run_id/files/:filename", get(handlers::serve_artifact_file))
        .route(
            "/runtime/artifacts/:run_id/files/:filename/promote",
            post(handlers::promote_artifact_to_library),
        )
        .route("/ws/runtime/:run_id", get(handlers::ws_runtime_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(runtime.clone());

    let addr = runtime.config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("RARO Kernel Server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
