//! HTTP route handlers and server assembly.

use std::sync::Arc;

use axum::{
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::fs::multipart::UploadCoordinator;
use crate::fs::{FileStore, PathResolver};
use crate::network::PortScanner;
use crate::process::ProcessSupervisor;

use super::{filesystem, network, process, ws};

/// Shared application state: the runtime singletons, constructed
/// explicitly and handed to the transport layer.
pub struct AppState {
    pub config: Config,
    pub store: FileStore,
    pub uploads: UploadCoordinator,
    pub supervisor: Arc<ProcessSupervisor>,
    pub scanner: Arc<PortScanner>,
}

impl AppState {
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let resolver = PathResolver::new("/", config.working_dir.clone());
        let uploads = UploadCoordinator::new(config.uploads_dir.clone())?;
        Ok(Self {
            config,
            store: FileStore::new(resolver),
            uploads,
            supervisor: Arc::new(ProcessSupervisor::new()),
            scanner: Arc::new(PortScanner::new()),
        })
    }
}

/// Build the full route surface over the given state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Multipart upload sessions (separate prefix to avoid wildcard
        // conflicts with /filesystem).
        .route("/filesystem-multipart", get(filesystem::list_uploads))
        .route(
            "/filesystem-multipart/initiate/{*path}",
            post(filesystem::initiate_upload),
        )
        .route(
            "/filesystem-multipart/{upload_id}/part",
            put(filesystem::upload_part),
        )
        .route(
            "/filesystem-multipart/{upload_id}/complete",
            post(filesystem::complete_upload),
        )
        .route(
            "/filesystem-multipart/{upload_id}/abort",
            delete(filesystem::abort_upload),
        )
        .route(
            "/filesystem-multipart/{upload_id}/parts",
            get(filesystem::list_parts),
        )
        // Filesystem (tree requests are dispatched on the "tree/" prefix
        // inside the handlers).
        .route("/watch/filesystem/{*path}", get(filesystem::watch_directory))
        .route("/filesystem", get(filesystem::get_root))
        .route(
            "/filesystem/{*path}",
            get(filesystem::get_entry)
                .put(filesystem::create_or_update_entry)
                .delete(filesystem::delete_entry),
        )
        // Processes
        .route(
            "/process",
            get(process::list_processes).post(process::execute_command),
        )
        .route(
            "/process/{identifier}",
            get(process::get_process).delete(process::stop_process),
        )
        .route("/process/{identifier}/kill", delete(process::kill_process))
        .route("/process/{identifier}/logs", get(process::get_process_logs))
        .route(
            "/process/{identifier}/logs/stream",
            get(process::stream_process_logs),
        )
        // Network
        .route("/network/process/{pid}/ports", get(network::get_ports))
        .route(
            "/network/process/{pid}/monitor",
            post(network::monitor_ports).delete(network::stop_monitoring_ports),
        )
        // WebSocket multiplexer
        .route("/ws", get(ws::ws_handler))
        // Health check
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    match state.uploads.rehydrate().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Rehydrated {} multipart upload session(s)", n),
        Err(e) => tracing::warn!("Failed to rehydrate multipart uploads: {}", e),
    }

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Wait for SIGINT/SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
