//! Network endpoints: per-PID port listings and new-port monitors.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::Json,
};

use super::routes::AppState;
use super::types::{PortMonitorRequest, SuccessResponse};
use crate::network::PortScanner;
use crate::util::core_error;

type ApiError = (StatusCode, String);

pub async fn get_ports(
    State(state): State<Arc<AppState>>,
    AxumPath(pid): AxumPath<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ports = state.scanner.ports_for_pid(pid).await.map_err(core_error)?;
    Ok(Json(serde_json::json!({ "pid": pid, "ports": ports })))
}

pub async fn monitor_ports(
    State(state): State<Arc<AppState>>,
    AxumPath(pid): AxumPath<i32>,
    Json(req): Json<PortMonitorRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if req.callback.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "callback is required".to_string()));
    }

    register_http_callback(&state.scanner, pid, req.callback);
    Ok(Json(SuccessResponse::new("Port monitoring started")))
}

pub async fn stop_monitoring_ports(
    State(state): State<Arc<AppState>>,
    AxumPath(pid): AxumPath<i32>,
) -> Json<SuccessResponse> {
    state.scanner.unregister(pid);
    Json(SuccessResponse::new("Port monitoring stopped"))
}

/// Register a monitor callback that POSTs `{pid, port}` to `url` for every
/// newly opened port. Delivery failures are logged, never fatal.
pub fn register_http_callback(scanner: &Arc<PortScanner>, pid: i32, url: String) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    scanner.register_callback(
        pid,
        Arc::new(move |cb_pid, port| {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let body = serde_json::json!({ "pid": cb_pid, "port": port.local_port });
                match client.post(&url).json(&body).send().await {
                    Ok(_) => tracing::debug!("port callback request sent to {}", url),
                    Err(e) => tracing::debug!("error sending port callback request: {}", e),
                }
            });
        }),
    );
}
