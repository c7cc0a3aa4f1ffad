//! Process endpoints: execution, inspection, logs and live log streaming.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};

use super::routes::AppState;
use super::types::{ProcessRequest, ProcessResponse, SuccessResponse};
use crate::process::service::{self, ExecuteRequest};
use crate::process::{ProcessStatus, ProcessSupervisor};
use crate::util::{core_error, internal_error};

type ApiError = (StatusCode, String);

pub async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessResponse>> {
    let processes: Vec<ProcessResponse> = state
        .supervisor
        .list()
        .iter()
        .map(|r| ProcessResponse::from_record(r, false))
        .collect();
    Json(processes)
}

pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    run_execute(&state, req).await.map(Json).map_err(core_error)
}

/// Shared by the REST handler and the WebSocket dispatcher.
pub(crate) async fn run_execute(
    state: &AppState,
    req: ProcessRequest,
) -> crate::error::Result<ProcessResponse> {
    let working_dir: Option<PathBuf> = match &req.working_dir {
        Some(dir) if !dir.is_empty() => Some(state.store.resolve(dir)?),
        _ => None,
    };

    let include_logs = req.wait_for_completion;
    let record = service::execute(
        &state.supervisor,
        &state.scanner,
        ExecuteRequest {
            command: req.command,
            working_dir,
            name: req.name,
            env: req.env.unwrap_or_default(),
            wait_for_completion: req.wait_for_completion,
            timeout: req.timeout,
            wait_for_ports: req.wait_for_ports.unwrap_or_default(),
            restart_on_failure: req.restart_on_failure,
            max_restarts: req.max_restarts,
        },
    )
    .await?;

    Ok(ProcessResponse::from_record(&record, include_logs))
}

pub async fn get_process(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let record = state
        .supervisor
        .get_by_identifier(&identifier)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "process not found".to_string()))?;
    Ok(Json(ProcessResponse::from_record(&record, true)))
}

pub async fn get_process_logs(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Result<Response, ApiError> {
    let logs = state.supervisor.output(&identifier).map_err(core_error)?;
    Ok(Json(logs).into_response())
}

/// Detaches the log sink when the response stream is dropped, whether the
/// client disconnected or the process ended.
struct SinkGuard {
    supervisor: Arc<ProcessSupervisor>,
    identifier: String,
    sink_id: u64,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.supervisor.remove_sink(&self.identifier, self.sink_id);
    }
}

/// Plain-text chunked stream: the full history first, then every chunk as
/// it arrives, each prefixed `stdout:`/`stderr:`. Ends when the process is
/// no longer running.
pub async fn stream_process_logs(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Result<Response, ApiError> {
    let (sink_id, mut rx) = state
        .supervisor
        .attach_sink(&identifier)
        .map_err(core_error)?;

    let guard = SinkGuard {
        supervisor: Arc::clone(&state.supervisor),
        identifier: identifier.clone(),
        sink_id,
    };

    let stream = async_stream::stream! {
        let guard = guard;
        let mut poll = tokio::time::interval(Duration::from_millis(200));
        poll.tick().await; // immediate first tick
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => yield Ok::<_, std::convert::Infallible>(Bytes::from(chunk)),
                    None => break,
                },
                _ = poll.tick() => {
                    let running = guard
                        .supervisor
                        .get_by_identifier(&guard.identifier)
                        .map(|r| r.status() == ProcessStatus::Running)
                        .unwrap_or(false);
                    if !running {
                        break;
                    }
                }
            }
        }
        // Drain whatever arrived before the process settled.
        while let Ok(chunk) = rx.try_recv() {
            yield Ok(Bytes::from(chunk));
        }
    };

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "text/plain; charset=utf-8".parse().map_err(internal_error)?,
    );
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().map_err(internal_error)?);
    headers.insert("X-Accel-Buffering", "no".parse().map_err(internal_error)?);
    Ok(response)
}

pub async fn stop_process(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.supervisor.stop(&identifier).map_err(core_error)?;
    Ok(Json(SuccessResponse::new("Process stopped successfully")))
}

pub async fn kill_process(
    State(state): State<Arc<AppState>>,
    AxumPath(identifier): AxumPath<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.supervisor.kill(&identifier).map_err(core_error)?;
    Ok(Json(SuccessResponse::new("Process killed successfully")))
}
