//! WebSocket operation multiplexer.
//!
//! One connection carries many concurrent logical operations, correlated
//! by client-chosen request id. Inbound frames are `{id, operation, data}`;
//! outbound frames are `{id, success, data?, error?, status?, stream?,
//! done?}`. All socket writes share one lock; long-lived log streams run on
//! their own tasks with per-request cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;

use super::routes::AppState;
use super::types::ProcessRequest;
use crate::error::AgentError;
use crate::fs::multipart::PartSpec;
use crate::process::ProcessStatus;
use crate::util::parse_permissions;

const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Debug, Deserialize)]
pub struct WsRequest {
    #[serde(default)]
    pub id: String,
    pub operation: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct WsResponse {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

fn ok(id: &str, data: Value) -> WsResponse {
    WsResponse {
        id: id.to_string(),
        success: true,
        data: Some(data),
        status: Some(200),
        ..Default::default()
    }
}

fn fail(id: &str, error: impl Into<String>, status: u16) -> WsResponse {
    WsResponse {
        id: id.to_string(),
        success: false,
        error: Some(error.into()),
        status: Some(status),
        ..Default::default()
    }
}

fn fail_core(id: &str, e: AgentError) -> WsResponse {
    fail(id, e.to_string(), e.status_code().as_u16())
}

type Writer = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;
type StreamMap = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

async fn write_json(writer: &Writer, response: &WsResponse) -> Result<(), axum::Error> {
    let text = serde_json::to_string(response).unwrap_or_default();
    writer.lock().await.send(Message::Text(text.into())).await
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("WebSocket connection established");

    let (sender, mut receiver) = socket.split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(sender));
    let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Keepalive: ping at 54 s, drop the connection once 60 s pass without
    // a pong.
    let ping_task = {
        let writer = Arc::clone(&writer);
        let last_pong = Arc::clone(&last_pong);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if last_pong.lock().unwrap().elapsed() > PONG_WAIT {
                    let _ = writer.lock().await.send(Message::Close(None)).await;
                    return;
                }
                if writer
                    .lock()
                    .await
                    .send(Message::Ping(Vec::new().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        })
    };

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Pong(_) => {
                *last_pong.lock().unwrap() = Instant::now();
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };

        let request: WsRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("malformed websocket frame: {}", e);
                continue;
            }
        };

        tracing::debug!(
            "received websocket message: operation={}, id={}",
            request.operation,
            request.id
        );

        match request.operation.as_str() {
            "process:logs:stream:start" => {
                start_log_stream(&state, &writer, &streams, &request).await;
            }
            "process:logs:stream:stop" => {
                if let Some(cancel) = streams.lock().unwrap().remove(&request.id) {
                    let _ = cancel.send(true);
                }
                let response = WsResponse {
                    done: Some(true),
                    ..ok(&request.id, json!({ "message": "Stream stopped" }))
                };
                if write_json(&writer, &response).await.is_err() {
                    break;
                }
            }
            _ => {
                let response = handle_operation(&state, &request).await;
                if write_json(&writer, &response).await.is_err() {
                    break;
                }
            }
        }
    }

    ping_task.abort();
    // Let every streaming task clean up.
    for (_, cancel) in streams.lock().unwrap().drain() {
        let _ = cancel.send(true);
    }
    tracing::info!("WebSocket connection closed");
}

async fn start_log_stream(
    state: &Arc<AppState>,
    writer: &Writer,
    streams: &StreamMap,
    request: &WsRequest,
) {
    let Some(identifier) = data_string(&request.data, "identifier") else {
        let _ = write_json(writer, &fail(&request.id, "identifier is required", 400)).await;
        return;
    };

    let cancel_rx = {
        let mut streams = streams.lock().unwrap();
        if streams.contains_key(&request.id) {
            None
        } else {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            streams.insert(request.id.clone(), cancel_tx);
            Some(cancel_rx)
        }
    };
    let Some(cancel_rx) = cancel_rx else {
        let _ = write_json(
            writer,
            &fail(&request.id, "stream already active for this request ID", 400),
        )
        .await;
        return;
    };

    let initial = WsResponse {
        stream: Some(true),
        ..ok(
            &request.id,
            json!({ "message": "Stream started - logs will be sent as they arrive" }),
        )
    };
    let _ = write_json(writer, &initial).await;

    tokio::spawn(stream_logs(
        Arc::clone(state),
        Arc::clone(writer),
        Arc::clone(streams),
        request.id.clone(),
        identifier,
        cancel_rx,
    ));
}

/// Forward a process's log chunks as `{stream:true, data:{log}}` frames
/// until cancelled, the connection dies, or the process stops running.
async fn stream_logs(
    state: Arc<AppState>,
    writer: Writer,
    streams: StreamMap,
    request_id: String,
    identifier: String,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let (sink_id, mut rx) = match state.supervisor.attach_sink(&identifier) {
        Ok(attached) => attached,
        Err(e) => {
            let response = WsResponse {
                stream: Some(true),
                done: Some(true),
                ..fail(&request_id, format!("failed to stream logs: {}", e), 404)
            };
            let _ = write_json(&writer, &response).await;
            streams.lock().unwrap().remove(&request_id);
            return;
        }
    };

    let mut poll = tokio::time::interval(Duration::from_millis(100));
    poll.tick().await;
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    let response = WsResponse {
                        stream: Some(true),
                        ..ok(&request_id, json!({ "log": String::from_utf8_lossy(&chunk) }))
                    };
                    if write_json(&writer, &response).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = poll.tick() => {
                let running = state
                    .supervisor
                    .get_by_identifier(&identifier)
                    .map(|r| r.status() == ProcessStatus::Running)
                    .unwrap_or(false);
                if !running {
                    break;
                }
            }
        }
    }

    state.supervisor.remove_sink(&identifier, sink_id);
    streams.lock().unwrap().remove(&request_id);

    let done = WsResponse {
        id: request_id,
        success: true,
        stream: Some(true),
        done: Some(true),
        status: Some(200),
        ..Default::default()
    };
    let _ = write_json(&writer, &done).await;
}

fn data_string(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn data_bool(data: &Value, key: &str) -> bool {
    data.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Accept a pid as either a JSON number or a numeric string.
fn data_pid(data: &Value) -> Result<i32, &'static str> {
    match data.get("pid") {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as i32).ok_or("invalid PID"),
        Some(Value::String(s)) => s.parse().map_err(|_| "invalid PID"),
        Some(_) => Err("invalid PID type"),
        None => Err("pid is required"),
    }
}

/// Dispatch a non-streaming operation. Exactly one response per request.
async fn handle_operation(state: &Arc<AppState>, request: &WsRequest) -> WsResponse {
    let id = request.id.as_str();
    let data = &request.data;

    match request.operation.as_str() {
        "filesystem:get" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            match state.store.directory_exists(&path).await {
                Ok(true) => match state.store.list_directory(&path).await {
                    Ok(dir) => ok(id, json!(dir)),
                    Err(e) => fail(id, format!("error listing directory: {}", e), 422),
                },
                Ok(false) => match state.store.file_exists(&path).await {
                    Ok(true) => match state.store.read_file(&path).await {
                        Ok(file) => ok(id, json!(file)),
                        Err(e) => fail(id, format!("error reading file: {}", e), 422),
                    },
                    Ok(false) => fail(id, "file or directory not found", 404),
                    Err(e) => fail_core(id, e),
                },
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:create" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            let is_directory = data_bool(data, "isDirectory");
            let permissions = data_string(data, "permissions").unwrap_or_default();
            let default_mode = if is_directory { 0o755 } else { 0o644 };
            let mode = match parse_permissions(&permissions, default_mode) {
                Ok(mode) => mode,
                Err(e) => return fail_core(id, e),
            };

            if is_directory {
                match state.store.create_directory(&path, mode).await {
                    Ok(()) => ok(
                        id,
                        json!({ "path": path, "message": "Directory created successfully" }),
                    ),
                    Err(e) => fail(id, format!("error creating directory: {}", e), 422),
                }
            } else {
                let content = data_string(data, "content").unwrap_or_default();
                match state.store.write_file(&path, content.as_bytes(), mode).await {
                    Ok(()) => ok(
                        id,
                        json!({ "path": path, "message": "File created/updated successfully" }),
                    ),
                    Err(e) => fail(id, format!("error writing file: {}", e), 422),
                }
            }
        }

        "filesystem:delete" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            let recursive = data_bool(data, "recursive");
            match state.store.directory_exists(&path).await {
                Ok(true) => match state.store.delete_directory(&path, recursive).await {
                    Ok(()) => ok(
                        id,
                        json!({ "path": path, "message": "Directory deleted successfully" }),
                    ),
                    Err(e) => fail(id, format!("error deleting directory: {}", e), 422),
                },
                Ok(false) => match state.store.file_exists(&path).await {
                    Ok(true) => match state.store.delete_file(&path).await {
                        Ok(()) => ok(
                            id,
                            json!({ "path": path, "message": "File deleted successfully" }),
                        ),
                        Err(e) => fail(id, format!("error deleting file: {}", e), 422),
                    },
                    Ok(false) => fail(id, "file or directory not found", 404),
                    Err(e) => fail_core(id, e),
                },
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:tree:get" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            match state.store.directory_exists(&path).await {
                Ok(true) => match state.store.list_directory(&path).await {
                    Ok(dir) => ok(id, json!(dir)),
                    Err(e) => fail(id, format!("error getting file system tree: {}", e), 422),
                },
                Ok(false) => fail(id, "path is not a directory", 400),
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:tree:create" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            let Some(files_value) = data.get("files").filter(|v| v.is_object()) else {
                return fail(id, "files is required", 400);
            };
            let files: HashMap<String, String> = files_value
                .as_object()
                .unwrap()
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();

            match state.store.create_or_update_tree(&path, &files).await {
                Ok(dir) => ok(id, json!(dir)),
                Err(e) => fail(id, format!("error writing file: {}", e), 422),
            }
        }

        "filesystem:tree:delete" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            let recursive = data_bool(data, "recursive");
            match state.store.delete_directory(&path, recursive).await {
                Ok(()) => ok(
                    id,
                    json!({ "path": path, "message": "Directory deleted successfully" }),
                ),
                Err(e) => fail(id, format!("error deleting directory: {}", e), 422),
            }
        }

        "filesystem:multipart:list" => {
            ok(id, json!({ "uploads": state.uploads.list().await }))
        }

        "filesystem:multipart:initiate" => {
            let Some(path) = data_string(data, "path") else {
                return fail(id, "path is required", 400);
            };
            let abs = match state.store.resolve(&path) {
                Ok(abs) => abs,
                Err(e) => return fail_core(id, e),
            };
            let permissions = data_string(data, "permissions").unwrap_or_default();
            let mode = match parse_permissions(&permissions, 0o644) {
                Ok(mode) => mode,
                Err(e) => return fail_core(id, e),
            };
            match state.uploads.initiate(abs.clone(), mode).await {
                Ok(session) => ok(
                    id,
                    json!({ "uploadId": session.upload_id, "path": abs }),
                ),
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:multipart:complete" => {
            let Some(upload_id) = data_string(data, "uploadId") else {
                return fail(id, "uploadId is required", 400);
            };
            let parts: Vec<PartSpec> = match data.get("parts") {
                Some(value) => match serde_json::from_value(value.clone()) {
                    Ok(parts) => parts,
                    Err(e) => return fail(id, format!("invalid parts: {}", e), 400),
                },
                None => return fail(id, "parts is required", 400),
            };
            match state.uploads.complete(&upload_id, parts).await {
                Ok(path) => ok(
                    id,
                    json!({ "path": path, "message": "Multipart upload completed successfully" }),
                ),
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:multipart:abort" => {
            let Some(upload_id) = data_string(data, "uploadId") else {
                return fail(id, "uploadId is required", 400);
            };
            match state.uploads.abort(&upload_id).await {
                Ok(()) => ok(id, json!({ "message": "Multipart upload aborted successfully" })),
                Err(e) => fail_core(id, e),
            }
        }

        "filesystem:multipart:listParts" => {
            let Some(upload_id) = data_string(data, "uploadId") else {
                return fail(id, "uploadId is required", 400);
            };
            match state.uploads.list_parts(&upload_id).await {
                Ok(parts) => ok(id, json!({ "uploadId": upload_id, "parts": parts })),
                Err(e) => fail_core(id, e),
            }
        }

        "process:execute" => {
            let req: ProcessRequest = match serde_json::from_value(data.clone()) {
                Ok(req) => req,
                Err(e) => return fail(id, format!("invalid request: {}", e), 400),
            };
            match super::process::run_execute(state, req).await {
                Ok(response) => ok(id, json!(response)),
                Err(e) => fail_core(id, e),
            }
        }

        "process:list" => {
            let processes: Vec<_> = state
                .supervisor
                .list()
                .iter()
                .map(|r| super::types::ProcessResponse::from_record(r, false))
                .collect();
            ok(id, json!(processes))
        }

        "process:get" => {
            let Some(identifier) = data_string(data, "identifier") else {
                return fail(id, "identifier is required", 400);
            };
            match state.supervisor.get_by_identifier(&identifier) {
                Some(record) => ok(
                    id,
                    json!(super::types::ProcessResponse::from_record(&record, true)),
                ),
                None => fail(id, "process not found", 404),
            }
        }

        "process:logs" => {
            let Some(identifier) = data_string(data, "identifier") else {
                return fail(id, "identifier is required", 400);
            };
            match state.supervisor.output(&identifier) {
                Ok(logs) => ok(id, json!(logs)),
                Err(e) => fail_core(id, e),
            }
        }

        "process:logs:stream" => fail(
            id,
            "use process:logs:stream:start to begin streaming",
            400,
        ),

        "process:stop" => {
            let Some(identifier) = data_string(data, "identifier") else {
                return fail(id, "identifier is required", 400);
            };
            match state.supervisor.stop(&identifier) {
                Ok(()) => ok(id, json!({ "message": "Process stopped successfully" })),
                Err(e) => fail_core(id, e),
            }
        }

        "process:kill" => {
            let Some(identifier) = data_string(data, "identifier") else {
                return fail(id, "identifier is required", 400);
            };
            match state.supervisor.kill(&identifier) {
                Ok(()) => ok(id, json!({ "message": "Process killed successfully" })),
                Err(e) => fail_core(id, e),
            }
        }

        "network:ports:get" => {
            let pid = match data_pid(data) {
                Ok(pid) => pid,
                Err(e) => return fail(id, e, 400),
            };
            match state.scanner.ports_for_pid(pid).await {
                Ok(ports) => ok(id, json!({ "pid": pid, "ports": ports })),
                Err(e) => fail(id, e.to_string(), 422),
            }
        }

        "network:ports:monitor" => {
            let pid = match data_pid(data) {
                Ok(pid) => pid,
                Err(e) => return fail(id, e, 400),
            };
            let Some(callback) = data_string(data, "callback") else {
                return fail(id, "callback is required", 400);
            };
            super::network::register_http_callback(&state.scanner, pid, callback);
            ok(id, json!({ "message": "Port monitoring started" }))
        }

        "network:ports:stopMonitor" => {
            let pid = match data_pid(data) {
                Ok(pid) => pid,
                Err(e) => return fail(id, e, 400),
            };
            state.scanner.unregister(pid);
            ok(id, json!({ "message": "Port monitoring stopped" }))
        }

        other => fail(id, format!("Unknown operation: {}", other), 400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_serialization_omits_absent_fields() {
        let response = ok("req-1", json!({ "message": "hi" }));
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("\"id\":\"req-1\""));
        assert!(text.contains("\"success\":true"));
        assert!(!text.contains("stream"));
        assert!(!text.contains("done"));
        assert!(!text.contains("error"));
    }

    #[test]
    fn request_parsing_defaults_missing_data() {
        let request: WsRequest =
            serde_json::from_str(r#"{"id":"1","operation":"process:list"}"#).unwrap();
        assert_eq!(request.operation, "process:list");
        assert!(request.data.is_null());
    }

    #[test]
    fn data_pid_accepts_number_and_string() {
        assert_eq!(data_pid(&json!({ "pid": 42 })).unwrap(), 42);
        assert_eq!(data_pid(&json!({ "pid": "42" })).unwrap(), 42);
        assert!(data_pid(&json!({ "pid": true })).is_err());
        assert!(data_pid(&json!({})).is_err());
    }
}
