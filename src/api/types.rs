//! API request and response types shared by the REST and WebSocket
//! transports.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::{ProcessRecord, ProcessStatus};

/// Generic success envelope.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SuccessResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

/// Request body for creating or updating a file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub permissions: String,
}

/// Request body for executing a command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub command: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub wait_for_ports: Option<Vec<u16>>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub max_restarts: u32,
}

/// Process state as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub pid: String,
    pub name: String,
    pub command: String,
    pub status: ProcessStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub exit_code: i32,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    pub restart_count: u32,
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl ProcessResponse {
    pub fn from_record(record: &ProcessRecord, include_logs: bool) -> Self {
        let snap = record.snapshot();
        Self {
            pid: record.pid.clone(),
            name: record.name.clone(),
            command: record.command.clone(),
            status: snap.status,
            started_at: http_date(snap.started_at),
            completed_at: snap.completed_at.map(http_date),
            exit_code: snap.exit_code,
            working_dir: record
                .working_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            logs: include_logs.then(|| record.logs().logs),
            restart_on_failure: record.restart_on_failure,
            max_restarts: record.max_restarts,
            restart_count: snap.restart_count,
        }
    }
}

/// Request body for registering a port monitor callback.
#[derive(Debug, Clone, Deserialize)]
pub struct PortMonitorRequest {
    pub callback: String,
}

/// Request body for initiating a multipart upload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultipartInitiateRequest {
    #[serde(default)]
    pub permissions: String,
}

/// Request body for completing a multipart upload.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartCompleteRequest {
    pub parts: Vec<crate::fs::multipart::PartSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_request_accepts_camel_case_fields() {
        let req: ProcessRequest = serde_json::from_str(
            r#"{"command":"ls","waitForCompletion":true,"maxRestarts":3,"waitForPorts":[3000]}"#,
        )
        .unwrap();
        assert_eq!(req.command, "ls");
        assert!(req.wait_for_completion);
        assert_eq!(req.max_restarts, 3);
        assert_eq!(req.wait_for_ports, Some(vec![3000]));
    }

    #[test]
    fn success_response_omits_absent_path() {
        let body = serde_json::to_string(&SuccessResponse::new("done")).unwrap();
        assert!(!body.contains("path"));
        let body = serde_json::to_string(&SuccessResponse::with_path("done", "/tmp/x")).unwrap();
        assert!(body.contains("/tmp/x"));
    }
}
