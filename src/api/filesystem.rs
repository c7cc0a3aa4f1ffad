//! Filesystem endpoints: files, directories, trees, watch streams and
//! multipart upload sessions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, OriginalUri, Path as AxumPath, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    RequestExt,
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::routes::AppState;
use super::types::{
    FileRequest, MultipartCompleteRequest, MultipartInitiateRequest, SuccessResponse,
};
use crate::fs::watch;
use crate::util::{content_type_for_path, core_error, internal_error, parse_permissions};

type ApiError = (StatusCode, String);

/// Decode the client path from a wildcard capture.
///
/// A leading `%2F` in the raw (undecoded) URL marks an absolute path; a
/// plain leading `/` is stripped and the remainder treated as relative.
/// An empty path means `.`, the working directory.
fn decode_request_path(raw_uri: &str, decoded: &str) -> String {
    if raw_uri.contains("%2F") || raw_uri.contains("%2f") {
        return decoded.to_string();
    }
    let trimmed = decoded.trim_start_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Split a `/filesystem/{*path}` capture into (tree mode, client path).
fn classify_request(raw_uri: &str, wildcard: &str) -> (bool, String) {
    if wildcard == "tree" {
        (true, ".".to_string())
    } else if let Some(rest) = wildcard.strip_prefix("tree/") {
        (true, decode_request_path(raw_uri, rest))
    } else {
        (false, decode_request_path(raw_uri, wildcard))
    }
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        "file or directory not found".to_string(),
    )
}

// ---------------------------------------------------------------------------
// GET / PUT / DELETE /filesystem/{path}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GetFileQuery {
    pub download: Option<String>,
}

pub async fn get_entry(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AxumPath(path): AxumPath<String>,
    Query(q): Query<GetFileQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (tree, client_path) = classify_request(uri.path(), &path);
    get_entry_at(&state, &client_path, tree, &q, &headers).await
}

pub async fn get_root(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GetFileQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    get_entry_at(&state, ".", false, &q, &headers).await
}

async fn get_entry_at(
    state: &AppState,
    client_path: &str,
    tree_only: bool,
    q: &GetFileQuery,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let is_dir = state
        .store
        .directory_exists(client_path)
        .await
        .map_err(core_error)?;

    if tree_only && !is_dir {
        return Err((
            StatusCode::BAD_REQUEST,
            "path is not a directory".to_string(),
        ));
    }

    if is_dir {
        let dir = state
            .store
            .list_directory(client_path)
            .await
            .map_err(core_error)?;
        return Ok(Json(dir).into_response());
    }

    if !state
        .store
        .file_exists(client_path)
        .await
        .map_err(core_error)?
    {
        return Err(not_found());
    }

    if wants_download(q, headers) {
        return download_file(state, client_path).await;
    }

    let file = state.store.read_file(client_path).await.map_err(core_error)?;
    Ok(Json(file).into_response())
}

/// JSON mode unless `download=true`, `Accept: application/octet-stream`,
/// or an Accept value that is neither `application/json` nor `*/*`.
fn wants_download(q: &GetFileQuery, headers: &HeaderMap) -> bool {
    if q.download.as_deref() == Some("true") {
        return true;
    }
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    if accept.contains("application/octet-stream") {
        return true;
    }
    !accept.contains("application/json") && !accept.contains("*/*")
}

/// Stream the file directly from disk, no buffering.
async fn download_file(state: &AppState, client_path: &str) -> Result<Response, ApiError> {
    let abs = state.store.resolve(client_path).map_err(core_error)?;
    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("error reading file: {}", e)))?;
    if meta.is_dir() {
        return Err((
            StatusCode::BAD_REQUEST,
            "path is a directory, not a file".to_string(),
        ));
    }

    let filename = abs
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    let file = tokio::fs::File::open(&abs)
        .await
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("error opening file: {}", e)))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(internal_error)?,
    );
    headers.insert(
        header::CONTENT_TYPE,
        content_type_for_path(&abs).parse().map_err(internal_error)?,
    );
    headers.insert(header::CONTENT_LENGTH, meta.len().into());
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct TreeRequest {
    #[serde(default)]
    files: std::collections::HashMap<String, String>,
}

pub async fn create_or_update_entry(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AxumPath(path): AxumPath<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let (tree, client_path) = classify_request(uri.path(), &path);

    if tree {
        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        let req: TreeRequest = serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        let dir = state
            .store
            .create_or_update_tree(&client_path, &req.files)
            .await
            .map_err(core_error)?;
        return Ok(Json(dir).into_response());
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = request
            .extract::<Multipart, _>()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        return create_binary(&state, &client_path, multipart).await;
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let req: FileRequest =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    if req.is_directory {
        let mode = parse_permissions(&req.permissions, 0o755).map_err(core_error)?;
        state
            .store
            .create_directory(&client_path, mode)
            .await
            .map_err(core_error)?;
        return Ok(Json(SuccessResponse::with_path(
            "Directory created successfully",
            client_path,
        ))
        .into_response());
    }

    let mode = parse_permissions(&req.permissions, 0o644).map_err(core_error)?;
    state
        .store
        .write_file(&client_path, req.content.as_bytes(), mode)
        .await
        .map_err(core_error)?;
    Ok(Json(SuccessResponse::with_path(
        "File created/updated successfully",
        client_path,
    ))
    .into_response())
}

/// Streamed binary upload through a multipart form: optional `permissions`
/// text field, then the `file` field written straight to disk.
async fn create_binary(
    state: &AppState,
    client_path: &str,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut permissions = 0o644;
    let mut wrote_file = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "permissions" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                permissions = parse_permissions(text.trim(), 0o644).map_err(core_error)?;
            }
            "file" if !wrote_file => {
                let tmp = spool_field(&mut field).await?;
                let result = async {
                    let mut reader =
                        tokio::fs::File::open(&tmp).await.map_err(internal_error)?;
                    state
                        .store
                        .write_file_from_reader(client_path, &mut reader, permissions)
                        .await
                        .map_err(core_error)
                }
                .await;
                let _ = tokio::fs::remove_file(&tmp).await;
                result?;
                wrote_file = true;
            }
            _ => {}
        }
    }

    if !wrote_file {
        return Err((
            StatusCode::BAD_REQUEST,
            "missing 'file' field in multipart form".to_string(),
        ));
    }

    Ok(Json(SuccessResponse::with_path(
        "Binary file uploaded successfully",
        client_path,
    ))
    .into_response())
}

/// Spool a multipart field to a temp file so large uploads never buffer in
/// memory.
async fn spool_field(
    field: &mut axum::extract::multipart::Field<'_>,
) -> Result<std::path::PathBuf, ApiError> {
    let tmp = std::env::temp_dir().join(format!("sandbox_agent_upload_{}", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&tmp).await.map_err(internal_error)?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if let Err(e) = file.write_all(&chunk).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(internal_error(e));
        }
    }
    file.flush().await.map_err(internal_error)?;
    Ok(tmp)
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub recursive: Option<String>,
}

pub async fn delete_entry(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AxumPath(path): AxumPath<String>,
    Query(q): Query<DeleteQuery>,
) -> Result<Response, ApiError> {
    let (tree, client_path) = classify_request(uri.path(), &path);
    let recursive = q.recursive.as_deref() == Some("true");

    if tree {
        state
            .store
            .delete_directory(&client_path, recursive)
            .await
            .map_err(core_error)?;
        return Ok(Json(SuccessResponse::with_path(
            "Directory deleted successfully",
            client_path,
        ))
        .into_response());
    }

    if state
        .store
        .directory_exists(&client_path)
        .await
        .map_err(core_error)?
    {
        state
            .store
            .delete_directory(&client_path, recursive)
            .await
            .map_err(core_error)?;
        return Ok(Json(SuccessResponse::with_path(
            "Directory deleted successfully",
            client_path,
        ))
        .into_response());
    }

    if state
        .store
        .file_exists(&client_path)
        .await
        .map_err(core_error)?
    {
        state
            .store
            .delete_file(&client_path)
            .await
            .map_err(core_error)?;
        return Ok(Json(SuccessResponse::with_path(
            "File deleted successfully",
            client_path,
        ))
        .into_response());
    }

    Err(not_found())
}

// ---------------------------------------------------------------------------
// GET /watch/filesystem/{path}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    pub ignore: Option<String>,
}

/// Newline-delimited JSON event stream. A path ending `/**` subscribes
/// recursively; `?ignore=a,b` filters events whose path contains any
/// listed substring. `[keepalive]` lines are emitted every 30 seconds.
pub async fn watch_directory(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AxumPath(path): AxumPath<String>,
    Query(q): Query<WatchQuery>,
) -> Result<Response, ApiError> {
    let mut client_path = decode_request_path(uri.path(), &path);

    let recursive = client_path.ends_with("/**");
    if recursive {
        client_path.truncate(client_path.len() - 3);
        if client_path.is_empty() {
            client_path = "/".to_string();
        }
    }

    let ignore: Vec<String> = q
        .ignore
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if !state
        .store
        .directory_exists(&client_path)
        .await
        .map_err(core_error)?
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "path is not a directory".to_string(),
        ));
    }

    let abs = state.store.resolve(&client_path).map_err(core_error)?;
    let mut subscription = watch::watch(&abs, recursive, ignore).map_err(core_error)?;

    let stream = async_stream::stream! {
        let mut keepalive = tokio::time::interval(Duration::from_secs(30));
        keepalive.tick().await; // immediate first tick
        loop {
            tokio::select! {
                event = subscription.next_event() => match event {
                    Some(event) => {
                        match serde_json::to_string(&event) {
                            Ok(line) => yield Ok::<_, std::convert::Infallible>(Bytes::from(line + "\n")),
                            Err(e) => tracing::error!("error marshalling file event: {}", e),
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    yield Ok(Bytes::from("[keepalive]\n"));
                }
            }
        }
    };

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "text/plain; charset=utf-8".parse().map_err(internal_error)?,
    );
    headers.insert("X-Accel-Buffering", "no".parse().map_err(internal_error)?);
    Ok(response)
}

// ---------------------------------------------------------------------------
// /filesystem-multipart
// ---------------------------------------------------------------------------

pub async fn list_uploads(State(state): State<Arc<AppState>>) -> Response {
    let uploads = state.uploads.list().await;
    Json(serde_json::json!({ "uploads": uploads })).into_response()
}

pub async fn initiate_upload(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AxumPath(path): AxumPath<String>,
    body: Option<Json<MultipartInitiateRequest>>,
) -> Result<Response, ApiError> {
    let client_path = decode_request_path(uri.path(), &path);
    let abs = state.store.resolve(&client_path).map_err(core_error)?;

    let permissions = body
        .map(|Json(req)| parse_permissions(&req.permissions, 0o644))
        .transpose()
        .map_err(core_error)?
        .unwrap_or(0o644);

    let session = state
        .uploads
        .initiate(abs.clone(), permissions)
        .await
        .map_err(core_error)?;

    Ok(Json(serde_json::json!({
        "uploadId": session.upload_id,
        "path": abs,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartQuery {
    pub part_number: Option<u32>,
}

pub async fn upload_part(
    State(state): State<Arc<AppState>>,
    AxumPath(upload_id): AxumPath<String>,
    Query(q): Query<UploadPartQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let part_number = q
        .part_number
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "partNumber is required".to_string()))?;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let tmp = spool_field(&mut field).await?;
        let result = async {
            let mut reader = tokio::fs::File::open(&tmp).await.map_err(internal_error)?;
            state
                .uploads
                .upload_part(&upload_id, part_number, &mut reader)
                .await
                .map_err(core_error)
        }
        .await;
        let _ = tokio::fs::remove_file(&tmp).await;
        let part = result?;

        return Ok(Json(serde_json::json!({
            "partNumber": part.part_number,
            "etag": part.etag,
            "size": part.size,
        }))
        .into_response());
    }

    Err((
        StatusCode::BAD_REQUEST,
        "missing 'file' field in multipart form".to_string(),
    ))
}

pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    AxumPath(upload_id): AxumPath<String>,
    Json(req): Json<MultipartCompleteRequest>,
) -> Result<Response, ApiError> {
    if req.parts.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "at least one part is required".to_string(),
        ));
    }

    let path = state
        .uploads
        .complete(&upload_id, req.parts)
        .await
        .map_err(core_error)?;

    Ok(Json(SuccessResponse::with_path(
        "Multipart upload completed successfully",
        path.to_string_lossy(),
    ))
    .into_response())
}

pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    AxumPath(upload_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    state.uploads.abort(&upload_id).await.map_err(core_error)?;
    Ok(Json(SuccessResponse::new("Multipart upload aborted successfully")).into_response())
}

pub async fn list_parts(
    State(state): State<Arc<AppState>>,
    AxumPath(upload_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let parts = state.uploads.list_parts(&upload_id).await.map_err(core_error)?;
    Ok(Json(serde_json::json!({
        "uploadId": upload_id,
        "parts": parts,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_request_path_handles_encoding_rules() {
        // %2F in the raw URL marks an absolute path.
        assert_eq!(
            decode_request_path("/filesystem/%2Ftmp%2Fdata", "/tmp/data"),
            "/tmp/data"
        );
        // A plain leading slash is stripped and treated as relative.
        assert_eq!(decode_request_path("/filesystem/src/main.rs", "/src/main.rs"), "src/main.rs");
        assert_eq!(decode_request_path("/filesystem/src", "src"), "src");
        // `/` by itself resolves to the working directory.
        assert_eq!(decode_request_path("/filesystem/", ""), ".");
        assert_eq!(decode_request_path("/filesystem//", "/"), ".");
    }

    #[test]
    fn classify_request_splits_tree_routes() {
        assert_eq!(
            classify_request("/filesystem/tree/src", "tree/src"),
            (true, "src".to_string())
        );
        assert_eq!(
            classify_request("/filesystem/tree", "tree"),
            (true, ".".to_string())
        );
        assert_eq!(
            classify_request("/filesystem/tree/%2Ftmp%2Fw", "tree//tmp/w"),
            (true, "/tmp/w".to_string())
        );
        assert_eq!(
            classify_request("/filesystem/treehouse", "treehouse"),
            (false, "treehouse".to_string())
        );
    }

    #[test]
    fn wants_download_follows_accept_negotiation() {
        let q = |d: Option<&str>| GetFileQuery {
            download: d.map(|s| s.to_string()),
        };
        let headers_with = |accept: Option<&str>| {
            let mut h = HeaderMap::new();
            if let Some(a) = accept {
                h.insert(header::ACCEPT, a.parse().unwrap());
            }
            h
        };

        assert!(wants_download(&q(Some("true")), &headers_with(None)));
        assert!(!wants_download(&q(None), &headers_with(None)));
        assert!(!wants_download(&q(None), &headers_with(Some("*/*"))));
        assert!(!wants_download(&q(None), &headers_with(Some("application/json"))));
        assert!(wants_download(
            &q(None),
            &headers_with(Some("application/octet-stream"))
        ));
        assert!(wants_download(&q(None), &headers_with(Some("text/plain"))));
    }
}
