//! Shared utility functions used across the codebase.

use axum::http::StatusCode;

use crate::error::AgentError;

/// Map a core error to an HTTP response tuple.
pub fn core_error(e: AgentError) -> (StatusCode, String) {
    (e.status_code(), e.to_string())
}

/// Map any error into an HTTP 500 response.
pub fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Parse an octal permission string like `"0644"` into mode bits.
///
/// An empty string yields `default`.
pub fn parse_permissions(s: &str, default: u32) -> Result<u32, AgentError> {
    if s.is_empty() {
        return Ok(default);
    }
    u32::from_str_radix(s, 8)
        .map_err(|e| AgentError::InvalidInput(format!("invalid permissions format '{}': {}", s, e)))
}

/// Format mode bits as the octal string used in API responses.
pub fn format_permissions(mode: u32) -> String {
    format!("{:o}", mode & 0o7777)
}

/// Content-Type for a file, derived from its extension.
pub fn content_type_for_path(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("tar") => "application/x-tar",
        Some("gz") => "application/gzip",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parse_permissions_accepts_octal_strings() {
        assert_eq!(parse_permissions("0644", 0o644).unwrap(), 0o644);
        assert_eq!(parse_permissions("755", 0o644).unwrap(), 0o755);
        assert_eq!(parse_permissions("", 0o644).unwrap(), 0o644);
        assert!(parse_permissions("89", 0o644).is_err());
        assert!(parse_permissions("rwx", 0o644).is_err());
    }

    #[test]
    fn format_permissions_strips_file_type_bits() {
        assert_eq!(format_permissions(0o100644), "644");
        assert_eq!(format_permissions(0o40755), "755");
    }

    #[test]
    fn content_type_for_known_and_unknown_extensions() {
        assert_eq!(content_type_for_path(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for_path(Path::new("a.PNG")), "image/png");
        assert_eq!(
            content_type_for_path(Path::new("a.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for_path(Path::new("noext")),
            "application/octet-stream"
        );
    }
}
