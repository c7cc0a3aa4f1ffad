//! Transport layer: REST routes and the WebSocket multiplexer.
//!
//! ## Endpoints
//!
//! - `GET/PUT/DELETE /filesystem/{path}` - file or directory (JSON or
//!   binary per content negotiation); `/filesystem/tree/{path}` for tree
//!   variants
//! - `GET /watch/filesystem/{path}` - newline-delimited JSON change events
//! - `/filesystem-multipart/...` - resumable multipart upload sessions
//! - `GET/POST /process`, `GET/DELETE /process/{id}`,
//!   `DELETE /process/{id}/kill`, `GET /process/{id}/logs[/stream]`
//! - `GET /network/process/{pid}/ports`,
//!   `POST/DELETE /network/process/{pid}/monitor`
//! - `GET /ws` - multiplexed WebSocket carrying the same operations
//! - `GET /health` - health check

pub mod filesystem;
pub mod network;
pub mod process;
pub mod routes;
pub mod types;
pub mod ws;

pub use routes::{serve, AppState};
