//! # Sandbox Agent
//!
//! Control-plane agent that runs inside an isolated execution environment
//! and exposes the environment's filesystem, processes and local network
//! state to remote clients over REST and WebSocket.
//!
//! The runtime is a set of explicitly constructed singletons:
//!
//! ```text
//!        ┌────────────────────────────────────┐
//!        │           transports               │
//!        │   (axum REST + WebSocket mux)      │
//!        └───────┬─────────┬─────────┬────────┘
//!                │         │         │
//!                ▼         ▼         ▼
//!        ProcessSupervisor FileStore PortScanner
//!                │         │
//!                ▼         ▼
//!          log fan-out   UploadCoordinator / WatchEngine
//! ```
//!
//! ## Modules
//! - `process`: supervisor, output fan-out, restart policy, execution
//!   orchestration
//! - `fs`: path resolution, file store, directory watching, multipart
//!   uploads
//! - `network`: per-PID port discovery and monitoring
//! - `api`: REST routes and the WebSocket operation multiplexer

pub mod api;
pub mod config;
pub mod error;
pub mod fs;
pub mod network;
pub mod process;
pub mod util;

pub use config::Config;
pub use error::AgentError;
