//! Configuration management for the sandbox agent.
//!
//! Configuration is taken from environment variables:
//! - `HOST` - Optional. Server bind address. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `WORKDIR` - Optional. Working directory that relative client paths
//!   resolve against. Defaults to the current directory, then `/`.
//! - `SHELL` / `SHELL_ARGS` - Optional. Shell used to execute commands
//!   (consulted by the process supervisor at spawn time). Default `sh -c`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Working directory for relative path resolution
    pub working_dir: PathBuf,

    /// Directory holding multipart upload sessions
    pub uploads_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let working_dir = std::env::var("WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));

        Ok(Self {
            host,
            port,
            working_dir,
            uploads_dir: std::env::temp_dir().join("multipart-uploads"),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(working_dir: PathBuf, uploads_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            working_dir,
            uploads_dir,
        }
    }
}
