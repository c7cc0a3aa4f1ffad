//! Process execution orchestration.
//!
//! Wraps the supervisor's spawn with the request-level options carried by
//! the transports: waiting for completion with a timeout, and blocking
//! until the process has opened a set of ports.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AgentError, Result};
use crate::network::PortScanner;

use super::{ProcessRecord, ProcessStatus, ProcessSupervisor, SpawnRequest};

/// Transport-level execution request.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    pub wait_for_completion: bool,
    /// Seconds; only meaningful with `wait_for_completion`.
    pub timeout: Option<u64>,
    pub wait_for_ports: Vec<u16>,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
}

/// Execute a command, optionally waiting for completion.
///
/// Requested ports are watched through the scanner's monitor; the wait is
/// satisfied as soon as either the process completes or every named port
/// has been observed open. A timeout returns `Timeout` and leaves the
/// child running.
pub async fn execute(
    supervisor: &Arc<ProcessSupervisor>,
    scanner: &Arc<PortScanner>,
    req: ExecuteRequest,
) -> Result<Arc<ProcessRecord>> {
    if let Some(name) = &req.name {
        if let Some(existing) = supervisor.get_by_identifier(name) {
            if existing.status() == ProcessStatus::Running {
                return Err(AgentError::InvalidInput(format!(
                    "process with name '{}' already exists and is running",
                    name
                )));
            }
        }
    }

    let record = supervisor
        .start_process(SpawnRequest {
            command: req.command,
            working_dir: req.working_dir,
            name: req.name,
            env: req.env,
            restart_on_failure: req.restart_on_failure,
            max_restarts: req.max_restarts,
        })
        .await?;

    let ports_ready = if !req.wait_for_ports.is_empty() {
        Some(watch_ports(scanner, &record.pid, &req.wait_for_ports))
    } else {
        None
    };

    if req.wait_for_completion {
        let mut done = record.finished();
        let mut ports_ready = ports_ready;
        let wait = async {
            tokio::select! {
                _ = async {
                    if !*done.borrow() {
                        let _ = done.changed().await;
                    }
                } => {}
                _ = async {
                    match ports_ready.as_mut() {
                        Some(ready) if !*ready.borrow() => {
                            let _ = ready.changed().await;
                        }
                        Some(_) => {}
                        None => std::future::pending().await,
                    }
                } => {}
            }
        };
        match req.timeout {
            Some(secs) if secs > 0 => {
                tokio::time::timeout(Duration::from_secs(secs), wait)
                    .await
                    .map_err(|_| {
                        AgentError::Timeout(format!("process timed out after {} seconds", secs))
                    })?;
            }
            _ => wait.await,
        }
    }

    Ok(record)
}

/// Register a monitor callback that unregisters itself once every wanted
/// port has been seen open. The returned receiver flips to `true` at that
/// point so callers can wait on it.
fn watch_ports(
    scanner: &Arc<PortScanner>,
    pid: &str,
    ports: &[u16],
) -> watch::Receiver<bool> {
    let (ready_tx, ready_rx) = watch::channel(false);
    let Ok(pid) = pid.parse::<i32>() else {
        return ready_rx;
    };
    let wanted: HashSet<u16> = ports.iter().copied().collect();
    let seen = Arc::new(Mutex::new(HashSet::<u16>::new()));
    let scanner_handle = Arc::clone(scanner);

    scanner.register_callback(
        pid,
        Arc::new(move |cb_pid, port| {
            let mut seen = seen.lock().unwrap();
            if wanted.contains(&port.local_port) {
                seen.insert(port.local_port);
            }
            if seen.len() == wanted.len() {
                let _ = ready_tx.send(true);
                // Callbacks run outside the scanner lock, so re-entering
                // here is safe.
                scanner_handle.unregister(cb_pid);
            }
        }),
    );

    ready_rx
}
