//! Process supervisor.
//!
//! Commands always execute through a shell (`$SHELL`, default `sh`, with
//! `$SHELL_ARGS`, default `-c`) in their own process group. Output is
//! captured into growing history buffers (stdout, stderr, combined) and
//! fanned out to any number of attached log sinks. Failed processes can be
//! restarted automatically up to a bounded number of attempts; the
//! agent-assigned PID stays stable across restarts.

pub mod service;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::error::{AgentError, Result};

/// Hard ceiling on restart attempts per process.
pub const MAX_RESTARTS: u32 = 25;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const RESTART_DELAY: Duration = Duration::from_secs(1);

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// Parameters for spawning a new supervised process.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
}

/// Mutable per-record state, guarded by the record's state lock.
#[derive(Debug, Clone)]
struct RecordState {
    status: ProcessStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    exit_code: i32,
    restart_count: u32,
    os_pid: i32,
}

#[derive(Copy, Clone)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn prefix(&self) -> &'static [u8] {
        match self {
            StreamKind::Stdout => b"stdout:",
            StreamKind::Stderr => b"stderr:",
        }
    }
}

#[derive(Debug)]
struct LogSink {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Output buffers plus the live sink set, guarded by one lock so a sink
/// attached at time T sees exactly (history up to T) then every later
/// chunk in arrival order.
#[derive(Debug, Default)]
struct OutputState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    sinks: Vec<LogSink>,
}

/// One supervised process. Records are never removed from the index;
/// finished processes remain queryable.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Agent-assigned PID: the decimal OS pid of the first spawn, stable
    /// across restarts.
    pub pid: String,
    pub name: String,
    pub command: String,
    pub working_dir: Option<PathBuf>,
    /// Caller env overrides from the original spawn. Kept for
    /// observability; restarts re-inherit the agent's current environment
    /// and do not reapply these.
    pub env: HashMap<String, String>,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    state: Mutex<RecordState>,
    output: Mutex<OutputState>,
    done_tx: watch::Sender<bool>,
}

/// Point-in-time view of a record's mutable state.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub restart_count: u32,
    pub os_pid: i32,
}

/// Captured output of a process, decoded lossily.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
    pub logs: String,
}

impl ProcessRecord {
    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap().status
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let st = self.state.lock().unwrap();
        ProcessSnapshot {
            status: st.status,
            started_at: st.started_at,
            completed_at: st.completed_at,
            exit_code: st.exit_code,
            restart_count: st.restart_count,
            os_pid: st.os_pid,
        }
    }

    /// Receiver that flips to `true` once the process has finally settled
    /// (completed, or failed with no restart attempts remaining, or was
    /// stopped/killed).
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn logs(&self) -> ProcessLogs {
        let out = self.output.lock().unwrap();
        ProcessLogs {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            logs: String::from_utf8_lossy(&out.combined).to_string(),
        }
    }

    pub fn combined_output(&self) -> Vec<u8> {
        self.output.lock().unwrap().combined.clone()
    }

    /// Append a chunk read from one of the child's pipes, fanning it out
    /// to every attached sink with the stream prefix.
    fn append_output(&self, stream: StreamKind, data: &[u8]) {
        let mut out = self.output.lock().unwrap();
        match stream {
            StreamKind::Stdout => out.stdout.extend_from_slice(data),
            StreamKind::Stderr => out.stderr.extend_from_slice(data),
        }
        out.combined.extend_from_slice(data);

        let mut message = Vec::with_capacity(stream.prefix().len() + data.len());
        message.extend_from_slice(stream.prefix());
        message.extend_from_slice(data);
        for sink in &out.sinks {
            let _ = sink.tx.send(message.clone());
        }
    }

    /// Append a supervisor notice (restart, stop, kill) to the stdout and
    /// combined buffers and to every sink, unprefixed.
    fn append_notice(&self, text: &str) {
        let mut out = self.output.lock().unwrap();
        out.stdout.extend_from_slice(text.as_bytes());
        out.combined.extend_from_slice(text.as_bytes());
        for sink in &out.sinks {
            let _ = sink.tx.send(text.as_bytes().to_vec());
        }
    }

    /// Deliver the full combined history, then attach a live sink.
    fn attach_sink(&self) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed);

        let mut out = self.output.lock().unwrap();
        if !out.combined.is_empty() {
            let _ = tx.send(out.combined.clone());
        }
        out.sinks.push(LogSink { id, tx });
        (id, rx)
    }

    fn remove_sink(&self, sink_id: u64) {
        let mut out = self.output.lock().unwrap();
        out.sinks.retain(|s| s.id != sink_id);
    }

    fn clear_sinks(&self) {
        self.output.lock().unwrap().sinks.clear();
    }

    fn os_pid(&self) -> i32 {
        self.state.lock().unwrap().os_pid
    }
}

/// Build the shell invocation for a command, honoring `$SHELL` and
/// `$SHELL_ARGS` so shell built-ins and compound statements work.
fn shell_command(command: &str) -> Command {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
    let shell_args = std::env::var("SHELL_ARGS").unwrap_or_else(|_| "-c".to_string());

    let mut cmd = Command::new(shell);
    for arg in shell_args.split_whitespace() {
        cmd.arg(arg);
    }
    cmd.arg(command);
    cmd
}

fn spawn_shell(
    command: &str,
    working_dir: Option<&PathBuf>,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let mut cmd = shell_command(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    if let Some(env) = env {
        // Inherited agent environment with the caller's overrides winning
        // per key.
        cmd.envs(env);
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    // Own process group so descendants can be signalled together.
    cmd.process_group(0);
    cmd.spawn()
}

fn spawn_reader<R>(record: Arc<ProcessRecord>, mut pipe: R, stream: StreamKind)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => record.append_output(stream, &buf[..n]),
            }
        }
    });
}

fn wire_child(record: &Arc<ProcessRecord>, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(Arc::clone(record), stdout, StreamKind::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(Arc::clone(record), stderr, StreamKind::Stderr);
    }
}

/// Process-wide supervisor: the identifier index plus lifecycle management.
pub struct ProcessSupervisor {
    processes: RwLock<HashMap<String, Arc<ProcessRecord>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a command under supervision and return its record.
    ///
    /// The record is inserted into the index before any output reader
    /// starts, so lookups observing `running` are immediately safe.
    pub async fn start_process(&self, req: SpawnRequest) -> Result<Arc<ProcessRecord>> {
        if let Some(dir) = &req.working_dir {
            if !dir.is_dir() {
                return Err(AgentError::InvalidInput(format!(
                    "failed to start process '{}': working directory '{}' does not exist",
                    req.command,
                    dir.display()
                )));
            }
        }

        let name = req
            .name
            .clone()
            .unwrap_or_else(|| format!("proc-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let max_restarts = req.max_restarts.min(MAX_RESTARTS);

        let mut child = spawn_shell(&req.command, req.working_dir.as_ref(), Some(&req.env))?;
        let os_pid = child.id().unwrap_or_default() as i32;

        let (done_tx, _) = watch::channel(false);
        let record = Arc::new(ProcessRecord {
            pid: os_pid.to_string(),
            name,
            command: req.command,
            working_dir: req.working_dir,
            env: req.env,
            restart_on_failure: req.restart_on_failure,
            max_restarts,
            state: Mutex::new(RecordState {
                status: ProcessStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                exit_code: 0,
                restart_count: 0,
                os_pid,
            }),
            output: Mutex::new(OutputState::default()),
            done_tx,
        });

        self.processes
            .write()
            .unwrap()
            .insert(record.pid.clone(), Arc::clone(&record));

        wire_child(&record, &mut child);
        tokio::spawn(monitor(Arc::clone(&record), child));

        Ok(record)
    }

    pub fn list(&self) -> Vec<Arc<ProcessRecord>> {
        self.processes.read().unwrap().values().cloned().collect()
    }

    /// Look up a record by agent PID (when the identifier parses as an
    /// integer) or by name, returning the most recently started record
    /// with that name.
    pub fn get_by_identifier(&self, identifier: &str) -> Option<Arc<ProcessRecord>> {
        let processes = self.processes.read().unwrap();
        if identifier.parse::<i64>().is_ok() {
            return processes.get(identifier).cloned();
        }

        processes
            .values()
            .filter(|r| r.name == identifier)
            .max_by_key(|r| (r.state.lock().unwrap().started_at, r.pid.clone()))
            .cloned()
    }

    fn require(&self, identifier: &str) -> Result<Arc<ProcessRecord>> {
        self.get_by_identifier(identifier).ok_or_else(|| {
            AgentError::NotFound(format!("process with identifier {} not found", identifier))
        })
    }

    /// Gracefully stop a process (SIGTERM to its process group, leader
    /// fallback). A no-op for already-finished processes.
    pub fn stop(&self, identifier: &str) -> Result<()> {
        self.signal(
            identifier,
            libc::SIGTERM,
            ProcessStatus::Stopped,
            "\n[Process is being gracefully terminated]\n",
        )
    }

    /// Forcefully kill a process (SIGKILL to its process group, leader
    /// fallback). A no-op for already-finished processes.
    pub fn kill(&self, identifier: &str) -> Result<()> {
        self.signal(
            identifier,
            libc::SIGKILL,
            ProcessStatus::Killed,
            "\n[Process is being forcefully killed]\n",
        )
    }

    fn signal(
        &self,
        identifier: &str,
        signal: i32,
        status: ProcessStatus,
        notice: &str,
    ) -> Result<()> {
        let record = self.require(identifier)?;

        {
            let mut st = record.state.lock().unwrap();
            if st.status != ProcessStatus::Running {
                // Idempotent for finished processes.
                return Ok(());
            }
            // Set before signalling so the wait task does not flip the
            // record to failed.
            st.status = status;
        }

        record.append_notice(notice);

        let pid = record.os_pid();
        if pid > 0 {
            // Group first; some shells fail to create a new group, so fall
            // back to the leader. Signalling an exited process is not an
            // error.
            unsafe {
                if libc::kill(-pid, signal) != 0 {
                    let _ = libc::kill(pid, signal);
                }
            }
        }
        Ok(())
    }

    /// Captured output for a process.
    pub fn output(&self, identifier: &str) -> Result<ProcessLogs> {
        Ok(self.require(identifier)?.logs())
    }

    /// Attach a log sink: the sink first receives the full combined
    /// history, then every subsequent chunk prefixed with `stdout:` or
    /// `stderr:`. A per-attachment keepalive writes `[keepalive]\n` every
    /// 30 seconds while the process is still running.
    pub fn attach_sink(
        &self,
        identifier: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let record = self.require(identifier)?;
        let (sink_id, rx) = record.attach_sink();

        let keepalive_record = Arc::clone(&record);
        let keepalive_tx = {
            let out = record.output.lock().unwrap();
            out.sinks.iter().find(|s| s.id == sink_id).map(|s| s.tx.clone())
        };
        if let Some(tx) = keepalive_tx {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                    if keepalive_record.status() != ProcessStatus::Running {
                        break;
                    }
                    if tx.send(b"[keepalive]\n".to_vec()).is_err() {
                        break;
                    }
                }
            });
        }

        Ok((sink_id, rx))
    }

    /// Detach a sink. Unknown sinks are a no-op.
    pub fn remove_sink(&self, identifier: &str, sink_id: u64) {
        if let Some(record) = self.get_by_identifier(identifier) {
            record.remove_sink(sink_id);
        }
    }
}

/// Await the child, finalize the record, and drive the restart policy.
async fn monitor(record: Arc<ProcessRecord>, mut child: Child) {
    loop {
        let wait_result = child.wait().await;
        // Drop the handle right away so kernels that allocate pid-fds do
        // not leak them across restarts.
        drop(child);

        let (exit_code, should_restart, attempt) = {
            let mut st = record.state.lock().unwrap();
            st.completed_at = Some(Utc::now());
            match &wait_result {
                Ok(status) if status.success() => {
                    st.status = ProcessStatus::Completed;
                    st.exit_code = 0;
                }
                Ok(status) => {
                    if st.status != ProcessStatus::Stopped && st.status != ProcessStatus::Killed {
                        st.status = ProcessStatus::Failed;
                    }
                    st.exit_code = status.code().unwrap_or(1);
                }
                Err(_) => {
                    if st.status != ProcessStatus::Stopped && st.status != ProcessStatus::Killed {
                        st.status = ProcessStatus::Failed;
                    }
                    st.exit_code = 1;
                }
            }

            let restart = st.status == ProcessStatus::Failed
                && record.restart_on_failure
                && st.restart_count < record.max_restarts;
            (st.exit_code, restart, st.restart_count + 1)
        };

        if !should_restart {
            record.clear_sinks();
            let _ = record.done_tx.send(true);
            return;
        }

        record.append_notice(&format!(
            "\n[Process failed with exit code {}. Attempting restart {}/{}...]\n",
            exit_code, attempt, record.max_restarts
        ));
        record.state.lock().unwrap().restart_count += 1;

        tokio::time::sleep(RESTART_DELAY).await;

        // Re-spawn with the agent's current environment; the original
        // caller overrides are intentionally not reapplied.
        match spawn_shell(&record.command, record.working_dir.as_ref(), None) {
            Ok(mut new_child) => {
                {
                    let mut st = record.state.lock().unwrap();
                    st.status = ProcessStatus::Running;
                    st.started_at = Utc::now();
                    st.completed_at = None;
                    st.exit_code = 0;
                    st.os_pid = new_child.id().unwrap_or_default() as i32;
                }
                wire_child(&record, &mut new_child);
                child = new_child;
            }
            Err(e) => {
                record.append_notice(&format!("\n[Failed to restart process: {}]\n", e));
                record.state.lock().unwrap().status = ProcessStatus::Failed;
                record.clear_sinks();
                let _ = record.done_tx.send(true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_done(record: &Arc<ProcessRecord>) {
        let mut rx = record.finished();
        if !*rx.borrow() {
            let _ = tokio::time::timeout(Duration::from_secs(15), rx.changed()).await;
        }
    }

    fn supervisor() -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new())
    }

    #[tokio::test]
    async fn echo_process_completes_with_captured_output() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "echo 'Hello, Supervisor!'".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        wait_done(&record).await;

        let snap = record.snapshot();
        assert_eq!(snap.status, ProcessStatus::Completed);
        assert_eq!(snap.exit_code, 0);
        assert!(snap.completed_at.unwrap() >= snap.started_at);

        let logs = record.logs();
        assert_eq!(logs.stdout.trim(), "Hello, Supervisor!");
        assert!(logs.stderr.is_empty());
        assert_eq!(logs.logs.len(), logs.stdout.len() + logs.stderr.len());
    }

    #[tokio::test]
    async fn combined_buffer_merges_both_streams() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "echo out; echo err 1>&2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&record).await;

        let logs = record.logs();
        assert_eq!(logs.stdout, "out\n");
        assert_eq!(logs.stderr, "err\n");
        assert_eq!(logs.logs.len(), logs.stdout.len() + logs.stderr.len());
    }

    #[tokio::test]
    async fn sinks_receive_prefixed_chunks() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "sleep 0.2; echo tick; echo boom 1>&2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (_sink, mut rx) = sup.attach_sink(&record.pid).unwrap();
        wait_done(&record).await;

        let mut received = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            received.push(String::from_utf8_lossy(&chunk).to_string());
        }
        assert!(
            received.iter().any(|c| c.starts_with("stdout:") && c.contains("tick")),
            "missing stdout chunk: {:?}",
            received
        );
        assert!(
            received.iter().any(|c| c.starts_with("stderr:") && c.contains("boom")),
            "missing stderr chunk: {:?}",
            received
        );
    }

    #[tokio::test]
    async fn late_sink_gets_full_history_exactly_once() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "echo first; echo second".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&record).await;

        let (_sink, mut rx) = sup.attach_sink(&record.pid).unwrap();
        let history = rx.try_recv().expect("history chunk expected");
        assert_eq!(history, record.combined_output());
        assert!(rx.try_recv().is_err(), "no further chunks expected");
    }

    #[tokio::test]
    async fn missing_working_directory_fails_eagerly_with_context() {
        let sup = supervisor();
        let err = sup
            .start_process(SpawnRequest {
                command: "echo never".to_string(),
                working_dir: Some(PathBuf::from("/definitely/not/here")),
                ..Default::default()
            })
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("echo never"), "message: {}", msg);
        assert!(msg.contains("/definitely/not/here"), "message: {}", msg);
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "sleep 30".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.status(), ProcessStatus::Running);

        sup.stop(&record.pid).unwrap();
        wait_done(&record).await;
        assert_eq!(record.status(), ProcessStatus::Stopped);
        assert!(record.logs().stdout.contains("gracefully terminated"));

        // Idempotent for an already-finished process.
        sup.stop(&record.pid).unwrap();
        assert_eq!(record.status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn kill_marks_process_killed() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "sleep 30".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        sup.kill(&record.pid).unwrap();
        wait_done(&record).await;
        assert_eq!(record.status(), ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_found() {
        let sup = supervisor();
        assert!(matches!(
            sup.stop("99999999"),
            Err(AgentError::NotFound(_))
        ));
        assert!(sup.get_by_identifier("no-such-name").is_none());
    }

    #[tokio::test]
    async fn name_lookup_returns_latest_record() {
        let sup = supervisor();
        let first = sup
            .start_process(SpawnRequest {
                command: "true".to_string(),
                name: Some("worker".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&first).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = sup
            .start_process(SpawnRequest {
                command: "true".to_string(),
                name: Some("worker".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&second).await;

        let found = sup.get_by_identifier("worker").unwrap();
        assert_eq!(found.pid, second.pid);
    }

    #[tokio::test]
    async fn restart_reaches_eventual_success() {
        let sup = supervisor();
        let counter = std::env::temp_dir().join(format!("sandbox_agent_rc_{}", uuid::Uuid::new_v4()));
        let command = format!(
            "c=$(cat {path} 2>/dev/null || echo 0); c=$((c+1)); echo $c > {path}; \
             echo \"Attempt $c\"; if [ $c -lt 3 ]; then exit 1; else exit 0; fi",
            path = counter.display()
        );

        let record = sup
            .start_process(SpawnRequest {
                command,
                restart_on_failure: true,
                max_restarts: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&record).await;

        let snap = record.snapshot();
        assert_eq!(snap.status, ProcessStatus::Completed);
        assert_eq!(snap.exit_code, 0);
        assert_eq!(snap.restart_count, 2);

        let logs = record.logs().logs;
        for attempt in ["Attempt 1", "Attempt 2", "Attempt 3"] {
            assert!(logs.contains(attempt), "missing {:?} in {:?}", attempt, logs);
        }
        assert!(logs.contains("Attempting restart 1/5"));
        assert!(logs.contains("Attempting restart 2/5"));

        let _ = std::fs::remove_file(&counter);
    }

    #[tokio::test]
    async fn restart_ceiling_settles_as_failed() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "echo \"Failing\"; exit 1".to_string(),
                restart_on_failure: true,
                max_restarts: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&record).await;

        let snap = record.snapshot();
        assert_eq!(snap.status, ProcessStatus::Failed);
        assert_eq!(snap.exit_code, 1);
        assert_eq!(snap.restart_count, 2);

        let logs = record.logs().logs;
        assert_eq!(logs.matches("Failing").count(), 3);
    }

    #[tokio::test]
    async fn agent_pid_is_stable_across_restarts() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "exit 1".to_string(),
                restart_on_failure: true,
                max_restarts: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let agent_pid = record.pid.clone();
        wait_done(&record).await;

        let found = sup.get_by_identifier(&agent_pid).unwrap();
        let snap = found.snapshot();
        assert_eq!(found.pid, agent_pid);
        assert_eq!(snap.status, ProcessStatus::Failed);
        assert_eq!(snap.restart_count, 2);

        // Listed exactly once despite the restarts.
        let listed: Vec<_> = sup.list().into_iter().filter(|r| r.pid == agent_pid).collect();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn max_restarts_is_clamped() {
        let sup = supervisor();
        let record = sup
            .start_process(SpawnRequest {
                command: "true".to_string(),
                max_restarts: 500,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.max_restarts, MAX_RESTARTS);
        wait_done(&record).await;
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let sup = supervisor();
        let mut env = HashMap::new();
        env.insert("SANDBOX_AGENT_TEST_VAR".to_string(), "it-works".to_string());
        let record = sup
            .start_process(SpawnRequest {
                command: "echo $SANDBOX_AGENT_TEST_VAR".to_string(),
                env,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_done(&record).await;
        assert_eq!(record.logs().stdout.trim(), "it-works");
    }
}
