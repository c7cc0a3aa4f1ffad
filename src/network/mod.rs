//! Port-discovery monitor.
//!
//! Enumerates a process's listening sockets by shelling out to the
//! platform's listing tool (`ss` with a `netstat` fallback on Linux,
//! `lsof` on macOS) and drives "new port opened" callbacks from a 2-second
//! scan tick. Parse failures skip the offending line, never the scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// One open port owned by a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub pid: i32,
    pub protocol: String,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub state: String,
    pub process_name: String,
}

/// Invoked once per (pid, newly-appeared port) transition.
pub type PortCallback = Arc<dyn Fn(i32, PortInfo) + Send + Sync>;

struct ScannerState {
    ports_by_pid: HashMap<i32, HashMap<u16, PortInfo>>,
    callbacks: HashMap<i32, Vec<PortCallback>>,
    running: bool,
}

/// Process-wide port scanner and monitor.
pub struct PortScanner {
    state: Arc<Mutex<ScannerState>>,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PortScanner {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScannerState {
                ports_by_pid: HashMap::new(),
                callbacks: HashMap::new(),
                running: false,
            })),
        }
    }

    /// Current open ports for a pid. A missing process or empty listing is
    /// not an error.
    pub async fn ports_for_pid(&self, pid: i32) -> Result<Vec<PortInfo>> {
        let ports = list_ports(pid).await?;
        let mut state = self.state.lock().unwrap();
        state
            .ports_by_pid
            .insert(pid, ports.iter().map(|p| (p.local_port, p.clone())).collect());
        Ok(ports)
    }

    /// Register a callback fired for every port the pid newly opens. The
    /// first registration starts the scan ticker.
    pub fn register_callback(&self, pid: i32, callback: PortCallback) {
        {
            let mut state = self.state.lock().unwrap();
            state.callbacks.entry(pid).or_default().push(callback);
        }
        self.ensure_monitoring();
    }

    /// Remove every callback for a pid. The ticker stops once no pids are
    /// registered.
    pub fn unregister(&self, pid: i32) {
        let mut state = self.state.lock().unwrap();
        state.callbacks.remove(&pid);
        state.ports_by_pid.remove(&pid);
    }

    pub fn monitored_pids(&self) -> Vec<i32> {
        self.state.lock().unwrap().callbacks.keys().copied().collect()
    }

    fn ensure_monitoring(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
        }

        tokio::spawn(monitor_loop(Arc::clone(&self.state)));
    }
}

/// Scan every registered pid on a 2-second tick, firing callbacks for
/// ports that were absent from the previous scan. Exits (and flips the
/// running flag) once no pids remain registered.
async fn monitor_loop(state: Arc<Mutex<ScannerState>>) {
    loop {
        tokio::time::sleep(SCAN_INTERVAL).await;

        let pids = {
            let mut state = state.lock().unwrap();
            if state.callbacks.is_empty() {
                state.running = false;
                return;
            }
            state.callbacks.keys().copied().collect::<Vec<_>>()
        };

        for pid in pids {
            let ports = match list_ports(pid).await {
                Ok(ports) => ports,
                Err(e) => {
                    tracing::error!("error scanning ports for pid {}: {}", pid, e);
                    continue;
                }
            };

            // Diff under the lock; invoke callbacks outside it on fresh
            // tasks so handlers may re-enter the scanner.
            let mut fired: Vec<(PortCallback, PortInfo)> = Vec::new();
            {
                let mut state = state.lock().unwrap();
                let previous = state.ports_by_pid.insert(
                    pid,
                    ports.iter().map(|p| (p.local_port, p.clone())).collect(),
                );
                let previous = previous.unwrap_or_default();
                if let Some(callbacks) = state.callbacks.get(&pid) {
                    for port in &ports {
                        if !previous.contains_key(&port.local_port) {
                            for cb in callbacks {
                                fired.push((Arc::clone(cb), port.clone()));
                            }
                        }
                    }
                }
            }
            for (callback, port) in fired {
                tokio::spawn(async move {
                    callback(pid, port);
                });
            }
        }
    }
}

/// Platform entry point for the per-PID lookup.
#[cfg(target_os = "macos")]
async fn list_ports(pid: i32) -> Result<Vec<PortInfo>> {
    lsof_ports(pid).await
}

#[cfg(not(target_os = "macos"))]
async fn list_ports(pid: i32) -> Result<Vec<PortInfo>> {
    match ss_ports(pid).await {
        Ok(ports) => Ok(ports),
        Err(_) => netstat_ports(pid).await,
    }
}

#[cfg(not(target_os = "macos"))]
async fn ss_ports(pid: i32) -> Result<Vec<PortInfo>> {
    let output = tokio::process::Command::new("ss")
        .arg("-tunap")
        .output()
        .await?;
    if !output.status.success() {
        return Err(AgentError::Io(std::io::Error::other("ss failed")));
    }
    Ok(parse_ss_output(pid, &String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(target_os = "macos"))]
async fn netstat_ports(pid: i32) -> Result<Vec<PortInfo>> {
    let output = tokio::process::Command::new("netstat")
        .arg("-tunap")
        .output()
        .await?;
    if !output.status.success() {
        return Err(AgentError::Io(std::io::Error::other("netstat failed")));
    }
    Ok(parse_netstat_output(
        pid,
        &String::from_utf8_lossy(&output.stdout),
    ))
}

#[cfg(target_os = "macos")]
async fn lsof_ports(pid: i32) -> Result<Vec<PortInfo>> {
    let output = tokio::process::Command::new("lsof")
        .args(["-iTCP", "-iUDP", "-n", "-P", "-a", "-p", &pid.to_string()])
        .output()
        .await?;
    // lsof exits 1 when no matching files exist; not an error here.
    if !output.status.success() && output.stdout.is_empty() {
        return Ok(Vec::new());
    }
    Ok(parse_lsof_output(
        pid,
        &String::from_utf8_lossy(&output.stdout),
    ))
}

/// Split `addr:port`, tolerating IPv6 brackets; `*` maps to `0.0.0.0`.
fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (addr, port) = s.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let addr = addr.trim_start_matches('[').trim_end_matches(']');
    let addr = if addr == "*" { "0.0.0.0" } else { addr };
    Some((addr.to_string(), port))
}

/// Parse `ss -tunap` output, keeping lines owned by `pid`.
fn parse_ss_output(pid: i32, output: &str) -> Vec<PortInfo> {
    let marker = format!("pid={},", pid);
    let mut ports = Vec::new();

    for line in output.lines() {
        if !line.contains(&marker) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }

        let protocol = fields[0].to_lowercase();
        let state = fields[1].to_string();
        let Some((local_addr, local_port)) = split_host_port(fields[4]) else {
            continue;
        };
        let (remote_addr, remote_port) = fields
            .get(5)
            .and_then(|s| split_host_port(s))
            .unwrap_or_default();

        // Process name sits inside users:(("name",pid=N,fd=M)).
        let process_name = fields
            .iter()
            .find(|f| f.contains('"'))
            .and_then(|f| f.split('"').nth(1))
            .unwrap_or_default()
            .to_string();

        ports.push(PortInfo {
            pid,
            protocol,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            process_name,
        });
    }
    ports
}

/// Parse `netstat -tunap` output, keeping lines owned by `pid`.
fn parse_netstat_output(pid: i32, output: &str) -> Vec<PortInfo> {
    let marker = format!("{}/", pid);
    let mut ports = Vec::new();

    for line in output.lines().skip(2) {
        if !line.contains(&marker) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }

        let protocol = fields[0].to_lowercase();
        let Some((local_addr, local_port)) = split_host_port(fields[3]) else {
            continue;
        };
        let (remote_addr, remote_port) =
            split_host_port(fields[4]).unwrap_or_default();
        let state = fields[5].to_string();
        let process_name = fields[6].split('/').nth(1).unwrap_or_default().to_string();

        ports.push(PortInfo {
            pid,
            protocol,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            process_name,
        });
    }
    ports
}

/// Parse `lsof -iTCP -iUDP -n -P` output (macOS).
fn parse_lsof_output(pid: i32, output: &str) -> Vec<PortInfo> {
    let mut ports = Vec::new();

    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }

        let protocol = match fields[7] {
            "TCP" => "tcp",
            "UDP" => "udp",
            _ => continue,
        }
        .to_string();

        let state = if line.contains("(LISTEN)") {
            "LISTEN"
        } else if line.contains("(ESTABLISHED)") {
            "ESTABLISHED"
        } else if line.contains("(CLOSE_WAIT)") {
            "CLOSE_WAIT"
        } else {
            ""
        }
        .to_string();

        let name_field = fields[8];
        let (local, remote) = match name_field.split_once("->") {
            Some((l, r)) => (l, Some(r)),
            None => (name_field, None),
        };
        let Some((local_addr, local_port)) = split_host_port(local) else {
            continue;
        };
        let (remote_addr, remote_port) = remote
            .and_then(split_host_port)
            .unwrap_or_default();

        ports.push(PortInfo {
            pid,
            protocol,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            process_name: fields[0].to_string(),
        });
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_FIXTURE: &str = "\
Netid State  Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
tcp   LISTEN 0      511          0.0.0.0:3000       0.0.0.0:*    users:((\"node\",pid=1234,fd=23))
tcp   LISTEN 0      511                *:8080             *:*    users:((\"node\",pid=1234,fd=24))
tcp   ESTAB  0      0          127.0.0.1:3000     127.0.0.1:52410 users:((\"node\",pid=1234,fd=25))
tcp   LISTEN 0      511          0.0.0.0:9999       0.0.0.0:*    users:((\"other\",pid=12345,fd=3))
garbage line that should be skipped pid=1234,
udp   UNCONN 0      0            0.0.0.0:5353       0.0.0.0:*    users:((\"node\",pid=1234,fd=26))
";

    #[test]
    fn ss_parser_extracts_ports_for_exact_pid() {
        let ports = parse_ss_output(1234, SS_FIXTURE);
        assert_eq!(ports.len(), 4);

        let listener = &ports[0];
        assert_eq!(listener.protocol, "tcp");
        assert_eq!(listener.state, "LISTEN");
        assert_eq!(listener.local_addr, "0.0.0.0");
        assert_eq!(listener.local_port, 3000);
        assert_eq!(listener.process_name, "node");

        // `*` normalizes to 0.0.0.0.
        assert_eq!(ports[1].local_addr, "0.0.0.0");
        assert_eq!(ports[1].local_port, 8080);

        // pid=12345 does not match pid=1234.
        assert!(!ports.iter().any(|p| p.local_port == 9999));

        let udp = ports.iter().find(|p| p.protocol == "udp").unwrap();
        assert_eq!(udp.local_port, 5353);
    }

    #[test]
    fn ss_parser_handles_ipv6_brackets() {
        let out = "tcp LISTEN 0 511 [::]:8443 [::]:* users:((\"svc\",pid=7,fd=5))\n";
        let ports = parse_ss_output(7, out);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].local_addr, "::");
        assert_eq!(ports[0].local_port, 8443);
    }

    const NETSTAT_FIXTURE: &str = "\
Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address    Foreign Address  State   PID/Program name
tcp        0      0 0.0.0.0:8000     0.0.0.0:*        LISTEN  4321/python3
tcp        0      0 127.0.0.1:8000   127.0.0.1:33000  ESTABLISHED 4321/python3
tcp        0      0 0.0.0.0:22       0.0.0.0:*        LISTEN  1/sshd
";

    #[test]
    fn netstat_parser_extracts_ports_for_pid() {
        let ports = parse_netstat_output(4321, NETSTAT_FIXTURE);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].local_port, 8000);
        assert_eq!(ports[0].state, "LISTEN");
        assert_eq!(ports[0].process_name, "python3");
        assert_eq!(ports[1].remote_port, 33000);
    }

    const LSOF_FIXTURE: &str = "\
COMMAND   PID USER   FD   TYPE             DEVICE SIZE/OFF NODE NAME
node    12345 user   23u  IPv4 0xabcdef12345678      0t0  TCP *:8000 (LISTEN)
node    12345 user   24u  IPv4 0xabcdef12345679      0t0  TCP 127.0.0.1:8000->127.0.0.1:54321 (ESTABLISHED)
node    12345 user   25u  IPv4 0xabcdef1234567a      0t0  UDP *:5353
";

    #[test]
    fn lsof_parser_handles_listeners_and_connections() {
        let ports = parse_lsof_output(12345, LSOF_FIXTURE);
        assert_eq!(ports.len(), 3);

        assert_eq!(ports[0].local_addr, "0.0.0.0");
        assert_eq!(ports[0].local_port, 8000);
        assert_eq!(ports[0].state, "LISTEN");
        assert_eq!(ports[0].process_name, "node");

        assert_eq!(ports[1].remote_addr, "127.0.0.1");
        assert_eq!(ports[1].remote_port, 54321);
        assert_eq!(ports[1].state, "ESTABLISHED");

        assert_eq!(ports[2].protocol, "udp");
        assert_eq!(ports[2].state, "");
    }

    #[tokio::test]
    async fn unregister_clears_monitoring_state() {
        let scanner = Arc::new(PortScanner::new());
        let seen = Arc::new(Mutex::new(Vec::<u16>::new()));
        let seen_cb = Arc::clone(&seen);
        scanner.register_callback(
            424242,
            Arc::new(move |_pid, port| {
                seen_cb.lock().unwrap().push(port.local_port);
            }),
        );
        assert_eq!(scanner.monitored_pids(), vec![424242]);

        scanner.unregister(424242);
        assert!(scanner.monitored_pids().is_empty());
    }
}
