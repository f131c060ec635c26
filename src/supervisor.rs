// src/supervisor.rs
//! Keeps at most one dashboard process per port.
//!
//! Portable baseline: a PID file plus a port-owner lookup through `lsof`. Signals go
//! through `kill`. Where launchd is available the pipeline jobs run under it instead
//! (see [`crate::launchd`]); the dashboard is still started here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};

const LOG_TAIL_LINES: usize = 200;

pub struct Supervisor {
    port: u16,
    host: String,
    pid_file: PathBuf,
    log_file: PathBuf,
    program: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    poll_interval: Duration,
    grace: Duration,
}

impl Supervisor {
    /// Supervises `<current exe> serve --port <port>`.
    pub fn from_config(cfg: &AtlasConfig, port: u16) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("atlas"));
        Self {
            port,
            host: cfg.dashboard.bind.clone(),
            pid_file: cfg.pid_file(port),
            log_file: cfg.dashboard_log(port),
            program,
            args: vec!["serve".into(), "--port".into(), port.to_string()],
            ready_timeout: Duration::from_secs(cfg.dashboard.ready_timeout_secs),
            poll_interval: Duration::from_millis(500),
            grace: Duration::from_secs(cfg.dashboard.stop_grace_secs),
        }
    }

    pub fn with_command(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn with_ready_timeout(mut self, t: Duration) -> Self {
        self.ready_timeout = t;
        self
    }

    pub fn with_poll_interval(mut self, t: Duration) -> Self {
        self.poll_interval = t;
        self
    }

    pub fn with_grace(mut self, t: Duration) -> Self {
        self.grace = t;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Terminate whatever holds the port (PID file first, then `lsof`), remove the
    /// PID file. Returns the PIDs that were signalled.
    pub async fn stop(&self) -> Result<Vec<i32>> {
        let mut pids: Vec<i32> = read_pid_file(&self.pid_file).into_iter().collect();
        for p in port_owners(self.port).await {
            if !pids.contains(&p) {
                pids.push(p);
            }
        }
        let me = std::process::id() as i32;
        pids.retain(|&p| p > 1 && p != me);

        let mut signalled = Vec::new();
        for pid in pids {
            if !is_alive(pid).await {
                continue;
            }
            let forced = terminate(pid, self.grace).await;
            tracing::info!(target: "supervisor", pid, port = self.port, forced, "stopped dashboard process");
            signalled.push(pid);
        }
        remove_pid_file(&self.pid_file).await;
        Ok(signalled)
    }

    /// Stop any previous instance, spawn a new one and wait until the port accepts
    /// connections. Returns the new PID.
    pub async fn start(&self) -> Result<u32> {
        self.stop().await?;

        if let Some(dir) = self.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let log = tokio::fs::File::create(&self.log_file).await?.into_std().await;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| self.liveness(format!("spawn {}: {e}", self.program.display())))?;
        let pid = child.id().unwrap_or_default();
        if let Some(dir) = self.pid_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.pid_file, format!("{pid}\n")).await?;
        tracing::info!(target: "supervisor", pid, port = self.port, log = %self.log_file.display(), "dashboard spawned");

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                remove_pid_file(&self.pid_file).await;
                return Err(self.liveness(format!("exited before ready ({status})")));
            }
            if port_accepts(&self.host, self.port).await {
                tracing::info!(target: "supervisor", pid, port = self.port, "dashboard ready");
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                // the child leads its own group; take any grandchildren with it
                kill_group(pid as i32).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
                remove_pid_file(&self.pid_file).await;
                return Err(self.liveness(format!(
                    "port not accepting connections after {}s",
                    self.ready_timeout.as_secs_f32()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn liveness(&self, reason: String) -> AtlasError {
        AtlasError::ProcessLivenessFailure {
            port: self.port,
            reason,
            output: tail_lines(&self.log_file, LOG_TAIL_LINES),
        }
    }
}

/// PID recorded in the file. Missing, unreadable or garbage content all read as
/// "no process".
pub fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|&p| p > 0)
}

async fn remove_pid_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(target: "supervisor", path = %path.display(), error = %e, "could not remove pid file");
        }
    }
}

/// PIDs listening on `port` per `lsof`. No `lsof` or no listener → empty.
pub async fn port_owners(port: u16) -> Vec<i32> {
    let out = Command::new("lsof")
        .arg(format!("-tiTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .stdin(Stdio::null())
        .output()
        .await;
    match out {
        Ok(o) => parse_pid_lines(&String::from_utf8_lossy(&o.stdout)),
        Err(e) => {
            tracing::debug!(target: "supervisor", error = %e, "lsof unavailable");
            Vec::new()
        }
    }
}

fn parse_pid_lines(s: &str) -> Vec<i32> {
    let mut out: Vec<i32> = s
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .filter(|&p: &i32| p > 0)
        .collect();
    out.dedup();
    out
}

async fn kill(signal: &str, pid: i32) -> bool {
    Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn kill_group(pgid: i32) {
    if pgid > 1 {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pgid}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

async fn is_alive(pid: i32) -> bool {
    kill("-0", pid).await
}

/// SIGTERM, wait up to `grace`, then SIGKILL. True when SIGKILL was needed.
async fn terminate(pid: i32, grace: Duration) -> bool {
    kill("-TERM", pid).await;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid).await {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if is_alive(pid).await {
        kill("-KILL", pid).await;
        return true;
    }
    false
}

pub async fn port_accepts(host: &str, port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect((host, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(500), connect).await,
        Ok(Ok(_))
    )
}

/// Last `n` lines of a text file; empty when unreadable.
pub fn tail_lines(path: &Path, n: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_pid_file_means_no_process() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join(".dashboard_1.pid");
        assert_eq!(read_pid_file(&p), None);
        std::fs::write(&p, "not-a-pid").unwrap();
        assert_eq!(read_pid_file(&p), None);
        std::fs::write(&p, "-4\n").unwrap();
        assert_eq!(read_pid_file(&p), None);
        std::fs::write(&p, " 4242 \n").unwrap();
        assert_eq!(read_pid_file(&p), Some(4242));
    }

    #[test]
    fn lsof_output_parsing() {
        assert_eq!(parse_pid_lines("123\n456\n\njunk\n"), vec![123, 456]);
        assert!(parse_pid_lines("").is_empty());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("log");
        let body: String = (1..=5).map(|i| format!("line{i}\n")).collect();
        std::fs::write(&p, body).unwrap();
        assert_eq!(tail_lines(&p, 2), "line4\nline5");
        assert_eq!(tail_lines(&dir.path().join("none"), 2), "");
    }
}
