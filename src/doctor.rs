// src/doctor.rs
//! One-shot health check rendered as a Markdown report.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};
use crate::launchd::{self, Job, JobStatus};
use crate::status::{self, StatusReport};
use crate::store::Store;
use crate::supervisor;

const LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub path: PathBuf,
    pub lines: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub generated_at: String,
    pub db_path: PathBuf,
    pub port: u16,
    pub checks: Vec<Check>,
    pub jobs: Vec<JobStatus>,
    pub logs: Vec<LogTail>,
    pub status: StatusReport,
}

impl DoctorReport {
    pub fn failed(&self) -> bool {
        self.checks.iter().any(|c| !c.ok)
    }
}

/// Store checks: file exists, integrity, no duplicate `(source, url)` pairs.
pub fn store_checks(db_path: &Path) -> (Vec<Check>, StatusReport) {
    let mut checks = Vec::new();
    if !db_path.exists() {
        checks.push(Check::new("store exists", false, format!("{} not found", db_path.display())));
        return (checks, StatusReport::default());
    }
    checks.push(Check::new("store exists", true, db_path.display().to_string()));

    let store = match Store::open_read_only(db_path) {
        Ok(Some(s)) => s,
        Ok(None) => return (checks, StatusReport::default()),
        Err(e) => {
            checks.push(Check::new("store opens", false, e.to_string()));
            return (checks, StatusReport::default());
        }
    };

    match store.integrity_check() {
        Ok(r) => checks.push(Check::new("integrity_check", r.trim() == "ok", r)),
        Err(e) => checks.push(Check::new("integrity_check", false, e.to_string())),
    }

    let status = match status::report_from(&store, 10, 10) {
        Ok(s) => s,
        Err(e) => {
            checks.push(Check::new("status queries", false, e.to_string()));
            return (checks, StatusReport::default());
        }
    };
    checks.push(Check::new(
        "no duplicate (source, url)",
        status.duplicate_pairs == 0,
        format!("{} duplicate pairs", status.duplicate_pairs),
    ));
    (checks, status)
}

pub async fn collect(cfg: &AtlasConfig) -> Result<DoctorReport> {
    let db = cfg.store.path.clone();
    let (mut checks, status) = tokio::task::spawn_blocking(move || store_checks(&db))
        .await
        .map_err(|e| AtlasError::Io(std::io::Error::other(e)))?;

    let port = cfg.dashboard.port;
    let listening = supervisor::port_accepts(&cfg.dashboard.bind, port).await;
    checks.push(Check::new(
        "dashboard listening",
        listening,
        format!("{}:{port}", cfg.dashboard.bind),
    ));

    let mut jobs = Vec::new();
    let mut logs = Vec::new();
    for job in Job::ALL {
        jobs.push(launchd::job_status(&job.label(&cfg.launchd.label_prefix)).await);
        for path in [job.stdout_log(&cfg.paths.logs_dir), job.stderr_log(&cfg.paths.logs_dir)] {
            logs.push(LogTail {
                lines: supervisor::tail_lines(&path, LOG_TAIL_LINES),
                path,
            });
        }
    }

    Ok(DoctorReport {
        generated_at: Utc::now().to_rfc3339(),
        db_path: cfg.store.path.clone(),
        port,
        checks,
        jobs,
        logs,
        status,
    })
}

pub fn render_markdown(r: &DoctorReport) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# atlas doctor\n");
    let _ = writeln!(md, "## Environment\n");
    let _ = writeln!(md, "- generated: {}", r.generated_at);
    let _ = writeln!(md, "- version: {}", env!("CARGO_PKG_VERSION"));
    if let Ok(cwd) = std::env::current_dir() {
        let _ = writeln!(md, "- cwd: {}", cwd.display());
    }
    let _ = writeln!(md, "- store: {}", r.db_path.display());
    let _ = writeln!(md, "- dashboard port: {}\n", r.port);

    let _ = writeln!(md, "## Checks\n");
    for c in &r.checks {
        let mark = if c.ok { "PASS" } else { "FAIL" };
        let _ = writeln!(md, "- [{mark}] {}: {}", c.name, c.detail);
    }

    let _ = writeln!(md, "\n## Jobs\n");
    for j in &r.jobs {
        if !j.known {
            let _ = writeln!(md, "- {}: unknown", j.label);
            continue;
        }
        let runs = j.runs.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
        let code = j
            .last_exit_code
            .map(|n| n.to_string())
            .unwrap_or_else(|| "never exited".into());
        let _ = writeln!(md, "- {}: runs={runs} last_exit_code={code}", j.label);
    }

    let _ = writeln!(md, "\n## Logs\n");
    for l in &r.logs {
        let _ = writeln!(md, "### {}\n", l.path.display());
        if l.lines.is_empty() {
            let _ = writeln!(md, "(empty or missing)\n");
        } else {
            let _ = writeln!(md, "```\n{}\n```\n", l.lines);
        }
    }

    let _ = writeln!(md, "## Status\n");
    let _ = writeln!(md, "```\n{}```", r.status);
    md
}

/// Write the report to `<logs>/doctor_report_<ts>.md` and return its path.
pub fn write_report(cfg: &AtlasConfig, r: &DoctorReport) -> Result<PathBuf> {
    std::fs::create_dir_all(&cfg.paths.logs_dir)?;
    let path = cfg.paths.logs_dir.join(format!(
        "doctor_report_{}.md",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    std::fs::write(&path, render_markdown(r))?;
    tracing::info!(target: "doctor", path = %path.display(), failed = r.failed(), "doctor report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_store_fails_exists_check() {
        let dir = tempfile::tempdir().unwrap();
        let (checks, status) = store_checks(&dir.path().join("none.db"));
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].ok);
        assert_eq!(status.total, 0);
    }

    #[test]
    fn healthy_store_passes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("atlas.db");
        Store::open(&db).unwrap();
        let (checks, _) = store_checks(&db);
        assert!(checks.iter().all(|c| c.ok), "{checks:?}");
    }

    #[test]
    fn markdown_marks_failures_and_unknown_jobs() {
        let r = DoctorReport {
            generated_at: "now".into(),
            db_path: PathBuf::from("data/atlas.db"),
            port: 8504,
            checks: vec![Check::new("dashboard listening", false, "127.0.0.1:8504")],
            jobs: vec![JobStatus {
                label: "com.atlas.fetch".into(),
                ..JobStatus::default()
            }],
            logs: vec![],
            status: StatusReport::default(),
        };
        assert!(r.failed());
        let md = render_markdown(&r);
        assert!(md.contains("[FAIL] dashboard listening"));
        assert!(md.contains("com.atlas.fetch: unknown"));
        assert!(md.contains("signals total: 0"));
    }
}
