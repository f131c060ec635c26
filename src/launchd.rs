// src/launchd.rs
//! launchd agents for the fetch and score jobs (macOS native supervision).
//!
//! Plists are written to the user's LaunchAgents dir. Job state is read back from
//! `launchctl print`; on hosts without `launchctl` the status is simply unknown.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use html_escape::encode_text as xml;
use serde::Serialize;
use tokio::process::Command;

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    Fetch,
    Score,
}

impl Job {
    pub const ALL: [Job; 2] = [Job::Fetch, Job::Score];

    pub fn name(self) -> &'static str {
        match self {
            Job::Fetch => "fetch",
            Job::Score => "score",
        }
    }

    pub fn label(self, prefix: &str) -> String {
        format!("{prefix}.{}", self.name())
    }

    pub fn stdout_log(self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(format!("{}.out.log", self.name()))
    }

    pub fn stderr_log(self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(format!("{}.err.log", self.name()))
    }
}

/// Everything a plist needs. Paths should be absolute; launchd does not expand `~`.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job: Job,
    pub label: String,
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub interval_secs: u64,
}

impl JobSpec {
    pub fn for_job(cfg: &AtlasConfig, job: Job, program: &Path, working_dir: &Path) -> Self {
        let logs_dir = if cfg.paths.logs_dir.is_absolute() {
            cfg.paths.logs_dir.clone()
        } else {
            working_dir.join(&cfg.paths.logs_dir)
        };
        Self {
            job,
            label: job.label(&cfg.launchd.label_prefix),
            program: program.to_path_buf(),
            working_dir: working_dir.to_path_buf(),
            logs_dir,
            interval_secs: cfg.scheduler.interval_secs,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.plist", self.label)
    }

    pub fn render(&self) -> String {
        let s = |p: &Path| xml(&p.to_string_lossy()).to_string();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{program}</string>
    <string>{job}</string>
  </array>
  <key>WorkingDirectory</key>
  <string>{wd}</string>
  <key>StartInterval</key>
  <integer>{interval}</integer>
  <key>RunAtLoad</key>
  <true/>
  <key>StandardOutPath</key>
  <string>{out}</string>
  <key>StandardErrorPath</key>
  <string>{err}</string>
</dict>
</plist>
"#,
            label = xml(&self.label),
            program = s(&self.program),
            job = self.job.name(),
            wd = s(&self.working_dir),
            interval = self.interval_secs,
            out = s(&self.job.stdout_log(&self.logs_dir)),
            err = s(&self.job.stderr_log(&self.logs_dir)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Unchanged,
    /// Existing file differed; it was moved to the contained path first.
    Replaced { backup: PathBuf },
}

/// Write `contents` to `path`, keeping a timestamped copy of a differing file.
pub fn write_with_backup(path: &Path, contents: &str) -> Result<WriteOutcome> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let outcome = match std::fs::read_to_string(path) {
        Ok(existing) if existing == contents => return Ok(WriteOutcome::Unchanged),
        Ok(_) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let backup = path.with_file_name(format!(
                "{name}.bak.{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            std::fs::rename(path, &backup)?;
            WriteOutcome::Replaced { backup }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => WriteOutcome::Created,
        Err(e) => return Err(e.into()),
    };
    std::fs::write(path, contents)?;
    Ok(outcome)
}

pub fn agents_dir(cfg: &AtlasConfig) -> Result<PathBuf> {
    if let Some(d) = &cfg.launchd.agents_dir {
        return Ok(d.clone());
    }
    let home = std::env::var_os("HOME")
        .ok_or_else(|| AtlasError::Config("HOME is not set; set launchd.agents_dir".into()))?;
    Ok(PathBuf::from(home).join("Library").join("LaunchAgents"))
}

#[derive(Debug, Clone)]
pub struct InstalledJob {
    pub label: String,
    pub plist: PathBuf,
    pub outcome: WriteOutcome,
}

/// Write both plists and, when `load` is set, (re)load them with `launchctl`.
pub async fn install(
    cfg: &AtlasConfig,
    program: &Path,
    working_dir: &Path,
    load: bool,
) -> Result<Vec<InstalledJob>> {
    let dir = agents_dir(cfg)?;
    let mut out = Vec::new();
    for job in Job::ALL {
        let spec = JobSpec::for_job(cfg, job, program, working_dir);
        std::fs::create_dir_all(&spec.logs_dir)?;
        let plist = dir.join(spec.file_name());
        let outcome = write_with_backup(&plist, &spec.render())?;
        tracing::info!(target: "launchd", label = %spec.label, plist = %plist.display(), ?outcome, "plist written");

        if load {
            let plist_str = plist.to_string_lossy().to_string();
            // unload may fail when the job was never loaded
            let _ = launchctl(&["unload", plist_str.as_str()]).await;
            match launchctl(&["load", "-w", plist_str.as_str()]).await {
                Some(o) if o.status.success() => {
                    tracing::info!(target: "launchd", label = %spec.label, "job loaded")
                }
                Some(o) => tracing::warn!(
                    target: "launchd",
                    label = %spec.label,
                    stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                    "launchctl load failed"
                ),
                None => tracing::warn!(target: "launchd", "launchctl not available; plists written only"),
            }
        }
        out.push(InstalledJob {
            label: spec.label,
            plist,
            outcome,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub label: String,
    /// False when launchctl is missing or does not know the job.
    pub known: bool,
    pub runs: Option<u64>,
    pub last_exit_code: Option<i64>,
}

/// Pull `runs = N` and `last exit code = N` out of `launchctl print` output.
pub fn parse_print_output(label: &str, s: &str) -> JobStatus {
    let mut st = JobStatus {
        label: label.to_string(),
        known: true,
        ..JobStatus::default()
    };
    for line in s.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "runs" => st.runs = value.parse().ok(),
            "last exit code" => {
                st.last_exit_code = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.trim_end_matches(':').parse().ok())
            }
            _ => {}
        }
    }
    st
}

pub async fn job_status(label: &str) -> JobStatus {
    let target = format!("gui/{}/{label}", current_uid().await.unwrap_or_default());
    match launchctl(&["print", target.as_str()]).await {
        Some(o) if o.status.success() => parse_print_output(label, &String::from_utf8_lossy(&o.stdout)),
        _ => JobStatus {
            label: label.to_string(),
            ..JobStatus::default()
        },
    }
}

async fn launchctl(args: &[&str]) -> Option<std::process::Output> {
    Command::new("launchctl")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()
}

async fn current_uid() -> Option<u32> {
    let o = Command::new("id").arg("-u").output().await.ok()?;
    String::from_utf8_lossy(&o.stdout).trim().parse().ok()
}
