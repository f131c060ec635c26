//! `atlas`: command-line entrypoint for the signal pipeline.
//!
//! Each subcommand is a short-lived process that opens the store, does one job and
//! exits; `serve` and `run --loop` are the long-running ones.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signal_atlas::{
    backup, config::ENV_CONFIG_PATH, dashboard, doctor, ingest, launchd, scheduler, score, status,
    supervisor::Supervisor, AtlasConfig, AtlasError, Store, DEFAULT_LOG_FILTER,
};

#[derive(Parser)]
#[command(name = "atlas", version, about = "Signal monitoring pipeline")]
struct Cli {
    /// Config file (TOML). Defaults to config/atlas.toml when present.
    #[arg(long, global = true, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Bring the store schema up to date.
    Migrate,
    /// Print counts, top sources and recent rows.
    Status {
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value_t = 20)]
        recent: usize,
        #[arg(long)]
        json: bool,
    },
    /// Fetch all feeds once.
    Fetch,
    /// Score unscored rows once.
    Score,
    /// Fetch then score.
    Run {
        /// Repeat every `scheduler.interval_secs` until interrupted.
        #[arg(long = "loop")]
        repeat: bool,
    },
    /// Serve the dashboard in the foreground.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start or stop the background dashboard.
    Dashboard {
        #[command(subcommand)]
        action: DashboardAction,
    },
    /// Migrate and write launchd agents for the fetch and score jobs.
    Install {
        /// Also (re)load the agents with launchctl.
        #[arg(long)]
        load: bool,
    },
    /// Write a health report; exits 2 when a check fails.
    Doctor,
    /// Archive the project tree with a consistent store snapshot.
    Backup {
        #[arg(long, default_value = "backups")]
        dest: PathBuf,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[derive(Subcommand)]
enum DashboardAction {
    Start {
        #[arg(long)]
        port: Option<u16>,
    },
    Stop {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("ATLAS_LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> signal_atlas::Result<AtlasConfig> {
    match path {
        Some(p) if p.exists() => AtlasConfig::load_from(p),
        Some(p) => Err(AtlasError::Config(format!("config file {} not found", p.display()))),
        None => AtlasConfig::load_default(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "atlas failed");
            eprintln!("error: {e:#}");
            if let Some(AtlasError::ProcessLivenessFailure { output, .. }) = e.downcast_ref::<AtlasError>() {
                if !output.is_empty() {
                    eprintln!("--- process output ---\n{output}");
                }
            }
            let code = e
                .downcast_ref::<AtlasError>()
                .map_or(1, AtlasError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Cmd::Migrate => {
            let (store, report) = Store::open_with(
                &cfg.store.path,
                Duration::from_millis(cfg.store.busy_timeout_ms),
            )?;
            if report.is_noop() {
                println!("schema up to date ({})", store.path().display());
            }
            for m in &report.applied {
                println!("applied {:>3} {}", m.version, m.name);
            }
            for ix in &report.indexes {
                println!("index {}: {}", ix.name, ix.sql.as_deref().unwrap_or("(implicit)"));
            }
        }
        Cmd::Status { top, recent, json } => {
            let r = status::report(&cfg.store.path, top, recent)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                print!("{r}");
            }
        }
        Cmd::Fetch => {
            let r = ingest::run_stage(&cfg).await?;
            println!("{}", serde_json::to_string(&r)?);
        }
        Cmd::Score => {
            let r = score::run_stage(&cfg)?;
            println!("{}", serde_json::to_string(&r)?);
        }
        Cmd::Run { repeat: false } => {
            let outcome = scheduler::run_pipeline_once(&cfg).await;
            println!("{}", serde_json::to_string(&outcome)?);
            if !outcome.ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Cmd::Run { repeat: true } => {
            let handle = scheduler::spawn_scheduler(cfg.clone());
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            handle.abort();
            tracing::info!(target: "scheduler", "scheduler stopped");
        }
        Cmd::Serve { port } => {
            dashboard::serve(&cfg, port.unwrap_or(cfg.dashboard.port)).await?;
        }
        Cmd::Dashboard { action } => match action {
            DashboardAction::Start { port } => {
                let port = port.unwrap_or(cfg.dashboard.port);
                let sup = Supervisor::from_config(&cfg, port);
                let pid = sup.start().await?;
                println!(
                    "dashboard pid {pid} on http://{}:{port} (log {})",
                    cfg.dashboard.bind,
                    sup.log_file().display()
                );
            }
            DashboardAction::Stop { port } => {
                let port = port.unwrap_or(cfg.dashboard.port);
                let stopped = Supervisor::from_config(&cfg, port).stop().await?;
                if stopped.is_empty() {
                    println!("nothing listening on port {port}");
                } else {
                    println!("stopped {stopped:?}");
                }
            }
        },
        Cmd::Install { load } => {
            Store::open_with(&cfg.store.path, Duration::from_millis(cfg.store.busy_timeout_ms))?;
            let program = std::env::current_exe().context("locating atlas binary")?;
            let cwd = std::env::current_dir().context("reading working dir")?;
            for job in launchd::install(&cfg, &program, &cwd, load).await? {
                println!("{} -> {} ({:?})", job.label, job.plist.display(), job.outcome);
            }
        }
        Cmd::Doctor => {
            let report = doctor::collect(&cfg).await?;
            let path = doctor::write_report(&cfg, &report)?;
            println!("{}", path.display());
            if report.failed() {
                return Ok(ExitCode::from(2));
            }
        }
        Cmd::Backup { dest, root } => {
            let out = backup::run_backup(&root, &cfg.store.path, &dest, &backup::ZipCli).await?;
            println!("{}  {}", out.sha256, out.archive.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
