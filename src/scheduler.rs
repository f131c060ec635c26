// src/scheduler.rs
//! In-process scheduler: fetch, then score, on a fixed interval.
//! Used by `atlas run --loop` where launchd is not available.

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::ingest::{self, IngestReport};
use crate::score::{self, ScoreReport};

/// What one tick did. A failed stage leaves its field `None` and its message in
/// `errors`.
#[derive(Debug, Default, Serialize)]
pub struct PipelineOutcome {
    pub fetch: Option<IngestReport>,
    pub score: Option<ScoreReport>,
    pub errors: Vec<String>,
}

impl PipelineOutcome {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fetch then score once. Stage failures are logged, never propagated; the score
/// stage runs even when fetch failed.
pub async fn run_pipeline_once(cfg: &AtlasConfig) -> PipelineOutcome {
    let mut out = PipelineOutcome::default();

    match ingest::run_stage(cfg).await {
        Ok(r) => out.fetch = Some(r),
        Err(e) => {
            tracing::warn!(target: "ingest", error = %e, "fetch stage failed");
            out.errors.push(format!("fetch: {e}"));
        }
    }

    let score_cfg = cfg.clone();
    let scored = tokio::task::spawn_blocking(move || score::run_stage(&score_cfg))
        .await
        .map_err(|e| AtlasError::Io(std::io::Error::other(e)))
        .and_then(|r| r);
    match scored {
        Ok(r) => out.score = Some(r),
        Err(e) => {
            tracing::warn!(target: "score", error = %e, "score stage failed");
            out.errors.push(format!("score: {e}"));
        }
    }

    counter!("atlas_pipeline_runs_total").increment(1);
    gauge!("atlas_pipeline_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
    out
}

/// Run the pipeline every `scheduler.interval_secs`, first tick immediately.
pub fn spawn_scheduler(cfg: AtlasConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(cfg.scheduler.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = run_pipeline_once(&cfg).await;
            tracing::info!(
                target: "scheduler",
                ok = outcome.ok(),
                inserted = outcome.fetch.as_ref().map_or(0, |r| r.inserted),
                scored = outcome.score.as_ref().map_or(0, |r| r.updated),
                next_in_secs = period.as_secs(),
                "pipeline tick"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewSignal, Store};

    #[tokio::test]
    async fn failed_fetch_still_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AtlasConfig::default();
        cfg.store.path = dir.path().join("atlas.db");
        cfg.ingest.sources_path = dir.path().join("no_sources.txt");
        {
            let (store, _) = Store::open(&cfg.store.path).unwrap();
            store
                .insert_signal(&NewSignal::new("feedX", "https://x.example/1").with_title("Outage hits region"))
                .unwrap();
        }

        let out = run_pipeline_once(&cfg).await;
        assert!(!out.ok());
        assert!(out.fetch.is_none());
        assert!(out.errors[0].starts_with("fetch:"), "{:?}", out.errors);
        assert_eq!(out.score.map(|r| r.updated), Some(1));
    }

    #[tokio::test]
    async fn scheduler_ticks_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AtlasConfig::default();
        cfg.store.path = dir.path().join("atlas.db");
        cfg.ingest.sources_path = dir.path().join("no_sources.txt");
        cfg.scheduler.interval_secs = 3600;

        let handle = spawn_scheduler(cfg.clone());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !cfg.store.path.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        handle.abort();
        assert!(cfg.store.path.exists(), "first tick ran the score stage");
    }
}
