// src/score/mod.rs
//! Score stage: keyword classification blended with a domain prior, written back
//! onto rows whose rationale is still empty.

pub mod domains;

use chrono::{SecondsFormat, Utc};
use metrics::counter;
use serde::Serialize;
use std::time::Duration;

use crate::config::AtlasConfig;
use crate::error::Result;
use crate::store::{ColorToken, ScoreUpdate, Signal, Store};
use domains::DomainWeights;

const KEYWORDS_RISK: &[&str] = &[
    "ban", "banned", "regulation", "regulator", "sec", "fine", "lawsuit", "court", "sanction",
    "breach", "leak", "hack", "ransom", "exploit", "vulnerability", "cve", "critical",
    "surveillance", "blocked", "shutdown", "arrest", "fraud", "scam", "malware",
];
const KEYWORDS_PROGRESS: &[&str] = &[
    "release", "launched", "introducing", "announcing", "open source", "benchmark", "paper",
    "improves", "performance", "funding", "partnership", "integration", "upgrade", "stable",
    "tool", "sdk", "api", "security fix", "patch", "mitigation",
];
const KEYWORDS_WATCH: &[&str] = &[
    "rumor", "report", "preview", "beta", "maybe", "analysis", "opinion", "thoughts",
    "discussion",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub score: f32,
    pub color: ColorToken,
    pub label: &'static str,
}

/// Keyword verdict on lowercased text. Matching is by substring, so "api"
/// also hits "capital"; the keyword lists are tuned with that in mind.
///
/// No hit at all is ⚫ neutral. Rows scored by earlier pipeline versions may carry
/// 🟡 (`YELLOW`) with label "neutral" for the same case.
pub fn classify(text: &str) -> Classification {
    let t = text.to_lowercase();
    let hit = |keys: &[&str]| keys.iter().any(|k| t.contains(k));

    let risk = hit(KEYWORDS_RISK);
    let progress = hit(KEYWORDS_PROGRESS);

    let (score, color, label) = match (risk, progress) {
        (true, false) => (0.72, ColorToken::HighRisk, "risk/pressure"),
        (false, true) => (0.66, ColorToken::Progress, "progress"),
        (true, true) => (0.60, ColorToken::Watch, "mixed"),
        (false, false) if hit(KEYWORDS_WATCH) => (0.52, ColorToken::Watch, "watch"),
        (false, false) => (0.48, ColorToken::Neutral, "neutral"),
    };
    Classification { score, color, label }
}

pub struct Scorer {
    domains: DomainWeights,
}

impl Scorer {
    pub fn new(domains: DomainWeights) -> Self {
        Self { domains }
    }

    pub fn from_config(cfg: &AtlasConfig) -> Self {
        Self::new(DomainWeights::with_overrides(&cfg.score.domains))
    }

    /// Score one row. `now` ends up in the rationale.
    pub fn score(&self, s: &Signal, now: &str) -> ScoreUpdate {
        let blob = [&s.title, &s.text, &s.summary]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let c = classify(&blob);
        let prior = self.domains.weight_for_url(s.url.as_deref().unwrap_or_default());
        let score = (0.5 * prior + 0.5 * c.score).clamp(0.0, 1.0);
        let source = s.source.as_deref().unwrap_or_default();
        ScoreUpdate {
            id: s.id,
            score: f64::from(score),
            color: c.color,
            label: c.label.to_string(),
            rationale: format!("{}; score={score:.2}; source={source}; t={now}", c.label),
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(DomainWeights::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    pub updated: usize,
}

/// Score up to `limit` unscored rows in place.
pub fn score_pending(store: &mut Store, scorer: &Scorer, limit: usize) -> Result<ScoreReport> {
    let rows = store.unscored(limit)?;
    if rows.is_empty() {
        tracing::info!(target: "score", "none to score");
        return Ok(ScoreReport::default());
    }
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let updates: Vec<ScoreUpdate> = rows.iter().map(|r| scorer.score(r, &now)).collect();
    let updated = store.apply_scores(&updates)?;

    counter!("atlas_score_updated_total").increment(updated as u64);
    tracing::info!(target: "score", updated, "score stage done");
    Ok(ScoreReport { updated })
}

/// The scheduled score job.
pub fn run_stage(cfg: &AtlasConfig) -> Result<ScoreReport> {
    let (mut store, _) = Store::open_with(
        &cfg.store.path,
        Duration::from_millis(cfg.store.busy_timeout_ms),
    )?;
    score_pending(&mut store, &Scorer::from_config(cfg), cfg.score.batch_limit)
}
