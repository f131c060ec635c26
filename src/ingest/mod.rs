// src/ingest/mod.rs
//! Fetch stage: pull feeds, normalize entries, append to the store through the
//! dedup insert.

pub mod providers;
pub mod sources;
pub mod types;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};
use crate::ingest::providers::rss::RssProvider;
use crate::ingest::types::{FeedEntry, SourceProvider};
use crate::store::{InsertOutcome, Store};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("atlas_ingest_entries_total", "Entries parsed from feeds.");
        describe_counter!("atlas_ingest_inserted_total", "New rows written to the store.");
        describe_counter!(
            "atlas_ingest_duplicates_total",
            "Entries skipped because (source, url) was already stored."
        );
        describe_counter!("atlas_ingest_source_errors_total", "Feed fetch/parse errors.");
        describe_histogram!("atlas_ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("atlas_ingest_last_run_ts", "Unix ts when the fetch stage last ran.");
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/// Entries gathered from all providers in one pass.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub entries: Vec<FeedEntry>,
    pub failed_sources: Vec<String>,
    pub attempted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_sources: Vec<String>,
}

/// Fetch every provider in order. A failing provider is logged and skipped.
pub async fn fetch_all(providers: &[Box<dyn SourceProvider>]) -> FetchBatch {
    ensure_metrics_described();

    let mut batch = FetchBatch {
        attempted: providers.len(),
        ..FetchBatch::default()
    };
    for p in providers {
        match p.fetch_latest().await {
            Ok(mut v) => batch.entries.append(&mut v),
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, provider = p.name(), "source failed");
                counter!("atlas_ingest_source_errors_total").increment(1);
                batch.failed_sources.push(p.name().to_string());
            }
        }
    }
    batch
}

/// Write a batch through the dedup insert.
pub fn store_batch(store: &Store, batch: FetchBatch) -> Result<IngestReport> {
    let fetched_at = chrono::Utc::now().to_rfc3339();
    let mut report = IngestReport {
        failed_sources: batch.failed_sources,
        ..IngestReport::default()
    };
    for entry in batch.entries {
        match store.insert_signal(&entry.into_signal(&fetched_at))? {
            InsertOutcome::Inserted(_) => report.inserted += 1,
            InsertOutcome::Duplicate => report.duplicates += 1,
        }
    }

    counter!("atlas_ingest_inserted_total").increment(report.inserted as u64);
    counter!("atlas_ingest_duplicates_total").increment(report.duplicates as u64);
    gauge!("atlas_ingest_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
    Ok(report)
}

fn ensure_some_source_ok(batch: &FetchBatch) -> Result<()> {
    if batch.attempted > 0 && batch.failed_sources.len() == batch.attempted {
        return Err(AtlasError::UpstreamFetchFailure {
            target: batch.failed_sources.join(", "),
            reason: "every source failed".into(),
        });
    }
    Ok(())
}

fn log_report(report: &IngestReport) {
    tracing::info!(
        target: "ingest",
        inserted = report.inserted,
        duplicates = report.duplicates,
        failed = report.failed_sources.len(),
        "fetch stage done"
    );
}

/// Fetch then store. Fails only when there were sources and every one of them failed.
pub async fn run_once(store: &Store, providers: &[Box<dyn SourceProvider>]) -> Result<IngestReport> {
    let batch = fetch_all(providers).await;
    ensure_some_source_ok(&batch)?;
    let report = store_batch(store, batch)?;
    log_report(&report);
    Ok(report)
}

/// The scheduled fetch job: sources file → HTTP providers → store.
pub async fn run_stage(cfg: &AtlasConfig) -> Result<IngestReport> {
    let urls = sources::load_sources(&cfg.ingest.sources_path)
        .map_err(|e| AtlasError::Config(format!("{e:#}")))?;
    if urls.is_empty() {
        return Err(AtlasError::Config(format!(
            "no sources in {}",
            cfg.ingest.sources_path.display()
        )));
    }
    let mut providers: Vec<Box<dyn SourceProvider>> = Vec::with_capacity(urls.len());
    for u in urls {
        let p = RssProvider::from_url(u, &cfg.ingest)
            .map_err(|e| AtlasError::Config(format!("{e:#}")))?;
        providers.push(Box::new(p));
    }

    let batch = fetch_all(&providers).await;
    ensure_some_source_ok(&batch)?;

    // Opened after the network phase so the connection never lives across an await.
    let (store, _) = Store::open_with(
        &cfg.store.path,
        std::time::Duration::from_millis(cfg.store.busy_timeout_ms),
    )?;
    let report = store_batch(&store, batch)?;
    log_report(&report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_decodes_and_collapses() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b>!</p>  ";
        assert_eq!(normalize_text(s), "Hello, world !");
    }

    #[test]
    fn normalize_text_maps_typographic_quotes() {
        assert_eq!(normalize_text("\u{201C}hi\u{201D} it\u{2019}s"), "\"hi\" it's");
    }

    #[test]
    fn entry_maps_to_signal_with_fallbacks() {
        let e = FeedEntry {
            source: "https://feed.example/rss".into(),
            url: "https://feed.example/a".into(),
            title: "Title".into(),
            summary: String::new(),
            published: None,
            comments: Some("https://feed.example/a#c".into()),
        };
        let s = e.into_signal("2024-01-01T00:00:00+00:00");
        assert_eq!(s.text.as_deref(), Some("Title"));
        assert_eq!(s.ts.as_deref(), Some("2024-01-01T00:00:00+00:00"));
        assert!(s.raw.unwrap().contains("feed.example/a#c"));
    }
}
