// src/status.rs
//! Read-only aggregates over the store for health checks and reports.

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::error::{AtlasError, Result};
use crate::store::Store;

pub const SOURCE_DISPLAY_CHARS: usize = 60;
pub const URL_DISPLAY_CHARS: usize = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentRow {
    pub id: i64,
    pub ts: Option<String>,
    pub source: String,
    pub url: String,
    pub color: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub total: u64,
    /// `(source, url)` pairs stored more than once. Expected to stay 0.
    pub duplicate_pairs: u64,
    pub unscored: u64,
    pub top_sources: Vec<SourceCount>,
    pub recent: Vec<RecentRow>,
}

/// Build the full report. A missing store or table yields an empty report.
pub fn report(db_path: &Path, top_n: usize, recent_n: usize) -> Result<StatusReport> {
    let Some(store) = Store::open_read_only(db_path)? else {
        return Ok(StatusReport::default());
    };
    report_from(&store, top_n, recent_n)
}

pub fn report_from(store: &Store, top_n: usize, recent_n: usize) -> Result<StatusReport> {
    if !store.has_signals_table()? {
        return Ok(StatusReport::default());
    }
    Ok(StatusReport {
        total: store.count()?,
        duplicate_pairs: duplicate_pairs(store)?,
        unscored: unscored_count(store)?,
        top_sources: top_sources(store, top_n)?,
        recent: recent_rows(store, recent_n)?,
    })
}

pub fn duplicate_pairs(store: &Store) -> Result<u64> {
    scalar(
        store,
        "SELECT COUNT(*) FROM (SELECT 1 FROM signals \
         WHERE source IS NOT NULL AND source != '' AND url IS NOT NULL AND url != '' \
         GROUP BY source, url HAVING COUNT(*) > 1)",
    )
}

pub fn unscored_count(store: &Store) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM signals WHERE {}",
        store.unscored_filter()?
    );
    scalar(store, &sql)
}

/// Sources by row count, descending; ties by name ascending.
pub fn top_sources(store: &Store, n: usize) -> Result<Vec<SourceCount>> {
    let mut stmt = store
        .conn()
        .prepare(
            "SELECT COALESCE(source, '') AS s, COUNT(*) AS c FROM signals \
             GROUP BY s ORDER BY c DESC, s ASC LIMIT ?1",
        )
        .map_err(|e| AtlasError::from_sqlite(store.path(), e))?;
    let rows = stmt
        .query_map([n as i64], |r| {
            Ok(SourceCount {
                source: r.get(0)?,
                count: r.get::<_, i64>(1)?.max(0) as u64,
            })
        })
        .map_err(|e| AtlasError::from_sqlite(store.path(), e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| AtlasError::from_sqlite(store.path(), e))
}

/// Newest rows by id with source/url cut to display width.
pub fn recent_rows(store: &Store, n: usize) -> Result<Vec<RecentRow>> {
    Ok(store
        .recent(n)?
        .into_iter()
        .map(|s| RecentRow {
            id: s.id,
            ts: s.ts,
            source: truncate_chars(s.source.as_deref().unwrap_or_default(), SOURCE_DISPLAY_CHARS),
            url: truncate_chars(s.url.as_deref().unwrap_or_default(), URL_DISPLAY_CHARS),
            color: s.color,
            score: s.score,
        })
        .collect())
}

fn scalar(store: &Store, sql: &str) -> Result<u64> {
    let n: i64 = store
        .conn()
        .query_row(sql, [], |r| r.get(0))
        .map_err(|e| AtlasError::from_sqlite(store.path(), e))?;
    Ok(n.max(0) as u64)
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "signals total: {}", self.total)?;
        writeln!(f, "duplicate (source,url) pairs: {}", self.duplicate_pairs)?;
        writeln!(f, "unscored: {}", self.unscored)?;
        writeln!(f)?;
        writeln!(f, "top sources:")?;
        if self.top_sources.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for s in &self.top_sources {
            writeln!(f, "  {:>6}  {}", s.count, s.source)?;
        }
        writeln!(f)?;
        writeln!(f, "recent:")?;
        if self.recent.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for r in &self.recent {
            writeln!(
                f,
                "  {:>6}  {:<2} {:<60}  {}",
                r.id,
                r.color.as_deref().unwrap_or(" "),
                r.source,
                r.url
            )?;
        }
        Ok(())
    }
}
