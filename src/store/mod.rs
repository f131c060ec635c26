// src/store/mod.rs
//! SQLite-backed signal store.
//!
//! One file, many short-lived processes (fetch, score, dashboard, reporters). Each
//! process opens its own connection through [`Store`] and drops it when done.
//! Uniqueness of `(source, url)` is enforced by a partial unique index created in
//! [`migrations`]; inserts never check it in application code.

pub mod migrations;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AtlasError, Result};
pub use migrations::{IndexDefinition, MigrationReport, REQUIRED_COLUMNS};

const SIGNAL_COLUMNS: [&str; 12] = [
    "id", "ts", "source", "title", "text", "url", "summary", "raw", "score", "color", "label",
    "rationale",
];

/// Classification symbol written by the score stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorToken {
    HighRisk,
    Watch,
    Progress,
    Neutral,
}

impl ColorToken {
    pub const ALL: [ColorToken; 4] = [
        ColorToken::HighRisk,
        ColorToken::Watch,
        ColorToken::Progress,
        ColorToken::Neutral,
    ];

    /// Symbol stored in the `color` column.
    pub fn symbol(self) -> &'static str {
        match self {
            ColorToken::HighRisk => "🔴",
            ColorToken::Watch => "🟡",
            ColorToken::Progress => "🟢",
            ColorToken::Neutral => "⚫",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorToken::HighRisk => "high-risk",
            ColorToken::Watch => "watch",
            ColorToken::Progress => "progress",
            ColorToken::Neutral => "neutral",
        }
    }

    /// Accepts stored symbols, token names and the legacy color words.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "🔴" | "red" | "high-risk" => Some(ColorToken::HighRisk),
            "🟡" | "yellow" | "⚪" | "white" | "watch" => Some(ColorToken::Watch),
            "🟢" | "green" | "progress" => Some(ColorToken::Progress),
            "⚫" | "black" | "neutral" => Some(ColorToken::Neutral),
            _ => None,
        }
    }
}

/// A row as the fetch stage hands it over. Score fields are filled later.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewSignal {
    pub ts: Option<String>,
    pub source: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub raw: Option<String>,
}

impl NewSignal {
    pub fn new(source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_ts(mut self, ts: impl Into<String>) -> Self {
        self.ts = Some(ts.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The `(source, url)` pair is already stored; the existing row is untouched.
    Duplicate,
}

impl InsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub id: i64,
    pub ts: Option<String>,
    pub source: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub raw: Option<String>,
    pub score: Option<f64>,
    pub color: Option<String>,
    pub label: Option<String>,
    pub rationale: Option<String>,
}

impl Signal {
    /// `ts` as a timestamp; anything unparsable reads as `None`.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.ts.as_deref().and_then(parse_ts)
    }

    pub fn color_token(&self) -> Option<ColorToken> {
        self.color.as_deref().and_then(ColorToken::parse)
    }

    /// First non-empty of text, title, summary.
    pub fn display_text(&self) -> &str {
        [&self.text, &self.title, &self.summary]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ts: lenient_text(row.get_ref(1)?),
            source: lenient_text(row.get_ref(2)?),
            title: lenient_text(row.get_ref(3)?),
            text: lenient_text(row.get_ref(4)?),
            url: lenient_text(row.get_ref(5)?),
            summary: lenient_text(row.get_ref(6)?),
            raw: lenient_text(row.get_ref(7)?),
            score: lenient_real(row.get_ref(8)?),
            color: lenient_text(row.get_ref(9)?),
            label: lenient_text(row.get_ref(10)?),
            rationale: lenient_text(row.get_ref(11)?),
        })
    }
}

/// Result of scoring one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub id: i64,
    pub score: f64,
    pub color: ColorToken,
    pub label: String,
    pub rationale: String,
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating file and parent dirs if needed) and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, MigrationReport)> {
        Self::open_with(path, Duration::from_secs(5))
    }

    pub fn open_with(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<(Self, MigrationReport)> {
        let mut store = Self::open_unmigrated(path.as_ref(), true, busy_timeout)?;
        let report = store.migrate()?;
        Ok((store, report))
    }

    /// Like [`Store::open`] but refuses to create a missing file.
    pub fn open_existing(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AtlasError::StoreUnavailable {
                path: path.to_path_buf(),
                reason: "store file does not exist".into(),
            });
        }
        Self::open_unmigrated(path, false, busy_timeout)
    }

    /// Read-only handle for reporters. `Ok(None)` when there is no store yet.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| AtlasError::from_sqlite(path, e))?;
        Ok(Some(Self {
            conn,
            path: path.to_path_buf(),
        }))
    }

    /// Open without running migrations.
    pub fn open_unmigrated(path: &Path, create: bool, busy_timeout: Duration) -> Result<Self> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| AtlasError::StoreUnavailable {
                    path: path.to_path_buf(),
                    reason: format!("creating {}: {e}", parent.display()),
                })?;
            }
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn =
            Connection::open_with_flags(path, flags).map_err(|e| AtlasError::from_sqlite(path, e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| AtlasError::from_sqlite(path, e))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Apply pending schema steps. A second call with no intervening change is a no-op.
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        migrations::run_migrations(&mut self.conn, &self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn has_signals_table(&self) -> Result<bool> {
        migrations::table_exists(&self.conn, "signals").map_err(|e| self.err(e))
    }

    pub fn columns(&self) -> Result<Vec<String>> {
        migrations::table_columns(&self.conn, "signals").map_err(|e| self.err(e))
    }

    pub fn index_definitions(&self) -> Result<Vec<IndexDefinition>> {
        migrations::index_definitions(&self.conn).map_err(|e| self.err(e))
    }

    /// Insert unless the non-empty `(source, url)` pair already exists.
    ///
    /// Rows with an empty or missing source or url are always inserted.
    pub fn insert_signal(&self, signal: &NewSignal) -> Result<InsertOutcome> {
        let mut cols: Vec<String> = ["ts", "source", "title", "text", "url", "summary", "raw"]
            .into_iter()
            .map(String::from)
            .collect();
        let mut values: Vec<Value> = [
            &signal.ts,
            &signal.source,
            &signal.title,
            &signal.text,
            &signal.url,
            &signal.summary,
            &signal.raw,
        ]
        .into_iter()
        .map(|v| v.clone().map(Value::Text).unwrap_or(Value::Null))
        .collect();

        for col in self.not_null_without_default()? {
            match cols.iter().position(|c| c.eq_ignore_ascii_case(&col)) {
                Some(i) if values[i] == Value::Null => values[i] = placeholder(&col, signal),
                Some(_) => {}
                None => {
                    // score fields, or a legacy column unknown to the read model
                    values.push(placeholder(&col, signal));
                    cols.push(quote_ident(&col));
                }
            }
        }

        let sql = format!(
            "INSERT INTO signals ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            cols.join(", "),
            vec!["?"; cols.len()].join(", ")
        );
        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .map_err(|e| self.err(e))?;
        if changed == 0 {
            return Ok(InsertOutcome::Duplicate);
        }
        Ok(InsertOutcome::Inserted(self.conn.last_insert_rowid()))
    }

    /// Same as [`Store::insert_signal`] but reports a duplicate as `ConstraintViolation`.
    pub fn insert_signal_strict(&self, signal: &NewSignal) -> Result<i64> {
        match self.insert_signal(signal)? {
            InsertOutcome::Inserted(id) => Ok(id),
            InsertOutcome::Duplicate => Err(AtlasError::ConstraintViolation {
                source_name: signal.source.clone().unwrap_or_default(),
                url: signal.url.clone().unwrap_or_default(),
            }),
        }
    }

    pub fn get(&self, id: i64) -> Result<Option<Signal>> {
        let sql = format!("SELECT {} FROM signals WHERE id = ?1", self.select_list()?);
        match self.conn.query_row(&sql, [id], Signal::from_row) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(self.err(e)),
        }
    }

    /// Newest rows first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Signal>> {
        let sql = format!(
            "SELECT {} FROM signals ORDER BY id DESC LIMIT ?1",
            self.select_list()?
        );
        self.query_signals(&sql, limit)
    }

    /// Rows the score stage has not touched yet (empty rationale), newest first.
    pub fn unscored(&self, limit: usize) -> Result<Vec<Signal>> {
        let sql = format!(
            "SELECT {} FROM signals WHERE {} ORDER BY id DESC LIMIT ?1",
            self.select_list()?,
            self.unscored_filter()?
        );
        self.query_signals(&sql, limit)
    }

    /// Write score results in place, all-or-nothing.
    pub fn apply_scores(&mut self, updates: &[ScoreUpdate]) -> Result<usize> {
        let path = self.path.clone();
        let tx = self
            .conn
            .transaction()
            .map_err(|e| AtlasError::from_sqlite(&path, e))?;
        let mut n = 0;
        {
            let mut stmt = tx
                .prepare("UPDATE signals SET score = ?1, color = ?2, label = ?3, rationale = ?4 WHERE id = ?5")
                .map_err(|e| AtlasError::from_sqlite(&path, e))?;
            for u in updates {
                n += stmt
                    .execute(params![u.score, u.color.symbol(), u.label, u.rationale, u.id])
                    .map_err(|e| AtlasError::from_sqlite(&path, e))?;
            }
        }
        tx.commit().map_err(|e| AtlasError::from_sqlite(&path, e))?;
        Ok(n)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM signals", [], |r| r.get(0))
            .map_err(|e| self.err(e))?;
        Ok(n.max(0) as u64)
    }

    /// `PRAGMA integrity_check`; "ok" when healthy.
    pub fn integrity_check(&self) -> Result<String> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA integrity_check")
            .map_err(|e| self.err(e))?;
        let lines: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .map_err(|e| self.err(e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| self.err(e))?;
        Ok(lines.join("\n"))
    }

    /// Consistent point-in-time copy of the whole database into `dest`.
    pub fn snapshot_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        let dest_str = dest.to_string_lossy().to_string();
        self.conn
            .execute("VACUUM INTO ?1", [dest_str])
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    fn query_signals(&self, sql: &str, limit: usize) -> Result<Vec<Signal>> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map([limit as i64], Signal::from_row)
            .map_err(|e| self.err(e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| self.err(e))
    }

    /// Select list over the read model's columns. Columns an unmigrated legacy table
    /// lacks read as NULL.
    fn select_list(&self) -> Result<String> {
        let present = self.columns()?;
        Ok(SIGNAL_COLUMNS
            .iter()
            .map(|c| {
                if present.iter().any(|p| p.eq_ignore_ascii_case(c)) {
                    (*c).to_string()
                } else {
                    format!("NULL AS {c}")
                }
            })
            .collect::<Vec<_>>()
            .join(", "))
    }

    /// WHERE clause matching unscored rows; every row when there is no `rationale`.
    pub fn unscored_filter(&self) -> Result<&'static str> {
        let present = self.columns()?;
        Ok(if present.iter().any(|p| p.eq_ignore_ascii_case("rationale")) {
            "(rationale IS NULL OR rationale = '')"
        } else {
            "1"
        })
    }

    /// Columns a legacy table declares NOT NULL without a default value.
    fn not_null_without_default(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info(signals)")
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(3)? == 1,
                    r.get::<_, Option<String>>(4)?.is_some(),
                    r.get::<_, i64>(5)? > 0,
                ))
            })
            .map_err(|e| self.err(e))?;
        let mut out = Vec::new();
        for row in rows {
            let (name, notnull, has_default, pk) = row.map_err(|e| self.err(e))?;
            if notnull && !has_default && !pk {
                out.push(name);
            }
        }
        Ok(out)
    }

    fn err(&self, e: rusqlite::Error) -> AtlasError {
        AtlasError::from_sqlite(&self.path, e)
    }
}

fn placeholder(col: &str, signal: &NewSignal) -> Value {
    match col.to_ascii_lowercase().as_str() {
        "ts" => Value::Text(Utc::now().to_rfc3339()),
        "score" => Value::Real(0.0),
        "color" => Value::Text(ColorToken::Neutral.symbol().to_string()),
        "label" => Value::Text(signal.source.clone().unwrap_or_default()),
        _ => Value::Text(String::new()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parse the formats seen in `ts`: RFC 3339, RFC 2822 and plain SQL datetimes.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|n| n.and_utc())
}

fn lenient_text(v: ValueRef<'_>) -> Option<String> {
    match v {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn lenient_real(v: ValueRef<'_>) -> Option<f64> {
    match v {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok(),
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_parsing_tolerates_garbage() {
        assert!(parse_ts("2024-05-01T10:00:00+00:00").is_some());
        assert!(parse_ts("Wed, 01 May 2024 10:00:00 GMT").is_some());
        assert!(parse_ts("2024-05-01 10:00:00").is_some());
        assert_eq!(parse_ts("yesterday-ish"), None);
        assert_eq!(parse_ts(""), None);
    }

    #[test]
    fn color_tokens_accept_legacy_words() {
        assert_eq!(ColorToken::parse("red"), Some(ColorToken::HighRisk));
        assert_eq!(ColorToken::parse("⚪"), Some(ColorToken::Watch));
        assert_eq!(ColorToken::parse("🟢"), Some(ColorToken::Progress));
        assert_eq!(ColorToken::parse("purple"), None);
        for t in ColorToken::ALL {
            assert_eq!(ColorToken::parse(t.symbol()), Some(t));
            assert_eq!(ColorToken::parse(t.name()), Some(t));
        }
    }

    #[test]
    fn lenient_real_reads_text_scores() {
        assert_eq!(lenient_real(ValueRef::Text(b"0.5")), Some(0.5));
        assert_eq!(lenient_real(ValueRef::Text(b"n/a")), None);
        assert_eq!(lenient_real(ValueRef::Integer(1)), Some(1.0));
    }

    #[test]
    fn display_text_falls_back_to_title() {
        let s = Signal {
            id: 1,
            ts: None,
            source: None,
            title: Some("headline".into()),
            text: Some("  ".into()),
            url: None,
            summary: None,
            raw: None,
            score: None,
            color: None,
            label: None,
            rationale: None,
        };
        assert_eq!(s.display_text(), "headline");
    }
}
