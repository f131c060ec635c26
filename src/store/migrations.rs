// src/store/migrations.rs
//! Ordered schema steps for the signal store.
//!
//! Each step is recorded in `schema_migrations` once applied, so later opens skip it
//! without re-inspecting the live schema. All pending steps run inside a single
//! `BEGIN IMMEDIATE` transaction: a reader either sees the old schema or the new one.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{is_unavailable, AtlasError, Result};

/// Columns every `signals` table must carry, with their declared types.
pub const REQUIRED_COLUMNS: &[(&str, &str)] = &[
    ("ts", "TEXT"),
    ("source", "TEXT"),
    ("title", "TEXT"),
    ("text", "TEXT"),
    ("url", "TEXT"),
    ("summary", "TEXT"),
    ("raw", "TEXT"),
    ("score", "REAL"),
    ("color", "TEXT"),
    ("label", "TEXT"),
    ("rationale", "TEXT"),
];

pub const SOURCE_URL_INDEX: &str = "idx_signals_source_url_unique";

pub const SOURCE_URL_INDEX_SQL: &str = "CREATE UNIQUE INDEX idx_signals_source_url_unique \
     ON signals(source, url) \
     WHERE source IS NOT NULL AND source != '' AND url IS NOT NULL AND url != ''";

const CREATE_SIGNALS_SQL: &str = "CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT,
    source TEXT,
    title TEXT,
    text TEXT,
    url TEXT,
    summary TEXT,
    raw TEXT,
    score REAL,
    color TEXT,
    label TEXT,
    rationale TEXT
)";

const CREATE_LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

pub(crate) struct Migration {
    pub version: u32,
    pub name: &'static str,
    apply: fn(&Transaction<'_>, &mut MigrationReport) -> rusqlite::Result<()>,
}

/// All steps, ascending by version. Never reorder or renumber.
pub(crate) fn all_migrations() -> &'static [Migration] {
    const STEPS: &[Migration] = &[
        Migration {
            version: 1,
            name: "create_signals",
            apply: create_signals,
        },
        Migration {
            version: 2,
            name: "add_required_columns",
            apply: add_required_columns,
        },
        Migration {
            version: 3,
            name: "drop_url_unique_index",
            apply: drop_url_unique_index,
        },
        Migration {
            version: 4,
            name: "source_url_unique_index",
            apply: source_url_unique_index,
        },
    ];
    STEPS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDefinition {
    pub name: String,
    pub sql: Option<String>,
}

/// What a schema run changed, plus the index definitions it left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<AppliedMigration>,
    pub added_columns: Vec<String>,
    pub dropped_indexes: Vec<String>,
    pub indexes: Vec<IndexDefinition>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

pub(crate) fn run_migrations(conn: &mut Connection, path: &Path) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    if pending(conn, path)?.is_empty() {
        report.indexes = index_definitions(conn).map_err(|e| AtlasError::from_sqlite(path, e))?;
        return Ok(report);
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| AtlasError::from_sqlite(path, e))?;
    tx.execute_batch(CREATE_LEDGER_SQL)
        .map_err(|e| AtlasError::from_sqlite(path, e))?;

    // Re-read under the write lock; another process may have migrated meanwhile.
    let done = applied_versions(&tx).map_err(|e| AtlasError::from_sqlite(path, e))?;
    let now = chrono::Utc::now().to_rfc3339();

    for m in all_migrations().iter().filter(|m| !done.contains(&m.version)) {
        let step = (m.apply)(&tx, &mut report).and_then(|_| {
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![m.version, m.name, now],
            )
            .map(|_| ())
        });
        if let Err(e) = step {
            if is_unavailable(&e) {
                return Err(AtlasError::from_sqlite(path, e));
            }
            return Err(AtlasError::Migration {
                version: m.version,
                name: m.name,
                source: e,
            });
        }
        report.applied.push(AppliedMigration {
            version: m.version,
            name: m.name,
        });
    }

    report.indexes = index_definitions(&tx).map_err(|e| AtlasError::from_sqlite(path, e))?;
    tx.commit().map_err(|e| AtlasError::from_sqlite(path, e))?;

    info!(
        target: "store",
        applied = ?report.applied.iter().map(|m| m.name).collect::<Vec<_>>(),
        added_columns = ?report.added_columns,
        dropped_indexes = ?report.dropped_indexes,
        "schema migrated"
    );
    Ok(report)
}

/// Steps not yet recorded in the ledger.
pub(crate) fn pending(conn: &Connection, path: &Path) -> Result<Vec<&'static Migration>> {
    let done = if table_exists(conn, "schema_migrations").map_err(|e| AtlasError::from_sqlite(path, e))? {
        applied_versions(conn).map_err(|e| AtlasError::from_sqlite(path, e))?
    } else {
        HashSet::new()
    };
    Ok(all_migrations()
        .iter()
        .filter(|m| !done.contains(&m.version))
        .collect())
}

fn applied_versions(conn: &Connection) -> rusqlite::Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let rows = stmt.query_map([], |r| r.get::<_, u32>(0))?;
    rows.collect()
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(1))?;
    rows.collect()
}

/// Explicit index definitions on `signals`, ordered by name.
pub(crate) fn index_definitions(conn: &Connection) -> rusqlite::Result<Vec<IndexDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = 'signals' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(IndexDefinition {
            name: r.get(0)?,
            sql: r.get(1)?,
        })
    })?;
    rows.collect()
}

fn create_signals(tx: &Transaction<'_>, _report: &mut MigrationReport) -> rusqlite::Result<()> {
    tx.execute_batch(CREATE_SIGNALS_SQL)
}

fn add_required_columns(tx: &Transaction<'_>, report: &mut MigrationReport) -> rusqlite::Result<()> {
    let existing: HashSet<String> = table_columns(tx, "signals")?
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    for (name, ty) in REQUIRED_COLUMNS {
        if existing.contains(*name) {
            continue;
        }
        tx.execute_batch(&format!("ALTER TABLE signals ADD COLUMN {name} {ty}"))?;
        report.added_columns.push((*name).to_string());
    }
    Ok(())
}

fn drop_url_unique_index(tx: &Transaction<'_>, report: &mut MigrationReport) -> rusqlite::Result<()> {
    // (name, unique, origin); origin 'c' = CREATE INDEX, 'u' = UNIQUE constraint.
    let mut stmt = tx.prepare("PRAGMA index_list(signals)")?;
    let indexes: Vec<(String, bool, String)> = stmt
        .query_map([], |r| Ok((r.get(1)?, r.get::<_, i64>(2)? == 1, r.get(3)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for (name, unique, origin) in indexes {
        if !unique {
            continue;
        }
        let mut info = tx.prepare(&format!("PRAGMA index_info({})", quote_ident(&name)))?;
        let cols: Vec<Option<String>> = info
            .query_map([], |r| r.get(2))?
            .collect::<rusqlite::Result<_>>()?;
        drop(info);
        if cols != [Some("url".to_string())] {
            continue;
        }
        if origin == "c" {
            tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(&name)))?;
            report.dropped_indexes.push(name);
        } else {
            warn!(
                target: "store",
                index = %name,
                "url uniqueness is part of the table definition and cannot be dropped in place"
            );
        }
    }
    Ok(())
}

fn source_url_unique_index(tx: &Transaction<'_>, report: &mut MigrationReport) -> rusqlite::Result<()> {
    let existing: Option<Option<String>> = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [SOURCE_URL_INDEX],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(Some(sql)) if same_definition(&sql, SOURCE_URL_INDEX_SQL) => return Ok(()),
        Some(_) => {
            tx.execute_batch(&format!("DROP INDEX {}", quote_ident(SOURCE_URL_INDEX)))?;
            report.dropped_indexes.push(SOURCE_URL_INDEX.to_string());
        }
        None => {}
    }

    let dupes: i64 = tx.query_row(
        "SELECT COUNT(*) FROM (SELECT 1 FROM signals \
         WHERE source IS NOT NULL AND source != '' AND url IS NOT NULL AND url != '' \
         GROUP BY source, url HAVING COUNT(*) > 1)",
        [],
        |r| r.get(0),
    )?;
    if dupes > 0 {
        warn!(target: "store", duplicate_pairs = dupes, "existing rows block the (source, url) unique index");
    }
    tx.execute_batch(SOURCE_URL_INDEX_SQL)
}

/// Compare two CREATE statements ignoring case and whitespace layout.
fn same_definition(a: &str, b: &str) -> bool {
    fn norm(s: &str) -> String {
        s.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .replace("( ", "(")
            .replace(" )", ")")
            .to_ascii_lowercase()
    }
    norm(a) == norm(b)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_ascending() {
        let v: Vec<u32> = all_migrations().iter().map(|m| m.version).collect();
        assert!(v.windows(2).all(|w| w[0] < w[1]), "{v:?}");
    }

    #[test]
    fn definition_comparison_ignores_layout() {
        let legacy = "CREATE UNIQUE INDEX idx_signals_source_url_unique\n        ON signals(source, url)\n        WHERE source IS NOT NULL AND source != ''\n          AND url IS NOT NULL AND url != ''";
        assert!(same_definition(legacy, SOURCE_URL_INDEX_SQL));
        assert!(!same_definition(
            "CREATE UNIQUE INDEX idx_signals_source_url_unique ON signals(url)",
            SOURCE_URL_INDEX_SQL
        ));
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
