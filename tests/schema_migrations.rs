// tests/schema_migrations.rs
//
// Schema manager against fresh and legacy stores.
//
// Covered:
// - idempotence (second run changes nothing)
// - adding a missing column preserves existing rows
// - dropping a url-only unique index
// - recreating a same-named index with the wrong definition
// - pre-existing duplicates fail the whole batch atomically
// - a store locked by another writer fails with StoreUnavailable and stays untouched

use rusqlite::Connection;
use signal_atlas::store::migrations::{REQUIRED_COLUMNS, SOURCE_URL_INDEX};
use signal_atlas::{AtlasError, NewSignal, Store};
use std::path::Path;

fn legacy(path: &Path, ddl: &str) -> Connection {
    let conn = Connection::open(path).expect("open legacy db");
    conn.execute_batch(ddl).expect("legacy ddl");
    conn
}

fn columns(store: &Store) -> Vec<String> {
    let mut c = store.columns().expect("columns");
    c.sort();
    c
}

#[test]
fn fresh_store_gets_full_schema_and_second_run_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("atlas.db");

    let (store, first) = Store::open(&db).expect("first open");
    assert_eq!(first.applied.len(), 4);
    for (name, _) in REQUIRED_COLUMNS {
        assert!(store.columns().unwrap().iter().any(|c| c == name), "missing {name}");
    }
    let cols_before = columns(&store);
    let idx_before = store.index_definitions().unwrap();
    assert!(idx_before.iter().any(|i| i.name == SOURCE_URL_INDEX));
    drop(store);

    let (store, second) = Store::open(&db).expect("second open");
    assert!(second.is_noop(), "second run applied {:?}", second.applied);
    assert_eq!(columns(&store), cols_before);
    assert_eq!(store.index_definitions().unwrap(), idx_before);
    assert_eq!(second.indexes, idx_before);
}

#[test]
fn missing_rationale_column_is_added_without_touching_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("atlas.db");
    {
        let conn = legacy(
            &db,
            "CREATE TABLE signals (id INTEGER PRIMARY KEY AUTOINCREMENT, ts TEXT, source TEXT, \
             title TEXT, text TEXT, url TEXT, summary TEXT, raw TEXT, score REAL, color TEXT, label TEXT);",
        );
        for i in 1..=3 {
            conn.execute(
                "INSERT INTO signals (ts, source, title, url, score, color) VALUES (?1, 'feedX', ?2, ?3, 0.5, '🟡')",
                rusqlite::params![format!("2024-01-0{i}T00:00:00Z"), format!("t{i}"), format!("http://x/{i}")],
            )
            .unwrap();
        }
    }

    let (store, report) = Store::open(&db).expect("migrate legacy");
    assert_eq!(report.added_columns, vec!["rationale".to_string()]);
    assert_eq!(store.count().unwrap(), 3);

    for i in 1..=3i64 {
        let s = store.get(i).unwrap().expect("row kept");
        assert_eq!(s.id, i);
        assert_eq!(s.title.as_deref(), Some(format!("t{i}").as_str()));
        assert_eq!(s.url.as_deref(), Some(format!("http://x/{i}").as_str()));
        assert_eq!(s.score, Some(0.5));
        assert_eq!(s.color.as_deref(), Some("🟡"));
        assert_eq!(s.rationale, None);
    }
}

#[test]
fn url_only_unique_index_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("atlas.db");
    drop(legacy(
        &db,
        "CREATE TABLE signals (id INTEGER PRIMARY KEY, ts TEXT, source TEXT, title TEXT, url TEXT, raw TEXT);
         CREATE UNIQUE INDEX idx_signals_url ON signals(url);
         CREATE INDEX idx_signals_ts ON signals(ts);",
    ));

    let (store, report) = Store::open(&db).unwrap();
    assert_eq!(report.dropped_indexes, vec!["idx_signals_url".to_string()]);
    let names: Vec<String> = report.indexes.iter().map(|i| i.name.clone()).collect();
    assert!(names.contains(&"idx_signals_ts".to_string()), "non-unique index kept");
    assert!(names.contains(&SOURCE_URL_INDEX.to_string()));

    // same url from two feeds is now allowed
    assert!(store.insert_signal(&NewSignal::new("feedA", "http://same")).unwrap().is_inserted());
    assert!(store.insert_signal(&NewSignal::new("feedB", "http://same")).unwrap().is_inserted());
}

#[test]
fn same_named_index_with_other_definition_is_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("atlas.db");
    drop(legacy(
        &db,
        "CREATE TABLE signals (id INTEGER PRIMARY KEY, ts TEXT, source TEXT, url TEXT);
         CREATE UNIQUE INDEX idx_signals_source_url_unique ON signals(source, url);",
    ));

    let (store, report) = Store::open(&db).unwrap();
    assert!(report.dropped_indexes.contains(&SOURCE_URL_INDEX.to_string()));
    let def = store
        .index_definitions()
        .unwrap()
        .into_iter()
        .find(|i| i.name == SOURCE_URL_INDEX)
        .and_then(|i| i.sql)
        .expect("index recreated");
    assert!(def.contains("WHERE source IS NOT NULL"), "{def}");

    // partial again: empty sources may repeat
    assert!(store.insert_signal(&NewSignal::new("", "http://a")).unwrap().is_inserted());
    assert!(store.insert_signal(&NewSignal::new("", "http://a")).unwrap().is_inserted());
}

#[test]
fn existing_duplicates_roll_back_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("atlas.db");
    drop(legacy(
        &db,
        "CREATE TABLE signals (id INTEGER PRIMARY KEY, ts TEXT, source TEXT, title TEXT, url TEXT);
         INSERT INTO signals (source, title, url) VALUES ('feedX', 't1', 'http://a');
         INSERT INTO signals (source, title, url) VALUES ('feedX', 't2', 'http://a');",
    ));

    let err = Store::open(&db).err().expect("duplicates must block the index");
    match err {
        AtlasError::Migration { name, .. } => assert_eq!(name, "source_url_unique_index"),
        other => panic!("expected Migration error, got {other:?}"),
    }

    let store = Store::open_read_only(&db).unwrap().unwrap();
    assert_eq!(store.count().unwrap(), 2, "rows are never deleted");
    assert!(!store.columns().unwrap().iter().any(|c| c == "rationale"), "column add rolled back");
    let ledger: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'schema_migrations'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(ledger, 0, "ledger rolled back with the rest");
}

#[test]
fn open_existing_refuses_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Store::open_existing(dir.path().join("nope.db"), std::time::Duration::from_millis(10))
        .err()
        .expect("missing store");
    assert!(err.is_store_unavailable());
}

#[test]
fn locked_store_is_unavailable_and_left_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("atlas.db");
    let writer = legacy(
        &db,
        "CREATE TABLE signals (id INTEGER PRIMARY KEY, ts TEXT, source TEXT, title TEXT, url TEXT);
         INSERT INTO signals (source, title, url) VALUES ('feedX', 't1', 'http://a');",
    );
    writer.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let err = Store::open_with(&db, std::time::Duration::from_millis(50))
        .err()
        .expect("locked store must not migrate");
    assert!(err.is_store_unavailable(), "{err:?}");

    writer.execute_batch("ROLLBACK;").unwrap();
    drop(writer);

    let store = Store::open_read_only(&db).unwrap().unwrap();
    assert_eq!(store.count().unwrap(), 1);
    let cols = columns(&store);
    for c in ["summary", "raw", "rationale"] {
        assert!(!cols.iter().any(|x| x == c), "{c} must not be added");
    }
    let ledger: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'schema_migrations'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(ledger, 0);
    assert!(store.index_definitions().unwrap().iter().all(|ix| ix.name != SOURCE_URL_INDEX));
}

#[test]
fn migrate_command_prints_applied_steps_and_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("data").join("atlas.db");
    let cfg_file = dir.path().join("atlas.toml");
    std::fs::write(&cfg_file, format!("[store]\npath = {:?}\n", db.to_string_lossy())).unwrap();

    let run = || {
        std::process::Command::new(env!("CARGO_BIN_EXE_atlas"))
            .arg("--config")
            .arg(&cfg_file)
            .arg("migrate")
            .output()
            .expect("run atlas migrate")
    };

    let first = run();
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let out = String::from_utf8_lossy(&first.stdout);
    assert!(out.contains("applied"), "{out}");
    assert!(out.contains(&format!("index {SOURCE_URL_INDEX}:")), "{out}");

    let second = run();
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("schema up to date"));
}
