// tests/ops_install_doctor.rs
//
// launchd plist install (without loading) and the doctor report.

use signal_atlas::config::AtlasConfig;
use signal_atlas::launchd::{self, WriteOutcome};
use signal_atlas::{doctor, NewSignal, Store};
use std::path::Path;

fn config_in(dir: &Path) -> AtlasConfig {
    let mut cfg = AtlasConfig::default();
    cfg.store.path = dir.join("data").join("atlas.db");
    cfg.paths.logs_dir = dir.join("logs");
    cfg.launchd.agents_dir = Some(dir.join("LaunchAgents"));
    cfg.scheduler.interval_secs = 600;
    cfg
}

#[tokio::test]
async fn install_writes_both_plists_and_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let program = Path::new("/usr/local/bin/atlas");

    let first = launchd::install(&cfg, program, dir.path(), false).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|j| j.outcome == WriteOutcome::Created));

    let fetch = std::fs::read_to_string(dir.path().join("LaunchAgents/com.atlas.fetch.plist")).unwrap();
    assert!(fetch.contains("<string>com.atlas.fetch</string>"));
    assert!(fetch.contains("<integer>600</integer>"));
    assert!(fetch.contains("fetch.out.log"));
    assert!(dir.path().join("LaunchAgents/com.atlas.score.plist").exists());
    assert!(cfg.paths.logs_dir.exists());

    let again = launchd::install(&cfg, program, dir.path(), false).await.unwrap();
    assert!(again.iter().all(|j| j.outcome == WriteOutcome::Unchanged));

    let mut changed = cfg.clone();
    changed.scheduler.interval_secs = 300;
    let third = launchd::install(&changed, program, dir.path(), false).await.unwrap();
    for j in &third {
        match &j.outcome {
            WriteOutcome::Replaced { backup } => {
                assert!(backup.to_string_lossy().contains(".plist.bak."), "{backup:?}");
                assert!(backup.exists());
            }
            other => panic!("expected replacement, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn doctor_report_includes_checks_logs_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    {
        let (store, _) = Store::open(&cfg.store.path).unwrap();
        store.insert_signal(&NewSignal::new("feedX", "http://a")).unwrap();
    }
    std::fs::create_dir_all(&cfg.paths.logs_dir).unwrap();
    std::fs::write(cfg.paths.logs_dir.join("fetch.err.log"), "older\nlast fetch error\n").unwrap();

    let report = doctor::collect(&cfg).await.unwrap();
    let by_name = |n: &str| report.checks.iter().find(|c| c.name == n).cloned();
    assert!(by_name("store exists").unwrap().ok);
    assert!(by_name("integrity_check").unwrap().ok);
    assert!(by_name("no duplicate (source, url)").unwrap().ok);
    assert_eq!(report.status.total, 1);
    assert_eq!(report.logs.len(), 4);
    assert_eq!(report.jobs.len(), 2);

    let path = doctor::write_report(&cfg, &report).unwrap();
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("doctor_report_") && name.ends_with(".md"));
    let md = std::fs::read_to_string(&path).unwrap();
    assert!(md.contains("last fetch error"));
    assert!(md.contains("signals total: 1"));
    assert!(md.contains("com.atlas.score"));
}

#[tokio::test]
async fn doctor_fails_without_store() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let report = doctor::collect(&cfg).await.unwrap();
    assert!(report.failed());
    assert!(!cfg.store.path.exists(), "doctor never creates the store");
}
