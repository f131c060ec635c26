// tests/supervisor_lifecycle.rs
//
// Dashboard supervision: early exit surfaces the child's output, a garbage PID
// file means "no process", and a real `atlas serve` can be started and stopped.

use serial_test::serial;
use std::time::Duration;

use signal_atlas::config::AtlasConfig;
use signal_atlas::supervisor::{self, Supervisor};
use signal_atlas::AtlasError;

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    l.local_addr().unwrap().port()
}

fn config_in(dir: &std::path::Path) -> AtlasConfig {
    let mut cfg = AtlasConfig::default();
    cfg.paths.logs_dir = dir.join("logs");
    cfg.paths.run_dir = dir.to_path_buf();
    cfg.store.path = dir.join("data").join("atlas.db");
    cfg
}

#[tokio::test]
#[serial]
async fn early_exit_fails_with_captured_output() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let port = free_port();

    let sup = Supervisor::from_config(&cfg, port)
        .with_command("sh", vec!["-c".into(), "echo boom-from-child; exit 3".into()])
        .with_ready_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(50));

    match sup.start().await {
        Err(AtlasError::ProcessLivenessFailure { port: p, reason, output }) => {
            assert_eq!(p, port);
            assert!(reason.contains("exited"), "{reason}");
            assert!(output.contains("boom-from-child"), "{output}");
        }
        other => panic!("expected liveness failure, got {other:?}"),
    }
    assert!(!sup.pid_file().exists(), "pid file cleaned up");
}

#[tokio::test]
#[serial]
async fn never_ready_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());

    let sup = Supervisor::from_config(&cfg, free_port())
        .with_command("sh", vec!["-c".into(), "echo waiting; sleep 30".into()])
        .with_ready_timeout(Duration::from_millis(600))
        .with_poll_interval(Duration::from_millis(100));

    let err = sup.start().await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    match err {
        AtlasError::ProcessLivenessFailure { reason, .. } => assert!(reason.contains("not accepting"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn garbage_pid_file_is_no_process() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let port = free_port();
    std::fs::write(cfg.pid_file(port), "definitely not a pid\n").unwrap();

    let sup = Supervisor::from_config(&cfg, port);
    let stopped = sup.stop().await.expect("garbage pid file is not an error");
    assert!(stopped.is_empty());
    assert!(!cfg.pid_file(port).exists());
}

#[tokio::test]
#[serial]
async fn real_dashboard_starts_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let port = free_port();

    let cfg_file = dir.path().join("atlas.toml");
    std::fs::write(
        &cfg_file,
        format!(
            "[store]\npath = {:?}\n\n[paths]\nlogs_dir = {:?}\n",
            cfg.store.path.to_string_lossy(),
            cfg.paths.logs_dir.to_string_lossy()
        ),
    )
    .unwrap();

    let sup = Supervisor::from_config(&cfg, port)
        .with_command(
            env!("CARGO_BIN_EXE_atlas"),
            vec![
                "--config".into(),
                cfg_file.to_string_lossy().to_string(),
                "serve".into(),
                "--port".into(),
                port.to_string(),
            ],
        )
        .with_grace(Duration::from_secs(2));

    let pid = sup.start().await.expect("dashboard becomes ready");
    assert!(pid > 0);
    assert_eq!(supervisor::read_pid_file(sup.pid_file()), Some(pid as i32));
    assert!(supervisor::port_accepts("127.0.0.1", port).await);

    let stopped = sup.stop().await.unwrap();
    assert!(stopped.contains(&(pid as i32)), "{stopped:?}");
    assert!(!sup.pid_file().exists());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!supervisor::port_accepts("127.0.0.1", port).await);
}

#[tokio::test]
#[serial]
async fn start_creates_missing_run_and_log_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.paths.run_dir = dir.path().join("run").join("nested");
    cfg.paths.logs_dir = dir.path().join("logs").join("nested");
    let port = free_port();

    let sup = Supervisor::from_config(&cfg, port)
        .with_command("sh", vec!["-c".into(), "echo started-in-nested; exit 1".into()])
        .with_ready_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(50));

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, AtlasError::ProcessLivenessFailure { .. }), "{err:?}");
    assert!(cfg.paths.run_dir.is_dir());
    let log = std::fs::read_to_string(sup.log_file()).unwrap();
    assert!(log.contains("started-in-nested"), "{log}");
    assert!(!sup.pid_file().exists());
}
