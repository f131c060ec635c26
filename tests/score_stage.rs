// tests/score_stage.rs
//
// Score stage against a real store: only unscored rows are touched, results land
// in place with symbol colors and a rationale.

use signal_atlas::score::{score_pending, Scorer};
use signal_atlas::{ColorToken, NewSignal, Store};

#[test]
fn scores_unscored_rows_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (mut store, _) = Store::open(dir.path().join("atlas.db")).unwrap();

    store
        .insert_signal(
            &NewSignal::new("https://lwn.net/rss", "https://lwn.net/Articles/1")
                .with_title("Kernel exploit disclosed"),
        )
        .unwrap();
    store
        .insert_signal(
            &NewSignal::new("https://example.org/rss", "https://example.org/2")
                .with_title("Announcing the stable release"),
        )
        .unwrap();

    let report = score_pending(&mut store, &Scorer::default(), 200).unwrap();
    assert_eq!(report.updated, 2);
    assert!(store.unscored(10).unwrap().is_empty());

    let rows = store.recent(10).unwrap();
    let progress = rows.iter().find(|r| r.id == 2).unwrap();
    assert_eq!(progress.color_token(), Some(ColorToken::Progress));
    assert_eq!(progress.color.as_deref(), Some("🟢"));
    assert_eq!(progress.label.as_deref(), Some("progress"));
    // 0.5 * 0.45 (unknown host) + 0.5 * 0.66
    assert!((progress.score.unwrap() - 0.555).abs() < 1e-4);

    let risk = rows.iter().find(|r| r.id == 1).unwrap();
    assert_eq!(risk.color_token(), Some(ColorToken::HighRisk));
    let rationale = risk.rationale.as_deref().unwrap();
    assert!(rationale.starts_with("risk/pressure; score=0.70; source=https://lwn.net/rss; t="), "{rationale}");

    // nothing left: second pass is a no-op
    assert_eq!(score_pending(&mut store, &Scorer::default(), 200).unwrap().updated, 0);
}

#[test]
fn batch_limit_is_respected_and_scored_rows_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (mut store, _) = Store::open(dir.path().join("atlas.db")).unwrap();
    for i in 0..5 {
        store
            .insert_signal(&NewSignal::new("feed", format!("https://x.example/{i}")))
            .unwrap();
    }
    assert_eq!(score_pending(&mut store, &Scorer::default(), 2).unwrap().updated, 2);
    assert_eq!(store.unscored(10).unwrap().len(), 3);
    assert_eq!(score_pending(&mut store, &Scorer::default(), 10).unwrap().updated, 3);
    assert!(store.unscored(10).unwrap().is_empty());
}
