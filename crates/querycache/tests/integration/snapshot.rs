use std::time::Duration;

use querycache::{EntrySnapshot, JsonFileStore, ObserverOptions, SnapshotStore, Status};

use crate::{Outcome, TestFetcher, team, test, users_fetcher};

#[tokio::test(start_paused = true)]
async fn test_snapshot_roundtrip() {
    test::setup();

    let cache_dir = test::tempdir();
    let store = JsonFileStore::new(cache_dir.path().join("users.json"));

    let fetcher = TestFetcher::new(Duration::from_secs(1), |team: String, _| {
        if team == "broken" {
            Outcome::Fail("no such team".into())
        } else {
            Outcome::Data(vec![format!("{team}/alice")])
        }
    });
    let before = test::query("users", fetcher.clone(), None);
    for name in ["core", "web", "broken"] {
        let _ = before.fetch(&team(name), Duration::ZERO).await;
    }
    before.save_snapshot(&store).unwrap();

    // only successful entries are persisted
    let saved: Vec<EntrySnapshot<String, Vec<String>>> = store.load().unwrap();
    let keys: Vec<_> = saved.iter().map(|s| s.key.to_string()).collect();
    assert_eq!(keys, [r#""core""#, r#""web""#]);

    let after_fetcher = users_fetcher(Duration::from_secs(1));
    let after = test::query("users", after_fetcher.clone(), None);
    assert_eq!(after.load_snapshot(&store).unwrap(), 2);

    let entry = after.find_entry(&team("core")).unwrap().unwrap();
    let state = entry.state();
    assert_eq!(state.status, Status::Success);
    assert_eq!(*state.data.unwrap(), vec!["core/alice".to_owned()]);

    // restored data is as fresh as it was when it was saved
    let observer = after
        .observe(
            &team("web"),
            ObserverOptions {
                freshness_window: Duration::from_secs(60 * 60),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(observer.state().status, Status::Success);
    assert_eq!(
        observer.fetch().await.unwrap().as_slice(),
        ["web/alice".to_owned()]
    );
    assert_eq!(after_fetcher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restore_keeps_fetched_entries() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(1));
    let query = test::query("users", fetcher.clone(), None);
    let current = query.fetch(&team("core"), Duration::ZERO).await.unwrap();

    let snapshots = vec![
        EntrySnapshot {
            key: query.key_of(&team("core")).unwrap(),
            variables: team("core"),
            data: vec!["Mallory".to_owned()].into(),
            data_updated_at: chrono::Utc::now(),
        },
        EntrySnapshot {
            key: "mismatch".into(),
            variables: team("web"),
            data: vec!["Mallory".to_owned()].into(),
            data_updated_at: chrono::Utc::now(),
        },
    ];
    assert_eq!(query.restore(snapshots).unwrap(), 0);

    let state = query.find_entry(&team("core")).unwrap().unwrap().state();
    assert_eq!(state.data.unwrap(), current);

    // a skipped snapshot leaves no entry behind
    assert!(query.find_entry(&team("web")).unwrap().is_none());
    assert_eq!(query.entry_count(), 1);
}
