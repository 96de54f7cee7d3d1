use std::time::Duration;

use querycache::{ObserverOptions, QueryError, Status};

use crate::{team, test, users_fetcher};

const DELAY: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_unused_entry_is_evicted_after_delay() {
    test::setup();

    let query = test::query("users", users_fetcher(Duration::from_secs(1)), Some(DELAY));
    let observer = query.observe(&team("core"), ObserverOptions::default()).unwrap();
    observer.fetch().await.unwrap();
    let entry = observer.entry().clone();

    // observed entries are never evicted
    tokio::time::sleep(DELAY * 10).await;
    assert_eq!(query.entry_count(), 1);

    drop(observer);
    assert_eq!(entry.ref_count(), 0);

    tokio::time::sleep(DELAY - Duration::from_secs(1)).await;
    assert_eq!(query.entry_count(), 1);
    assert!(!entry.is_evicted());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(query.entry_count(), 0);
    assert!(entry.is_evicted());
    assert!(query.find_entry(&team("core")).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reuse_before_delay_cancels_eviction() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(1));
    let query = test::query("users", fetcher.clone(), Some(DELAY));

    let first = query.observe(&team("core"), ObserverOptions::default()).unwrap();
    first.fetch().await.unwrap();
    let entry = first.entry().clone();
    drop(first);

    tokio::time::sleep(DELAY / 2).await;
    let second = query.observe(&team("core"), ObserverOptions::default()).unwrap();
    assert!(second.entry().ptr_eq(&entry));

    tokio::time::sleep(DELAY * 2).await;
    assert!(!entry.is_evicted());
    assert_eq!(query.entry_count(), 1);

    // the delay starts over once the entry is unused again
    drop(second);
    tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
    assert!(entry.is_evicted());
}

#[tokio::test(start_paused = true)]
async fn test_eviction_waits_for_last_release() {
    test::setup();

    let query = test::query("users", users_fetcher(Duration::from_secs(1)), Some(DELAY));
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    entry.retain().unwrap();
    entry.retain().unwrap();
    entry.release().unwrap();
    assert_eq!(entry.ref_count(), 1);

    tokio::time::sleep(DELAY * 2).await;
    assert!(!entry.is_evicted());

    entry.release().unwrap();
    tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
    assert!(entry.is_evicted());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_eviction() {
    test::setup();

    for delay in [None, Some(Duration::ZERO), Some(Duration::MAX)] {
        let query = test::query("users", users_fetcher(Duration::from_secs(1)), delay);
        let entry = query.find_or_create_entry(&team("core")).unwrap();
        entry.retain().unwrap();
        entry.release().unwrap();

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        assert!(!entry.is_evicted(), "evicted with delay {delay:?}");
        assert_eq!(query.entry_count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_release_without_retain_fails() {
    test::setup();

    let query = test::query("users", users_fetcher(Duration::from_secs(1)), Some(DELAY));
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    assert!(matches!(
        entry.release(),
        Err(QueryError::RefCountUnderflow { .. })
    ));
    assert_eq!(entry.ref_count(), 0);

    // other entries are unaffected
    let other = query.find_or_create_entry(&team("web")).unwrap();
    other.retain().unwrap();
    assert_eq!(other.ref_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_handles_fail_explicitly() {
    test::setup();

    let query = test::query("users", users_fetcher(Duration::from_secs(1)), Some(DELAY));
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
    assert!(entry.is_evicted());

    assert!(matches!(entry.retain(), Err(QueryError::Evicted { .. })));
    assert!(matches!(
        entry.fetch(Duration::ZERO).await,
        Err(QueryError::Evicted { .. })
    ));
    assert!(!entry.hydrate(std::sync::Arc::new(vec![]), tokio::time::Instant::now()));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_fetch_outlives_eviction() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(10));
    let query = test::query("users", fetcher.clone(), Some(Duration::from_secs(1)));
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    let fetch = entry.fetch(Duration::ZERO);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(entry.is_evicted());
    assert_eq!(query.entry_count(), 0);

    // the fetch still completes, but its result is not written anywhere
    let data = fetch.await.unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(fetcher.calls(), 1);
    assert!(entry.state().data.is_none());

    let recreated = query.find_or_create_entry(&team("core")).unwrap();
    assert!(!recreated.ptr_eq(&entry));
    assert_eq!(recreated.state().status, Status::Pending);
}
