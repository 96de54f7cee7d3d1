use std::sync::Arc;
use std::time::Duration;

use querycache::{QueryError, Status};

use crate::{Outcome, TestFetcher, flaky_fetcher, team, test, users_fetcher};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_invocation() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(1));
    let query = test::query("users", fetcher.clone(), None);
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    let fetches: Vec<_> = (0..10)
        .map(|i| {
            if i % 2 == 0 {
                entry.fetch(Duration::ZERO)
            } else {
                entry.refetch()
            }
        })
        .collect();
    assert_eq!(entry.state().status, Status::Loading);

    let results = futures::future::join_all(fetches).await;
    assert_eq!(fetcher.calls(), 1);

    let first = results[0].as_ref().unwrap();
    assert_eq!(**first, vec!["Alice".to_owned(), "Bob".to_owned()]);
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_caller_attaches_to_running_fetch() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(10));
    let query = test::query("users", fetcher.clone(), None);

    let early = query.fetch(&team("core"), Duration::ZERO);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let late = query.refetch(&team("core"));

    let (early, late) = futures::join!(early, late);
    assert!(Arc::ptr_eq(&early.unwrap(), &late.unwrap()));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_shared() {
    test::setup();

    let fetcher = flaky_fetcher(Duration::from_secs(1));
    let query = test::query("flaky", fetcher.clone(), None);

    let (a, b) = futures::join!(
        query.fetch(&team("core"), Duration::ZERO),
        query.refetch(&team("core"))
    );
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(a.is_fetch_failure());
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(fetcher.calls(), 1);

    let state = query.find_entry(&team("core")).unwrap().unwrap().state();
    assert_eq!(state.status, Status::Error);
    assert!(state.data.is_none());
    assert!(state.error.is_some());
    assert!(state.error_updated_at.is_some());
    assert!(state.data_updated_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_fetch_independently() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(1));
    let query = test::query("users", fetcher.clone(), None);

    let (a, b) = futures::join!(
        query.fetch(&team("core"), Duration::ZERO),
        query.fetch(&team("web"), Duration::ZERO)
    );
    assert!(!Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fetcher.max_concurrency(), 2);
    assert_eq!(query.entry_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_continues_without_waiters() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(1));
    let query = test::query("users", fetcher.clone(), None);
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    drop(entry.fetch(Duration::ZERO));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(entry.state().status, Status::Success);
}

#[tokio::test(start_paused = true)]
async fn test_missing_data_fails_loudly() {
    test::setup();

    let fetcher =
        TestFetcher::<String, u32>::new(Duration::from_secs(1), |_, _| Outcome::NoData);
    let query = test::query("broken", fetcher.clone(), None);

    let err = query
        .fetch(&team("core"), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::MissingData { .. }));
    assert!(!err.is_fetch_failure());

    // the violation is stored like any other failure, it is never treated as cached data
    let entry = query.find_entry(&team("core")).unwrap().unwrap();
    let state = entry.state();
    assert_eq!(state.status, Status::Error);
    assert!(state.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetcher_settles_entry() {
    test::setup();

    let fetcher = TestFetcher::<String, u32>::new(Duration::from_secs(1), |_, call| {
        if call == 0 {
            Outcome::Panic
        } else {
            Outcome::Data(7)
        }
    });
    let query = test::query("panicky", fetcher.clone(), None);

    let err = query.fetch(&team("core"), Duration::ZERO).await.unwrap_err();
    assert!(err.is_fetch_failure());
    assert!(err.to_string().contains("fetcher panicked"));

    let entry = query.find_entry(&team("core")).unwrap().unwrap();
    assert_eq!(entry.state().status, Status::Error);

    // the entry is not stuck and can be fetched again
    assert_eq!(*entry.refetch().await.unwrap(), 7);
    assert_eq!(fetcher.calls(), 2);
}
