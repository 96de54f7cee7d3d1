use std::time::Duration;

use querycache::{ObserverOptions, Status};

use crate::{flaky_fetcher, record_observed, record_statuses, team, test, users_fetcher};

#[tokio::test(start_paused = true)]
async fn test_users_scenario() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_secs(2));
    let query = test::query("users", fetcher.clone(), None);

    let entry = query.find_or_create_entry(&team("core")).unwrap();
    assert_eq!(entry.state().status, Status::Pending);
    let (statuses, _subscription) = record_statuses(&entry);

    let options = ObserverOptions {
        refetch_on_mount: false,
        ..Default::default()
    };
    let first = query.observe(&team("core"), options.clone()).unwrap();
    assert_eq!(first.state().status, Status::Loading);

    // a second observer joins while the fetch is in flight
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = query.observe(&team("core"), options).unwrap();
    assert_eq!(second.state().status, Status::Loading);
    let (second_states, _second_subscription) = record_observed(&second);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(*statuses.lock().unwrap(), [Status::Loading, Status::Success]);

    let expected = vec!["Alice".to_owned(), "Bob".to_owned()];
    for observer in [&first, &second] {
        let state = observer.state();
        assert_eq!(state.status, Status::Success);
        assert_eq!(state.data.as_deref(), Some(&expected));
        assert!(state.error.is_none());
    }

    let second_states = second_states.lock().unwrap();
    assert_eq!(second_states.len(), 1);
    assert_eq!(second_states[0].status, Status::Success);
}

#[tokio::test(start_paused = true)]
async fn test_alternating_failure_and_success() {
    test::setup();

    let fetcher = flaky_fetcher(Duration::from_secs(1));
    let query = test::query("flaky", fetcher.clone(), None);
    let observer = query.observe(&team("core"), ObserverOptions::default()).unwrap();

    // the mount fetch fails
    let err = observer.fetch().await.unwrap_err();
    assert!(err.is_fetch_failure());
    let failed = observer.state();
    assert_eq!(failed.status, Status::Error);
    assert!(failed.is_error() && !failed.is_success());
    assert!(failed.error_updated_at.is_some());
    assert!(failed.data_updated_at.is_none());

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(*observer.refetch().await.unwrap(), 1);
    assert_eq!(fetcher.calls(), 2);

    let succeeded = observer.state();
    assert_eq!(succeeded.status, Status::Success);
    assert_eq!(succeeded.data.as_deref(), Some(&1));
    assert!(succeeded.error.is_none());
    assert!(succeeded.is_success() && !succeeded.is_error());
    assert_eq!(succeeded.error_updated_at, failed.error_updated_at);
    assert!(succeeded.data_updated_at > succeeded.error_updated_at);
    assert_eq!(succeeded.updated_at, succeeded.data_updated_at);

    // and the next failure clears the data again
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(observer.refetch().await.is_err());
    let failed_again = observer.state();
    assert_eq!(failed_again.status, Status::Error);
    assert!(failed_again.data.is_none());
    assert_eq!(failed_again.data_updated_at, succeeded.data_updated_at);
    assert!(failed_again.error_updated_at > failed_again.data_updated_at);
    assert_eq!(fetcher.calls(), 3);
}
