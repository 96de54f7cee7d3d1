use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use querycache::{ObserverOptions, Status};

use crate::{team, test, users_fetcher};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observers_race_on_one_entry() {
    test::setup();

    let fetcher = users_fetcher(Duration::from_millis(5));
    let query = test::query("users", fetcher.clone(), None);
    let entry = query.find_or_create_entry(&team("core")).unwrap();

    let loading = Arc::new(AtomicUsize::new(0));
    let loading_ref = Arc::clone(&loading);
    let _subscription = entry.subscribe(move |state, _previous| {
        if state.status == Status::Loading {
            loading_ref.fetch_add(1, Ordering::SeqCst);
        }
    });

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let query = query.clone();
            tokio::spawn(async move {
                let options = ObserverOptions {
                    refetch_on_mount: i % 3 == 0,
                    ..Default::default()
                };
                let observer = query.observe(&team("core"), options).unwrap();
                let result = if i % 2 == 0 {
                    observer.fetch().await
                } else {
                    observer.refetch().await
                };
                assert_eq!(result.unwrap().len(), 2);
                if i % 5 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                drop(observer);
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    // the last transitions may still be delivered by another worker
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(entry.state().status, Status::Success);
    assert_eq!(entry.ref_count(), 0);
    assert_eq!(fetcher.max_concurrency(), 1);
    assert!(fetcher.calls() >= 1);
    assert_eq!(fetcher.calls(), loading.load(Ordering::SeqCst));
}
