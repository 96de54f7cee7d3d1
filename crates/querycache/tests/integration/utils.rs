use std::sync::{Arc, Mutex};

use querycache::{CacheEntry, Fetcher, ObservedState, Observer, Status, Subscription};

pub use querycache_test as test;
pub use querycache_test::{Outcome, TestFetcher, flaky_fetcher, users_fetcher};

/// Records the status of every transition of `entry`.
pub fn record_statuses<F: Fetcher>(entry: &CacheEntry<F>) -> (Arc<Mutex<Vec<Status>>>, Subscription) {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let statuses_ref = Arc::clone(&statuses);
    let subscription = entry.subscribe(move |state, _previous| {
        statuses_ref.lock().unwrap().push(state.status);
    });
    (statuses, subscription)
}

/// Records every state `observer` broadcasts.
pub fn record_observed<F, T>(
    observer: &Observer<F, T>,
) -> (Arc<Mutex<Vec<ObservedState<T>>>>, Subscription)
where
    F: Fetcher,
    T: Clone + Send + Sync + 'static,
{
    let states = Arc::new(Mutex::new(Vec::new()));
    let states_ref = Arc::clone(&states);
    let subscription = observer.subscribe(move |state, _previous| {
        states_ref.lock().unwrap().push(state.clone());
    });
    (states, subscription)
}

pub fn team(name: &str) -> String {
    name.to_owned()
}
