//! Helpers for testing the query cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Run timing-dependent tests with `#[tokio::test(start_paused = true)]`. All fetcher doubles
//!    sleep with [`tokio::time::sleep`], so virtual time advances deterministically.
//!
//!  - A [`TestFetcher`] is moved into its query. Keep a clone around to inspect its counters.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use querycache::{Config, FetchResult, Fetcher, Query, QueryOptions, Registry};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `querycache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("querycache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// What a [`TestFetcher`] does on one invocation.
#[derive(Debug, Clone)]
pub enum Outcome<D> {
    /// Resolve with data.
    Data(D),
    /// Fail with the given message.
    Fail(String),
    /// Resolve without data, which fetchers must never do.
    NoData,
    /// Panic inside the fetch future.
    Panic,
}

type Respond<V, D> = dyn Fn(V, usize) -> Outcome<D> + Send + Sync;

/// A [`Fetcher`] double that sleeps for a fixed delay and counts its invocations.
///
/// The response function receives the variables and the zero-based number of the invocation.
pub struct TestFetcher<V, D> {
    delay: Duration,
    respond: Arc<Respond<V, D>>,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl<V, D> TestFetcher<V, D> {
    pub fn new<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(V, usize) -> Outcome<D> + Send + Sync + 'static,
    {
        Self {
            delay,
            respond: Arc::new(respond),
            calls: Default::default(),
            running: Default::default(),
            max_running: Default::default(),
        }
    }

    /// The number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The highest number of fetches that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl<V, D> Clone for TestFetcher<V, D> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            respond: Arc::clone(&self.respond),
            calls: Arc::clone(&self.calls),
            running: Arc::clone(&self.running),
            max_running: Arc::clone(&self.max_running),
        }
    }
}

impl<V, D> fmt::Debug for TestFetcher<V, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFetcher")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish()
    }
}

impl<V, D> Fetcher for TestFetcher<V, D>
where
    V: Serialize + Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    type Variables = V;
    type Data = D;

    fn fetch(&self, variables: V) -> BoxFuture<'static, FetchResult<D>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let delay = self.delay;
        let respond = Arc::clone(&self.respond);
        async move {
            tokio::time::sleep(delay).await;
            running.fetch_sub(1, Ordering::SeqCst);
            match respond(variables, call) {
                Outcome::Data(data) => Ok(Some(data)),
                Outcome::Fail(message) => Err(anyhow::anyhow!(message)),
                Outcome::NoData => Ok(None),
                Outcome::Panic => panic!("fetcher exploded"),
            }
        }
        .boxed()
    }
}

/// A fetcher resolving every team to `["Alice", "Bob"]` after `delay`.
pub fn users_fetcher(delay: Duration) -> TestFetcher<String, Vec<String>> {
    TestFetcher::new(delay, |_team, _call| {
        Outcome::Data(vec!["Alice".to_owned(), "Bob".to_owned()])
    })
}

/// A fetcher that fails on every even invocation and succeeds with the invocation number on
/// every odd one, starting with a failure.
pub fn flaky_fetcher(delay: Duration) -> TestFetcher<String, usize> {
    TestFetcher::new(delay, |_variables, call| {
        if call % 2 == 0 {
            Outcome::Fail(format!("attempt {call} failed"))
        } else {
            Outcome::Data(call)
        }
    })
}

/// A registry with default configuration on the current runtime.
pub fn registry() -> Registry {
    Registry::new(&Config::default(), tokio::runtime::Handle::current())
}

/// A standalone query on the current runtime with the given eviction delay.
pub fn query<F: Fetcher>(name: &str, fetcher: F, eviction_delay: Option<Duration>) -> Query<F> {
    let options = QueryOptions {
        eviction_delay,
        ..Default::default()
    };
    Query::new(name, fetcher, options, tokio::runtime::Handle::current())
}
