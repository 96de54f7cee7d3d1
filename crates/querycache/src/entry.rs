//! The per-key cache state machine.
//!
//! A [`CacheEntry`] holds the latest outcome of fetching one set of variables of a
//! [`Query`](crate::Query). It moves through the following states:
//!
//! ```text
//!  pending ──fetch──▶ loading ──ok──▶ success ──fetch──▶ loading ...
//!                        └─────err──▶ error   ──fetch──▶ loading ...
//! ```
//!
//! While `loading`, exactly one fetch is in flight, and every further `fetch` call attaches to it
//! instead of invoking the fetcher again. Settled outcomes are served from the cache for as long
//! as they are within the caller's freshness window.
//!
//! Entries are reference counted by their observers. Once the count drops to zero, an eviction
//! timer is armed, and when it fires with the count still at zero, the entry is removed from its
//! query. Handles to an evicted entry stay memory-safe, but every operation through them fails
//! with [`QueryError::Evicted`]. A fetch that was in flight during the eviction still runs to
//! completion, its result is dropped.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{FetchError, QueryError};
use crate::fetcher::{FetchResult, Fetcher};
use crate::key::CacheKey;
use crate::utils::timer::{TimerId, TimerSlot};

/// The future returned by [`CacheEntry::fetch`], resolving to the shared outcome.
pub type FetchFuture<D> = BoxFuture<'static, Result<Arc<D>, QueryError>>;

type InFlight<D> = Shared<FetchFuture<D>>;

pub(crate) type EvictHook = Arc<dyn Fn(&CacheKey, TimerId) + Send + Sync>;

/// The lifecycle status of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Nothing was fetched yet.
    Pending,
    /// A fetch is in flight.
    Loading,
    /// The last fetch produced data.
    Success,
    /// The last fetch failed.
    Error,
}

impl Status {
    /// Whether this is one of the terminal states, `success` or `error`.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// A snapshot of the state of a [`CacheEntry`].
///
/// `data` is present exactly after a successful fetch, `error` exactly after a failed one. While
/// `loading`, both keep the outcome of the previous fetch. Timestamps are `None` until the
/// respective event happened for the first time.
pub struct EntryState<D> {
    /// Increases by one with every transition.
    pub revision: u64,
    pub status: Status,
    pub data: Option<Arc<D>>,
    pub error: Option<QueryError>,
    /// When the entry last settled, with either outcome.
    pub updated_at: Option<Instant>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
}

impl<D> EntryState<D> {
    fn pending() -> Self {
        Self {
            revision: 0,
            status: Status::Pending,
            data: None,
            error: None,
            updated_at: None,
            data_updated_at: None,
            error_updated_at: None,
        }
    }

    /// Whether the last outcome is younger than `window`.
    ///
    /// A window of [`Duration::MAX`] means "fresh forever once fetched", a zero window is never
    /// fresh.
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.is_fresh_at(window, Instant::now())
    }

    pub fn is_fresh_at(&self, window: Duration, now: Instant) -> bool {
        self.updated_at
            .is_some_and(|updated_at| now.saturating_duration_since(updated_at) < window)
    }
}

impl<D> Clone for EntryState<D> {
    fn clone(&self) -> Self {
        Self {
            revision: self.revision,
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for EntryState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryState")
            .field("revision", &self.revision)
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("updated_at", &self.updated_at)
            .field("data_updated_at", &self.data_updated_at)
            .field("error_updated_at", &self.error_updated_at)
            .finish()
    }
}

pub(crate) struct StateChange<D> {
    state: EntryState<D>,
    previous: EntryState<D>,
}

struct EntryInner<D> {
    state: EntryState<D>,
    in_flight: Option<InFlight<D>>,
    ref_count: usize,
    eviction_timer: TimerSlot,
    evicted: bool,
}

struct EntryShared<F: Fetcher> {
    query: Arc<str>,
    key: CacheKey,
    variables: F::Variables,
    fetcher: Arc<F>,
    eviction_delay: Option<Duration>,
    runtime: Handle,
    on_evict: EvictHook,
    inner: Mutex<EntryInner<F::Data>>,
    broadcaster: Arc<Broadcaster<StateChange<F::Data>>>,
}

/// Everything a [`CacheEntry`] needs from its query.
pub(crate) struct EntryConfig<F: Fetcher> {
    pub query: Arc<str>,
    pub key: CacheKey,
    pub variables: F::Variables,
    pub fetcher: Arc<F>,
    pub eviction_delay: Option<Duration>,
    pub runtime: Handle,
    pub on_evict: EvictHook,
}

/// A handle to the cache entry of one set of variables within a [`Query`](crate::Query).
///
/// Handles are cheap to clone. The entry itself is owned by its query; see the
/// [module docs](self) for what happens to handles of evicted entries.
pub struct CacheEntry<F: Fetcher> {
    shared: Arc<EntryShared<F>>,
}

impl<F: Fetcher> Clone for CacheEntry<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: Fetcher> fmt::Debug for CacheEntry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.try_lock();
        f.debug_struct("CacheEntry")
            .field("query", &self.shared.query)
            .field("key", &self.shared.key)
            .field("status", &inner.as_ref().map(|inner| inner.state.status).ok())
            .field("ref_count", &inner.as_ref().map(|inner| inner.ref_count).ok())
            .finish()
    }
}

impl<F: Fetcher> CacheEntry<F> {
    pub(crate) fn new(config: EntryConfig<F>) -> Self {
        let EntryConfig {
            query,
            key,
            variables,
            fetcher,
            eviction_delay,
            runtime,
            on_evict,
        } = config;

        let shared = Arc::new(EntryShared {
            query,
            key,
            variables,
            fetcher,
            eviction_delay,
            runtime,
            on_evict,
            inner: Mutex::new(EntryInner {
                state: EntryState::pending(),
                in_flight: None,
                ref_count: 0,
                eviction_timer: TimerSlot::default(),
                evicted: false,
            }),
            broadcaster: Arc::new(Broadcaster::new()),
        });

        // nobody uses a fresh entry yet
        shared.schedule_eviction(&mut shared.inner.lock().unwrap());

        Self { shared }
    }

    /// The name of the query this entry belongs to.
    pub fn query_name(&self) -> &str {
        &self.shared.query
    }

    pub fn key(&self) -> &CacheKey {
        &self.shared.key
    }

    pub fn variables(&self) -> &F::Variables {
        &self.shared.variables
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> EntryState<F::Data> {
        self.shared.inner.lock().unwrap().state.clone()
    }

    /// Whether the current outcome is younger than `window`.
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.shared.inner.lock().unwrap().state.is_fresh(window)
    }

    /// The number of active users, usually observers.
    pub fn ref_count(&self) -> usize {
        self.shared.inner.lock().unwrap().ref_count
    }

    /// Whether this entry has been evicted from its query.
    pub fn is_evicted(&self) -> bool {
        self.shared.inner.lock().unwrap().evicted
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Whether both handles refer to the same entry.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Fetches the data, unless a fresh enough outcome is cached.
    ///
    /// The work starts eagerly: when this returns, the entry either already serves a cached
    /// outcome, or a fetch is in flight. The returned future only waits for the outcome and may
    /// be dropped without cancelling anything.
    ///
    /// - If a fetch is in flight, this attaches to it. The fetcher is never invoked twice
    ///   concurrently.
    /// - If the entry settled less than `freshness_window` ago, the cached data (or error) is
    ///   returned.
    /// - Otherwise the entry transitions to `loading` and the fetcher is invoked in the
    ///   background.
    pub fn fetch(&self, freshness_window: Duration) -> FetchFuture<F::Data> {
        let shared = &self.shared;
        metric!(counter("query.access") += 1, "query" => &shared.query);

        let mut inner = shared.inner.lock().unwrap();
        if inner.evicted {
            return future::ready(Err(shared.evicted_error())).boxed();
        }

        if let Some(in_flight) = &inner.in_flight {
            metric!(counter("query.dedup") += 1, "query" => &shared.query);
            tracing::trace!(query = %shared.query, key = %shared.key, "attaching to in-flight fetch");
            return in_flight.clone().boxed();
        }

        if inner.state.is_fresh(freshness_window) {
            let cached = match inner.state.status {
                Status::Success => inner.state.data.clone().map(Ok),
                Status::Error => inner.state.error.clone().map(Err),
                Status::Pending | Status::Loading => None,
            };
            if let Some(cached) = cached {
                metric!(counter("query.fresh_hit") += 1, "query" => &shared.query);
                tracing::trace!(query = %shared.query, key = %shared.key, "serving fresh outcome");
                return future::ready(cached).boxed();
            }
        }

        let in_flight = shared.spawn_fetch();
        inner.in_flight = Some(in_flight.clone());

        let previous = inner.state.clone();
        inner.state.revision += 1;
        inner.state.status = Status::Loading;
        shared.broadcaster.push(StateChange {
            state: inner.state.clone(),
            previous,
        });
        drop(inner);
        shared.broadcaster.drain();

        in_flight.boxed()
    }

    /// Fetches the data, ignoring any cached outcome.
    ///
    /// This still attaches to a fetch that is already in flight.
    pub fn refetch(&self) -> FetchFuture<F::Data> {
        self.fetch(Duration::ZERO)
    }

    /// Registers a user of this entry, which keeps it from being evicted.
    ///
    /// Fails if the entry has already been evicted.
    pub fn retain(&self) -> Result<(), QueryError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.evicted {
            return Err(self.shared.evicted_error());
        }
        inner.ref_count += 1;
        inner.eviction_timer.cancel();
        Ok(())
    }

    /// Unregisters a user of this entry.
    ///
    /// When the last user is gone, the eviction timer is armed with the query's eviction delay.
    /// A delay of zero or `None` disables eviction. Releasing more often than retaining is a bug
    /// in the caller and fails with [`QueryError::RefCountUnderflow`].
    pub fn release(&self) -> Result<(), QueryError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        if inner.ref_count == 0 {
            tracing::error!(query = %shared.query, key = %shared.key, "cache entry released without being used");
            return Err(QueryError::RefCountUnderflow {
                query: Arc::clone(&shared.query),
                key: shared.key.clone(),
            });
        }
        inner.ref_count -= 1;
        if inner.ref_count == 0 {
            shared.schedule_eviction(&mut inner);
        }
        Ok(())
    }

    /// Registers a listener that is called with `(new_state, previous_state)` on every
    /// transition of this entry.
    ///
    /// Listeners are called in the order in which transitions happen, and only for transitions
    /// after they subscribed.
    pub fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn(&EntryState<F::Data>, &EntryState<F::Data>) + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        let id = broadcaster.subscribe(Arc::new(move |change: &StateChange<F::Data>| {
            listener(&change.state, &change.previous)
        }));
        Subscription::new(Arc::downgrade(broadcaster), id)
    }

    /// Seeds a never-fetched entry with a previously persisted successful outcome.
    ///
    /// Returns `false`, without changing anything, if the entry is not `pending`.
    pub fn hydrate(&self, data: Arc<F::Data>, data_updated_at: Instant) -> bool {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        if inner.evicted || inner.state.status != Status::Pending {
            return false;
        }

        let previous = inner.state.clone();
        let state = &mut inner.state;
        state.revision += 1;
        state.status = Status::Success;
        state.data = Some(data);
        state.updated_at = Some(data_updated_at);
        state.data_updated_at = Some(data_updated_at);
        shared.broadcaster.push(StateChange {
            state: state.clone(),
            previous,
        });
        drop(inner);
        shared.broadcaster.drain();
        true
    }

    /// Marks the entry as evicted if `timer` is its armed eviction timer and it is still unused.
    pub(crate) fn try_evict(&self, timer: TimerId) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.ref_count > 0 || !inner.eviction_timer.take_fired(timer) {
            return false;
        }
        inner.evicted = true;
        true
    }
}

impl<F: Fetcher> EntryShared<F> {
    fn evicted_error(&self) -> QueryError {
        QueryError::Evicted {
            query: Arc::clone(&self.query),
            key: self.key.clone(),
        }
    }

    fn schedule_eviction(&self, inner: &mut EntryInner<F::Data>) {
        if inner.eviction_timer.is_armed() {
            return;
        }
        let Some(delay) = self.eviction_delay.filter(|delay| !delay.is_zero()) else {
            return;
        };
        // a delay too large to represent means "never"
        let Some(deadline) = Instant::now().checked_add(delay) else {
            return;
        };

        tracing::trace!(query = %self.query, key = %self.key, ?delay, "scheduling eviction");
        let on_evict = Arc::clone(&self.on_evict);
        let key = self.key.clone();
        inner
            .eviction_timer
            .arm(&self.runtime, deadline, move |timer| on_evict(&key, timer));
    }

    /// Invokes the fetcher on the runtime and returns a shareable handle to its outcome.
    ///
    /// The spawned task settles the entry itself, so the fetch runs to completion even if
    /// nobody waits for it.
    fn spawn_fetch(self: &Arc<Self>) -> InFlight<F::Data> {
        metric!(counter("query.fetch") += 1, "query" => &self.query);
        tracing::debug!(query = %self.query, key = %self.key, "fetching");

        let entry = Arc::clone(self);
        let task = async move {
            let start = Instant::now();
            let variables = entry.variables.clone();
            let fetcher = Arc::clone(&entry.fetcher);
            let outcome = AssertUnwindSafe(async move { fetcher.fetch(variables).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("fetcher panicked")));
            metric!(timer("query.fetch.duration") = start.elapsed(), "query" => &entry.query);

            let result = entry.check_outcome(outcome);
            entry.settle(result.clone());
            result
        };
        let handle = self
            .runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        let query = Arc::clone(&self.query);
        async move {
            handle.await.unwrap_or_else(|err| {
                Err(QueryError::Fetch {
                    query,
                    source: anyhow::Error::new(err)
                        .context("fetch task was aborted")
                        .into(),
                })
            })
        }
        .boxed()
        .shared()
    }

    fn check_outcome(&self, outcome: FetchResult<F::Data>) -> Result<Arc<F::Data>, QueryError> {
        match outcome {
            Ok(Some(data)) => Ok(Arc::new(data)),
            Ok(None) => {
                tracing::error!(
                    query = %self.query,
                    key = %self.key,
                    "fetcher resolved without data, fetchers must produce data or fail",
                );
                Err(QueryError::MissingData {
                    query: Arc::clone(&self.query),
                    key: self.key.clone(),
                })
            }
            Err(err) => {
                metric!(counter("query.fetch.error") += 1, "query" => &self.query);
                let source = FetchError::from(err);
                tracing::debug!(query = %self.query, key = %self.key, error = %source, "fetch failed");
                Err(QueryError::Fetch {
                    query: Arc::clone(&self.query),
                    source,
                })
            }
        }
    }

    fn settle(&self, result: Result<Arc<F::Data>, QueryError>) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = None;
        if inner.evicted {
            metric!(counter("query.stale_result") += 1, "query" => &self.query);
            tracing::debug!(query = %self.query, key = %self.key, "dropping result of evicted entry");
            return;
        }

        let now = Instant::now();
        let previous = inner.state.clone();
        let state = &mut inner.state;
        state.revision += 1;
        state.updated_at = Some(now);
        match result {
            Ok(data) => {
                state.status = Status::Success;
                state.data = Some(data);
                state.error = None;
                state.data_updated_at = Some(now);
            }
            Err(err) => {
                state.status = Status::Error;
                state.data = None;
                state.error = Some(err);
                state.error_updated_at = Some(now);
            }
        }
        self.broadcaster.push(StateChange {
            state: state.clone(),
            previous,
        });
        drop(inner);
        self.broadcaster.drain();
    }
}
