//! Consumer-facing views of cache entries.
//!
//! An [`Observer`] binds one consumer to the [`CacheEntry`] of a set of variables. It keeps the
//! entry alive while it exists, drives fetches according to its own policy and projects the
//! entry state through a transform into an [`ObservedState`], which it rebroadcasts to its own
//! subscribers. Many observers with different policies can share one entry.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::QueryDefaults;
use crate::entry::{CacheEntry, EntryState, FetchFuture, Status};
use crate::error::QueryError;
use crate::fetcher::Fetcher;
use crate::key::CacheKey;
use crate::query::Query;
use crate::utils::timer::{TimerId, TimerSlot};

/// Maps fetched data into the value an observer exposes.
///
/// Observers memoize the result per data reference, a transform runs once for every distinct
/// successful fetch, regardless of how often the entry broadcasts.
pub struct Transform<D, T>(Arc<dyn Fn(&Arc<D>) -> T + Send + Sync>);

impl<D, T> Transform<D, T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Arc<D>) -> T + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl<D: 'static> Transform<D, Arc<D>> {
    /// Exposes the data as it was fetched.
    pub fn identity() -> Self {
        Self::new(Arc::clone)
    }
}

impl<D, T> Clone for Transform<D, T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D, T> fmt::Debug for Transform<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform")
    }
}

/// The policy of an [`Observer`].
#[derive(Clone, Debug)]
pub struct ObserverOptions<D, T = Arc<D>> {
    pub transform: Transform<D, T>,
    /// Refetch this long after every outcome. `None` or zero disables polling.
    pub poll_interval: Option<Duration>,
    /// How old a cached outcome may be to be used without fetching.
    pub freshness_window: Duration,
    /// Always fetch when the observer is created, even if the cached outcome is fresh.
    pub refetch_on_mount: bool,
}

impl<D: 'static> ObserverOptions<D> {
    pub fn from_config(config: &QueryDefaults) -> Self {
        Self {
            transform: Transform::identity(),
            poll_interval: config.poll_interval,
            freshness_window: config.freshness_window,
            refetch_on_mount: config.refetch_on_mount,
        }
    }
}

impl<D: 'static> Default for ObserverOptions<D> {
    fn default() -> Self {
        Self::from_config(&QueryDefaults::default())
    }
}

impl<D, T> ObserverOptions<D, T> {
    /// Replaces the transform, keeping the rest of the policy.
    pub fn select<U, F>(self, f: F) -> ObserverOptions<D, U>
    where
        F: Fn(&Arc<D>) -> U + Send + Sync + 'static,
    {
        ObserverOptions {
            transform: Transform::new(f),
            poll_interval: self.poll_interval,
            freshness_window: self.freshness_window,
            refetch_on_mount: self.refetch_on_mount,
        }
    }
}

/// Changes to the policy of a live [`Observer`]. Fields left at `None` are kept.
pub struct PolicyUpdate<D, T> {
    pub transform: Option<Transform<D, T>>,
    pub poll_interval: Option<Option<Duration>>,
    pub freshness_window: Option<Duration>,
}

impl<D, T> Default for PolicyUpdate<D, T> {
    fn default() -> Self {
        Self {
            transform: None,
            poll_interval: None,
            freshness_window: None,
        }
    }
}

/// The state of a cache entry as seen through one [`Observer`].
#[derive(Clone, Debug)]
pub struct ObservedState<T> {
    /// The revision of the entry state this was projected from.
    pub revision: u64,
    pub status: Status,
    /// The transformed data.
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub updated_at: Option<Instant>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    /// Whether the outcome is fresh according to the observer's freshness window.
    pub is_fresh: bool,
}

impl<T> ObservedState<T> {
    fn pending() -> Self {
        Self {
            revision: 0,
            status: Status::Pending,
            data: None,
            error: None,
            updated_at: None,
            data_updated_at: None,
            error_updated_at: None,
            is_fresh: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_settled(&self) -> bool {
        self.is_success() || self.is_error()
    }

    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }
}

struct ObservedChange<T> {
    state: ObservedState<T>,
    previous: ObservedState<T>,
}

struct Projection<D, T> {
    transform: Transform<D, T>,
    poll_interval: Option<Duration>,
    freshness_window: Duration,
    /// The transformed value of the last data, or the error if the transform panicked on it.
    memo: Option<(Arc<D>, Result<T, QueryError>)>,
    /// The last entry state that was applied.
    entry_state: Option<EntryState<D>>,
    observed: ObservedState<T>,
    poll_timer: TimerSlot,
}

impl<D, T: Clone> Projection<D, T> {
    fn project(&mut self, query: &str, key: &CacheKey) -> ObservedState<T> {
        let Self {
            transform,
            freshness_window,
            memo,
            entry_state,
            observed,
            ..
        } = self;
        let Some(entry_state) = entry_state else {
            return observed.clone();
        };

        let transformed = entry_state.data.as_ref().map(|data| {
            if let Some((memo_data, value)) = memo.as_ref() {
                if Arc::ptr_eq(memo_data, data) {
                    return value.clone();
                }
            }
            let value = catch_unwind(AssertUnwindSafe(|| (transform.0)(data))).map_err(|_| {
                tracing::error!(query, key = %key, "observer transform panicked");
                QueryError::TransformPanicked {
                    query: query.into(),
                    key: key.clone(),
                }
            });
            *memo = Some((Arc::clone(data), value.clone()));
            value
        });

        let (data, error) = match transformed {
            Some(Ok(value)) => (Some(value), entry_state.error.clone()),
            Some(Err(err)) => (None, Some(err)),
            None => (None, entry_state.error.clone()),
        };

        ObservedState {
            revision: entry_state.revision,
            status: entry_state.status,
            data,
            error,
            updated_at: entry_state.updated_at,
            data_updated_at: entry_state.data_updated_at,
            error_updated_at: entry_state.error_updated_at,
            is_fresh: entry_state.is_fresh(*freshness_window),
        }
    }

    fn is_fresh(&self) -> bool {
        self.entry_state
            .as_ref()
            .is_some_and(|state| state.is_fresh(self.freshness_window))
    }
}

struct ObserverInner<F: Fetcher, T> {
    entry: CacheEntry<F>,
    state: Mutex<Projection<F::Data, T>>,
    broadcaster: Arc<Broadcaster<ObservedChange<T>>>,
    entry_subscription: Mutex<Option<Subscription>>,
    destroyed: AtomicBool,
}

/// A consumer's handle on the cache entry of one set of variables.
///
/// Creating an observer retains its entry and fetches according to the policy. Destroying it,
/// explicitly or by dropping it, releases the entry, stops polling and unsubscribes, exactly once.
///
/// Polling is relative to the entry's last outcome: the observer refetches `poll_interval` after
/// the entry last settled, no matter which observer triggered that fetch. While a fetch is in
/// flight no poll is scheduled.
pub struct Observer<F: Fetcher, T = Arc<<F as Fetcher>::Data>> {
    inner: Arc<ObserverInner<F, T>>,
}

impl<F, T> Observer<F, T>
where
    F: Fetcher,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        query: &Query<F>,
        variables: &F::Variables,
        options: ObserverOptions<F::Data, T>,
    ) -> Result<Self, QueryError> {
        let ObserverOptions {
            transform,
            poll_interval,
            freshness_window,
            refetch_on_mount,
        } = options;

        let entry = query.acquire_entry(variables)?;
        let inner = Arc::new(ObserverInner {
            entry: entry.clone(),
            state: Mutex::new(Projection {
                transform,
                poll_interval,
                freshness_window,
                memo: None,
                entry_state: None,
                observed: ObservedState::pending(),
                poll_timer: TimerSlot::default(),
            }),
            broadcaster: Arc::new(Broadcaster::new()),
            entry_subscription: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let observer = Arc::downgrade(&inner);
        let subscription = entry.subscribe(move |state, _previous| {
            if let Some(observer) = observer.upgrade() {
                observer.apply(state);
            }
        });
        *inner.entry_subscription.lock().unwrap() = Some(subscription);

        // transitions before the subscription are not delivered
        inner.apply(&entry.state());

        let mount = if refetch_on_mount {
            entry.refetch()
        } else {
            entry.fetch(freshness_window)
        };
        drop(mount);

        tracing::trace!(query = entry.query_name(), key = %entry.key(), "created observer");
        Ok(Self { inner })
    }

    /// Returns the current projected state.
    pub fn state(&self) -> ObservedState<T> {
        let state = self.inner.state.lock().unwrap();
        let mut observed = state.observed.clone();
        observed.is_fresh = state.is_fresh();
        observed
    }

    /// Whether the entry's outcome is fresh according to this observer's freshness window.
    pub fn is_fresh(&self) -> bool {
        self.inner.state.lock().unwrap().is_fresh()
    }

    /// The entry this observer is bound to.
    pub fn entry(&self) -> &CacheEntry<F> {
        &self.inner.entry
    }

    /// Registers a listener that is called with `(new_state, previous_state)` whenever the
    /// projected state changes.
    pub fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn(&ObservedState<T>, &ObservedState<T>) + Send + Sync + 'static,
    {
        let broadcaster = &self.inner.broadcaster;
        let id = broadcaster.subscribe(Arc::new(move |change: &ObservedChange<T>| {
            listener(&change.state, &change.previous)
        }));
        Subscription::new(Arc::downgrade(broadcaster), id)
    }

    /// Fetches using this observer's freshness window, see [`CacheEntry::fetch`].
    pub fn fetch(&self) -> FetchFuture<F::Data> {
        let freshness_window = self.inner.state.lock().unwrap().freshness_window;
        self.inner.entry.fetch(freshness_window)
    }

    /// Fetches, ignoring any cached outcome.
    pub fn refetch(&self) -> FetchFuture<F::Data> {
        self.inner.entry.refetch()
    }

    /// Changes the policy of this observer.
    ///
    /// This never fetches by itself. A changed poll interval is applied relative to the last
    /// outcome of the entry, a changed transform is applied to the current data right away.
    pub fn set_policy(&self, update: PolicyUpdate<F::Data, T>) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        if inner.destroyed.load(Ordering::Acquire) {
            return;
        }

        if let Some(transform) = update.transform {
            state.transform = transform;
            state.memo = None;
        }
        if let Some(freshness_window) = update.freshness_window {
            state.freshness_window = freshness_window;
        }
        if let Some(poll_interval) = update.poll_interval {
            if poll_interval != state.poll_interval {
                state.poll_interval = poll_interval;
                inner.reschedule_poll(&mut state);
            }
        }

        let observed = state.project(inner.entry.query_name(), inner.entry.key());
        let previous = std::mem::replace(&mut state.observed, observed.clone());
        inner.broadcaster.push(ObservedChange {
            state: observed,
            previous,
        });
        drop(state);
        inner.broadcaster.drain();
    }

    /// Stops observing. Calling this more than once has no effect.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl<F: Fetcher, T> Drop for Observer<F, T> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<F: Fetcher, T> fmt::Debug for Observer<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("entry", &self.inner.entry)
            .field("destroyed", &self.inner.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<F: Fetcher, T> ObserverInner<F, T> {
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = self.entry.release() {
            tracing::error!(error = %err, "failed to release cache entry");
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_timer
            .cancel();
        let subscription = self
            .entry_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        tracing::trace!(query = self.entry.query_name(), key = %self.entry.key(), "destroyed observer");
    }
}

impl<F, T> ObserverInner<F, T>
where
    F: Fetcher,
    T: Clone + Send + Sync + 'static,
{
    /// Projects a new entry state and rebroadcasts it.
    fn apply(self: &Arc<Self>, entry_state: &EntryState<F::Data>) {
        let mut state = self.state.lock().unwrap();
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        // a catch-up read may already be ahead of a delivery
        if state
            .entry_state
            .as_ref()
            .is_some_and(|applied| applied.revision >= entry_state.revision)
        {
            return;
        }

        state.entry_state = Some(entry_state.clone());
        let observed = state.project(self.entry.query_name(), self.entry.key());
        let previous = std::mem::replace(&mut state.observed, observed.clone());
        self.reschedule_poll(&mut state);

        self.broadcaster.push(ObservedChange {
            state: observed,
            previous,
        });
        drop(state);
        self.broadcaster.drain();
    }

    fn reschedule_poll(self: &Arc<Self>, state: &mut Projection<F::Data, T>) {
        let Some(interval) = state.poll_interval.filter(|interval| !interval.is_zero()) else {
            state.poll_timer.cancel();
            return;
        };

        let base = match &state.entry_state {
            Some(entry_state) if entry_state.status == Status::Loading => {
                state.poll_timer.cancel();
                return;
            }
            Some(entry_state) => entry_state.updated_at.unwrap_or_else(Instant::now),
            None => Instant::now(),
        };
        let Some(deadline) = base.checked_add(interval) else {
            state.poll_timer.cancel();
            return;
        };

        let observer = Arc::downgrade(self);
        state
            .poll_timer
            .arm(self.entry.runtime(), deadline, move |timer| {
                if let Some(observer) = observer.upgrade() {
                    observer.poll(timer);
                }
            });
    }

    fn poll(&self, timer: TimerId) {
        if !self.state.lock().unwrap().poll_timer.take_fired(timer) {
            return;
        }
        tracing::trace!(query = self.entry.query_name(), key = %self.entry.key(), "polling");
        drop(self.entry.refetch());
    }
}
