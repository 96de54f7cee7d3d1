use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future;
use serde::Serialize;
use tokio::runtime::Handle;

use crate::config::QueryDefaults;
use crate::entry::{CacheEntry, EntryConfig, EntryState, FetchFuture, Status};
use crate::error::QueryError;
use crate::fetcher::Fetcher;
use crate::key::{CacheKey, CanonicalJson, KeyDeriver};
use crate::observer::{Observer, ObserverOptions};
use crate::snapshot::{self, EntrySnapshot, SnapshotStore};
use crate::utils::timer::TimerId;

/// Options of a [`Query`].
pub struct QueryOptions<V> {
    /// How long an entry without observers is kept before it is evicted.
    ///
    /// `None` or a zero delay disables eviction.
    pub eviction_delay: Option<Duration>,
    /// Derives cache keys from variables. Defaults to [`CanonicalJson`].
    pub key_deriver: Arc<dyn KeyDeriver<V>>,
}

impl<V: Serialize> QueryOptions<V> {
    pub fn from_config(config: &QueryDefaults) -> Self {
        Self {
            eviction_delay: config.eviction_delay,
            key_deriver: Arc::new(CanonicalJson::default()),
        }
    }

    pub fn with_key_deriver(mut self, key_deriver: impl KeyDeriver<V>) -> Self {
        self.key_deriver = Arc::new(key_deriver);
        self
    }
}

impl<V: Serialize> Default for QueryOptions<V> {
    fn default() -> Self {
        Self::from_config(&QueryDefaults::default())
    }
}

impl<V> Clone for QueryOptions<V> {
    fn clone(&self) -> Self {
        Self {
            eviction_delay: self.eviction_delay,
            key_deriver: Arc::clone(&self.key_deriver),
        }
    }
}

impl<V> fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("eviction_delay", &self.eviction_delay)
            .finish_non_exhaustive()
    }
}

/// A named fetcher together with the cache entries of all variables it was invoked with.
///
/// There is one [`CacheEntry`] per distinct [`CacheKey`]. Entries are created on the first lookup
/// of their key and live until they have been unused for the eviction delay. Handles are cheap to
/// clone and all refer to the same entry table.
pub struct Query<F: Fetcher> {
    inner: Arc<QueryInner<F>>,
}

struct QueryInner<F: Fetcher> {
    name: Arc<str>,
    fetcher: Arc<F>,
    options: QueryOptions<F::Variables>,
    runtime: Handle,
    entries: Mutex<HashMap<CacheKey, CacheEntry<F>>>,
}

impl<F: Fetcher> Clone for Query<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fetcher> fmt::Debug for Query<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl<F: Fetcher> Query<F> {
    /// Creates a standalone query spawning its background work on `runtime`.
    ///
    /// Most callers go through [`Registry::get_or_create_query`](crate::Registry) instead.
    pub fn new(
        name: impl Into<Arc<str>>,
        fetcher: F,
        options: QueryOptions<F::Variables>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                name: name.into(),
                fetcher: Arc::new(fetcher),
                options,
                runtime,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &QueryOptions<F::Variables> {
        &self.inner.options
    }

    /// Derives the cache key of `variables`.
    pub fn key_of(&self, variables: &F::Variables) -> Result<CacheKey, QueryError> {
        Ok(self.inner.options.key_deriver.key_of(variables)?)
    }

    /// Looks up the entry of `variables` without creating it.
    pub fn find_entry(
        &self,
        variables: &F::Variables,
    ) -> Result<Option<CacheEntry<F>>, QueryError> {
        let key = self.key_of(variables)?;
        Ok(self.inner.entries.lock().unwrap().get(&key).cloned())
    }

    /// Looks up the entry of `variables`, creating a `pending` one on a miss.
    pub fn find_or_create_entry(
        &self,
        variables: &F::Variables,
    ) -> Result<CacheEntry<F>, QueryError> {
        let key = self.key_of(variables)?;
        let mut entries = self.inner.entries.lock().unwrap();
        Ok(self.inner.get_or_insert(&mut entries, key, variables))
    }

    /// Looks up or creates the entry of `variables` and retains it.
    ///
    /// Both happen under the table lock, so the entry cannot be evicted in between.
    pub(crate) fn acquire_entry(
        &self,
        variables: &F::Variables,
    ) -> Result<CacheEntry<F>, QueryError> {
        let key = self.key_of(variables)?;
        let mut entries = self.inner.entries.lock().unwrap();
        let entry = self.inner.get_or_insert(&mut entries, key, variables);
        entry.retain()?;
        Ok(entry)
    }

    /// Fetches the data of `variables`, see [`CacheEntry::fetch`].
    pub fn fetch(
        &self,
        variables: &F::Variables,
        freshness_window: Duration,
    ) -> FetchFuture<F::Data> {
        match self.find_or_create_entry(variables) {
            Ok(entry) => entry.fetch(freshness_window),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Fetches the data of `variables`, ignoring any cached outcome.
    pub fn refetch(&self, variables: &F::Variables) -> FetchFuture<F::Data> {
        self.fetch(variables, Duration::ZERO)
    }

    /// Creates an [`Observer`] watching the entry of `variables`.
    pub fn observe<T>(
        &self,
        variables: &F::Variables,
        options: ObserverOptions<F::Data, T>,
    ) -> Result<Observer<F, T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Observer::new(self, variables, options)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Returns the state of every entry, ordered by key.
    pub fn entries(&self) -> Vec<(CacheKey, EntryState<F::Data>)> {
        let mut entries: Vec<_> = self
            .inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.state()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<F: Fetcher> QueryInner<F> {
    fn get_or_insert(
        self: &Arc<Self>,
        entries: &mut HashMap<CacheKey, CacheEntry<F>>,
        key: CacheKey,
        variables: &F::Variables,
    ) -> CacheEntry<F> {
        entries
            .entry(key)
            .or_insert_with_key(|key| self.create_entry(key.clone(), variables.clone()))
            .clone()
    }

    fn create_entry(self: &Arc<Self>, key: CacheKey, variables: F::Variables) -> CacheEntry<F> {
        metric!(counter("query.entry.create") += 1, "query" => &self.name);
        tracing::debug!(query = %self.name, %key, "creating cache entry");

        let query = Arc::downgrade(self);
        CacheEntry::new(EntryConfig {
            query: Arc::clone(&self.name),
            key,
            variables,
            fetcher: Arc::clone(&self.fetcher),
            eviction_delay: self.options.eviction_delay,
            runtime: self.runtime.clone(),
            on_evict: Arc::new(move |key: &CacheKey, timer: TimerId| {
                if let Some(query) = query.upgrade() {
                    query.evict(key, timer);
                }
            }),
        })
    }

    /// Removes the entry of `key` if `timer` is its live eviction timer and it is still unused.
    ///
    /// Marking the entry as evicted and removing it from the table happen under the table lock,
    /// so concurrent lookups either find the live entry or create a new one.
    fn evict(&self, key: &CacheKey, timer: TimerId) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(key) else {
            return;
        };
        if entry.try_evict(timer) {
            entries.remove(key);
            metric!(counter("query.entry.evict") += 1, "query" => &self.name);
            tracing::debug!(query = %self.name, %key, "evicted cache entry");
        }
    }
}

impl<F: Fetcher> Query<F> {
    /// Returns the persistable form of every `success` entry.
    pub fn snapshot(&self) -> Vec<EntrySnapshot<F::Variables, F::Data>> {
        let entries: Vec<_> = self
            .inner
            .entries
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| {
                let state = entry.state();
                if state.status != Status::Success {
                    return None;
                }
                Some(EntrySnapshot {
                    key: entry.key().clone(),
                    variables: entry.variables().clone(),
                    data: state.data?,
                    data_updated_at: snapshot::to_wall_clock(state.data_updated_at?),
                })
            })
            .collect();
        snapshots.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Seeds entries from snapshots, returning how many were applied.
    ///
    /// Only entries that were never fetched are seeded. Snapshots whose key does not match the
    /// key the current key deriver produces for their variables are skipped.
    pub fn restore(
        &self,
        snapshots: Vec<EntrySnapshot<F::Variables, F::Data>>,
    ) -> Result<usize, QueryError> {
        let mut restored = 0;
        for snapshot in snapshots {
            let key = self.key_of(&snapshot.variables)?;
            if key != snapshot.key {
                tracing::warn!(
                    query = %self.inner.name,
                    stored = %snapshot.key,
                    derived = %key,
                    "skipping snapshot with mismatching key",
                );
                continue;
            }
            let Some(data_updated_at) = snapshot::to_instant(snapshot.data_updated_at) else {
                tracing::debug!(query = %self.inner.name, key = %snapshot.key, "skipping outdated snapshot");
                continue;
            };
            let entry = self.find_or_create_entry(&snapshot.variables)?;
            if entry.hydrate(snapshot.data, data_updated_at) {
                restored += 1;
            }
        }
        tracing::debug!(query = %self.inner.name, restored, "restored snapshot");
        Ok(restored)
    }

    pub fn save_snapshot<S>(&self, store: &S) -> anyhow::Result<()>
    where
        S: SnapshotStore<F::Variables, F::Data> + ?Sized,
    {
        store.save(&self.snapshot())
    }

    pub fn load_snapshot<S>(&self, store: &S) -> anyhow::Result<usize>
    where
        S: SnapshotStore<F::Variables, F::Data> + ?Sized,
    {
        let snapshots = store.load()?;
        Ok(self.restore(snapshots)?)
    }
}
