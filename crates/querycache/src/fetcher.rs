use std::future::Future;
use std::marker::PhantomData;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

/// The result of a single fetcher invocation.
///
/// `Ok(None)` is the "no data" marker. A fetcher must never resolve with it; the cache treats it
/// as a bug in the fetcher and surfaces it as [`QueryError::MissingData`](crate::QueryError).
pub type FetchResult<D> = anyhow::Result<Option<D>>;

/// The asynchronous function behind a [`Query`](crate::Query).
///
/// The cache is agnostic to what a fetch does. Retries, timeouts and authorization are the
/// fetcher's business; the cache only deduplicates invocations and remembers their outcome.
pub trait Fetcher: Send + Sync + 'static {
    /// The input identifying one invocation. Variables are only ever compared via their
    /// [`CacheKey`](crate::CacheKey).
    type Variables: Serialize + Clone + Send + Sync + 'static;
    /// The successful output of an invocation.
    type Data: Send + Sync + 'static;

    /// Starts fetching the data for `variables`.
    fn fetch(&self, variables: Self::Variables) -> BoxFuture<'static, FetchResult<Self::Data>>;
}

/// A [`Fetcher`] backed by an async closure that always produces data.
pub struct FetchFn<V, D, F> {
    f: F,
    _marker: PhantomData<fn(V) -> D>,
}

/// Creates a [`Fetcher`] from an async closure.
///
/// ```
/// # use querycache::fetch_fn;
/// let fetcher = fetch_fn(|team: String| async move {
///     anyhow::Ok(vec![format!("{team}/alice"), format!("{team}/bob")])
/// });
/// ```
pub fn fetch_fn<V, D, F, Fut>(f: F) -> FetchFn<V, D, F>
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
{
    FetchFn {
        f,
        _marker: PhantomData,
    }
}

impl<V, D, F, Fut> Fetcher for FetchFn<V, D, F>
where
    V: Serialize + Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
{
    type Variables = V;
    type Data = D;

    fn fetch(&self, variables: V) -> BoxFuture<'static, FetchResult<D>> {
        (self.f)(variables).map(|result| result.map(Some)).boxed()
    }
}

/// A [`Fetcher`] backed by an async closure that may report "no data".
pub struct OptionalFetchFn<V, D, F> {
    f: F,
    _marker: PhantomData<fn(V) -> D>,
}

/// Creates a [`Fetcher`] from an async closure resolving to an [`Option`].
///
/// This exists for adapting lookups that naturally return optional values. Resolving with `None`
/// is still a contract violation which the cache reports loudly.
pub fn optional_fetch_fn<V, D, F, Fut>(f: F) -> OptionalFetchFn<V, D, F>
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<D>> + Send + 'static,
{
    OptionalFetchFn {
        f,
        _marker: PhantomData,
    }
}

impl<V, D, F, Fut> Fetcher for OptionalFetchFn<V, D, F>
where
    V: Serialize + Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<D>> + Send + 'static,
{
    type Variables = V;
    type Data = D;

    fn fetch(&self, variables: V) -> BoxFuture<'static, FetchResult<D>> {
        (self.f)(variables).boxed()
    }
}
