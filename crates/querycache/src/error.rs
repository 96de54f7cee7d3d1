use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::key::CacheKey;

/// An error produced by a [`Fetcher`](crate::Fetcher).
///
/// This wraps the fetcher's [`anyhow::Error`] in an [`Arc`], so the same failure can be handed
/// out to every caller that waited on one in-flight fetch, and stored in the cache entry.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Returns the underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for FetchError {}

/// An error deriving a [`CacheKey`] from query variables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The variables could not be represented as JSON.
    #[error("variables are not serializable: {0}")]
    Serialize(String),
    /// The variables nest deeper than the deriver allows.
    #[error("variables nest deeper than {max_depth} levels")]
    TooDeep { max_depth: usize },
}

impl From<serde_json::Error> for KeyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err.to_string())
    }
}

/// An error returned by cache entry operations.
///
/// All variants are cheap to clone. A failed fetch is shared by every caller waiting on it, and
/// it is also stored in the entry until the next successful fetch.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The fetcher failed.
    ///
    /// This is a regular, recoverable outcome. The cache never retries on its own.
    #[error("fetching `{query}` failed: {source}")]
    Fetch {
        query: Arc<str>,
        #[source]
        source: FetchError,
    },
    /// The fetcher resolved successfully, but without any data.
    ///
    /// Fetchers must never do that, this is a bug in the fetcher.
    #[error("fetcher of `{query}` resolved without data for {key}")]
    MissingData { query: Arc<str>, key: CacheKey },
    /// The variables could not be turned into a cache key.
    #[error("invalid variables")]
    InvalidVariables(#[from] KeyError),
    /// An entry was released more often than it was acquired.
    #[error("cache entry {key} of `{query}` was released more often than it was used")]
    RefCountUnderflow { query: Arc<str>, key: CacheKey },
    /// The entry behind this handle has been evicted from its query.
    #[error("cache entry {key} of `{query}` was evicted")]
    Evicted { query: Arc<str>, key: CacheKey },
    /// An observer's transform panicked on the data of an entry.
    ///
    /// Only the observer with the faulty transform sees this, the entry itself keeps its data.
    #[error("transform of an observer on {key} of `{query}` panicked")]
    TransformPanicked { query: Arc<str>, key: CacheKey },
}

impl QueryError {
    /// Whether this error was produced by the fetcher, as opposed to a misuse of the cache.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }
}

/// An error looking up or registering a query in the [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The name is already taken by a query with a different fetcher type.
    #[error("query `{name}` is already registered with a different fetcher type")]
    TypeMismatch { name: String },
}
