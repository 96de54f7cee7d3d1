//! An in-memory cache for the results of asynchronous fetches.
//!
//! A [`Query`] binds a name to a [`Fetcher`]. For every distinct set of variables it is called
//! with, the query holds one [`CacheEntry`], addressed by the [`CacheKey`] a [`KeyDeriver`]
//! derives from the variables. Entries guarantee that at most one fetch per key is in flight,
//! serve outcomes within a freshness window from the cache and are evicted some time after the
//! last [`Observer`] went away.
//!
//! ```
//! # use std::time::Duration;
//! # use querycache::{fetch_fn, Config, ObserverOptions, QueryOptions, Registry};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let registry = Registry::new(&Config::default(), tokio::runtime::Handle::current());
//! let users = registry.get_or_create_query(
//!     "users",
//!     fetch_fn(|team: String| async move { anyhow::Ok(vec![format!("{team}/alice")]) }),
//!     QueryOptions::default(),
//! )?;
//!
//! let observer = users.observe(&"core".to_owned(), ObserverOptions::default())?;
//! let data = observer.fetch().await?;
//! assert_eq!(*data, vec!["core/alice".to_owned()]);
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

mod broadcast;
pub mod config;
mod entry;
mod error;
mod fetcher;
mod key;
pub mod logging;
mod observer;
mod query;
mod registry;
pub mod snapshot;
pub mod utils;

pub use broadcast::Subscription;
pub use config::Config;
pub use entry::{CacheEntry, EntryState, FetchFuture, Status};
pub use error::{FetchError, KeyError, QueryError, RegistryError};
pub use fetcher::{FetchFn, FetchResult, Fetcher, OptionalFetchFn, fetch_fn, optional_fetch_fn};
pub use key::{CacheKey, CanonicalJson, KeyDeriver, KeyFn, key_fn};
pub use observer::{ObservedState, Observer, ObserverOptions, PolicyUpdate, Transform};
pub use query::{Query, QueryOptions};
pub use registry::Registry;
pub use snapshot::{EntrySnapshot, JsonFileStore, SnapshotStore};
