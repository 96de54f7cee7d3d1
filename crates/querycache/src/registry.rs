use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use crate::config::{Config, QueryDefaults};
use crate::error::RegistryError;
use crate::fetcher::Fetcher;
use crate::query::{Query, QueryOptions};

/// The namespace of all queries of an application.
///
/// Construct one at startup and hand it to everything that needs to look up queries. The first
/// registration of a name wins: later calls with the same name get the existing [`Query`] and
/// their fetcher and options are dropped. Registering a name again with a different fetcher type
/// is an error.
pub struct Registry {
    defaults: QueryDefaults,
    runtime: Handle,
    queries: Mutex<HashMap<Arc<str>, Arc<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Creates an empty registry whose queries spawn their background work on `runtime`.
    pub fn new(config: &Config, runtime: Handle) -> Self {
        Self {
            defaults: config.queries,
            runtime,
            queries: Mutex::new(HashMap::new()),
        }
    }

    /// The configured defaults for query and observer options.
    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Returns the query registered as `name`, registering `fetcher` under it if there is none.
    pub fn get_or_create_query<F: Fetcher>(
        &self,
        name: &str,
        fetcher: F,
        options: QueryOptions<F::Variables>,
    ) -> Result<Query<F>, RegistryError> {
        let mut queries = self.queries.lock().unwrap();
        if let Some(existing) = queries.get(name) {
            tracing::debug!(query = name, "query already registered");
            return downcast(name, existing);
        }

        let name: Arc<str> = name.into();
        let query = Query::new(Arc::clone(&name), fetcher, options, self.runtime.clone());
        queries.insert(name, Arc::new(query.clone()));
        tracing::debug!(query = query.name(), "registered query");
        Ok(query)
    }

    /// Looks up the query registered as `name`.
    pub fn query<F: Fetcher>(&self, name: &str) -> Result<Option<Query<F>>, RegistryError> {
        let queries = self.queries.lock().unwrap();
        queries
            .get(name)
            .map(|query| downcast(name, query))
            .transpose()
    }

    /// The names of all registered queries, sorted.
    pub fn query_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .queries
            .lock()
            .unwrap()
            .keys()
            .map(|name| name.to_string())
            .collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("defaults", &self.defaults)
            .field("queries", &self.query_names())
            .finish()
    }
}

fn downcast<F: Fetcher>(
    name: &str,
    query: &Arc<dyn Any + Send + Sync>,
) -> Result<Query<F>, RegistryError> {
    query
        .downcast_ref::<Query<F>>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch {
            name: name.to_owned(),
        })
}
