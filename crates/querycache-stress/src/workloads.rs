use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use querycache::{FetchResult, Fetcher};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A population of short lived observers hammering one query.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many observers are alive at the same time.
    pub concurrency: usize,
    /// The number of distinct variables observers pick from.
    pub keys: u64,
    /// How long one fetcher invocation takes.
    #[serde(with = "humantime_serde", default = "default_latency")]
    pub latency: Duration,
    /// The probability of a fetcher invocation failing.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(with = "humantime_serde", default)]
    pub freshness_window: Duration,
    #[serde(with = "humantime_serde", default)]
    pub poll_interval: Option<Duration>,
    /// How long an observer stays around after its first outcome.
    #[serde(with = "humantime_serde", default)]
    pub observer_lifetime: Duration,
}

fn default_latency() -> Duration {
    Duration::from_millis(50)
}

/// A fetcher that sleeps instead of doing real work.
#[derive(Clone, Debug)]
pub struct SyntheticFetcher {
    latency: Duration,
    failure_rate: f64,
    invocations: Arc<AtomicUsize>,
}

impl SyntheticFetcher {
    pub fn new(workload: &Workload) -> Self {
        Self {
            latency: workload.latency,
            failure_rate: workload.failure_rate.clamp(0.0, 1.0),
            invocations: Default::default(),
        }
    }

    /// The number of times the fetcher was actually invoked.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Fetcher for SyntheticFetcher {
    type Variables = u64;
    type Data = u64;

    fn fetch(&self, key: u64) -> BoxFuture<'static, FetchResult<u64>> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency;
        let fail = rand::rng().random_bool(self.failure_rate);

        async move {
            tokio::time::sleep(latency).await;
            if fail {
                anyhow::bail!("synthetic failure for key {key}");
            }
            Ok(Some(key))
        }
        .boxed()
    }
}
