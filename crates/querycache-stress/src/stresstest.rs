use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use querycache::{Config, ObserverOptions, QueryOptions, Registry};
use rand::Rng;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{SyntheticFetcher, WorkloadsConfig};

struct WorkloadReport {
    concurrency: usize,
    keys: u64,
    task_durations: DDSketch,
    failures: usize,
    invocations: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    if let Some(ref statsd) = config.metrics.statsd {
        querycache::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let registry = Registry::new(&config, tokio::runtime::Handle::current());

    // one query per workload, so their dedup numbers do not mix
    let mut prepared = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let fetcher = SyntheticFetcher::new(&workload);
        let query = registry
            .get_or_create_query(
                &format!("workload-{i}"),
                fetcher.clone(),
                QueryOptions::from_config(registry.defaults()),
            )
            .context("failed to register workload query")?;
        let options = ObserverOptions {
            freshness_window: workload.freshness_window,
            poll_interval: workload.poll_interval,
            ..ObserverOptions::from_config(registry.defaults())
        };
        prepared.push((workload, query, fetcher, options));
    }

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(prepared.len());
    for (workload, query, fetcher, options) in prepared {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let concurrency = workload.concurrency;
        let keys = workload.keys.max(1);
        let lifetime = workload.observer_lifetime;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let query = query.clone();
                        let options = options.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();
                        let key = rand::rng().random_range(0..keys);

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());

                        let future = async move {
                            match query.observe(&key, options) {
                                Ok(observer) => {
                                    if observer.fetch().await.is_err() {
                                        failures.fetch_add(1, Ordering::Relaxed);
                                    }
                                    task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                                    tokio::time::sleep(lifetime).await;
                                    drop(observer);
                                }
                                Err(error) => {
                                    tracing::error!(error = &error as &dyn std::error::Error, "failed to observe");
                                    failures.fetch_add(1, Ordering::Relaxed);
                                }
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            WorkloadReport {
                concurrency,
                keys,
                task_durations,
                failures: failures.load(Ordering::Relaxed),
                invocations: fetcher.invocations(),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task.context("workload task panicked")?;
        let WorkloadReport {
            concurrency,
            keys,
            task_durations,
            failures,
            invocations,
        } = report;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}, keys: {keys}): {ops} operations, {ops_ps:.2} ops/s"
        );
        if ops == 0 {
            continue;
        }

        let dedup = ops as f64 / invocations.max(1) as f64;
        println!("  fetcher invocations: {invocations}; requests per invocation: {dedup:.2}; failures: {failures}");

        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!("Queries: {}", registry.query_names().join(", "));

    Ok(())
}
