use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use precache::Cache;
use precache::config::CacheConfig;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workload::{SleepFetch, Workload, key_for};

/// Outcome of one stresstest run.
pub struct Report {
    pub operations: DDSketch,
    pub errors: usize,
    pub fetches: usize,
    pub retained: usize,
}

impl Report {
    pub fn print(&self, concurrency: usize, duration: Duration) {
        let ops = self.operations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Concurrency {concurrency}: {ops} operations, {ops_ps:.2} ops/s");
        println!(
            "  {} fetches, {} errors, {} values left in the cache",
            self.fetches, self.errors, self.retained
        );

        if ops == 0 {
            return;
        }
        let quantile = |q| {
            let secs = self.operations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(self.operations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
}

pub async fn perform_stresstest(
    cache_config: &CacheConfig,
    workload: Workload,
    concurrency: usize,
    duration: Duration,
    deferred: bool,
) -> Report {
    let cache = Arc::new(Cache::from_config(cache_config));
    let fetches = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let operation = Arc::new(AtomicUsize::new(0));

    let task_durations = Arc::new(Mutex::new(DDSketch::default()));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                let cache = Arc::clone(&cache);
                let fetches = Arc::clone(&fetches);
                let errors = Arc::clone(&errors);
                let task_durations = Arc::clone(&task_durations);

                let key = key_for(operation.fetch_add(1, Ordering::Relaxed), workload.keys);
                let getter = SleepFetch::new(key, workload, fetches);

                tokio::spawn(async move {
                    let task_start = Instant::now();
                    let entry = if deferred {
                        cache.deferred(getter)
                    } else {
                        cache.entry(getter)
                    };
                    if let Err(error) = entry.get().await {
                        tracing::trace!(%error, "Operation failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(entry);

                    task_durations
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .add(task_start.elapsed().as_secs_f64());

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let operations = {
        let mut task_durations = task_durations.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *task_durations)
    };
    let report = Report {
        operations,
        errors: errors.load(Ordering::Relaxed),
        fetches: fetches.load(Ordering::Relaxed),
        retained: cache.len(),
    };
    cache.shutdown();
    report
}
