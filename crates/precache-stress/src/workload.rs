use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use precache::Getter;
use tokio_util::sync::CancellationToken;

/// Errors produced by the simulated fetches.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StressError {
    #[error("fetch of key {0} failed")]
    Failed(usize),
    #[error("fetch of key {0} was cancelled")]
    Cancelled(usize),
}

/// Shape of the simulated work, shared by all keys.
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub keys: usize,
    pub fetch_time: Duration,
    /// Share of keys whose fetch fails, between `0.0` and `1.0`.
    pub error_rate: f64,
}

impl Workload {
    /// Whether fetches of `key` fail.
    fn fails(&self, key: usize) -> bool {
        let failing = (self.keys as f64 * self.error_rate).round() as usize;
        key % self.keys.max(1) < failing
    }
}

/// A getter that sleeps for the configured fetch time, identified by its key alone.
#[derive(Debug, Clone)]
pub struct SleepFetch {
    key: usize,
    workload: Workload,
    fetches: Arc<AtomicUsize>,
}

impl SleepFetch {
    pub fn new(key: usize, workload: Workload, fetches: Arc<AtomicUsize>) -> Self {
        Self {
            key,
            workload,
            fetches,
        }
    }
}

impl PartialEq for SleepFetch {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SleepFetch {}

impl Hash for SleepFetch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Getter for SleepFetch {
    type Output = usize;
    type Error = StressError;

    fn get(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<usize, StressError>> {
        async move {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(self.workload.fetch_time) => {}
                _ = cancel.cancelled() => return Err(StressError::Cancelled(self.key)),
            }
            if self.workload.fails(self.key) {
                tracing::debug!(key = self.key, "Simulated fetch failure");
                return Err(StressError::Failed(self.key));
            }
            Ok(self.key)
        }
        .boxed()
    }
}

/// Spreads consecutive operations over all keys, revisiting each key every `keys` operations.
pub fn key_for(operation: usize, keys: usize) -> usize {
    // a prime stride, so neighbouring operations hit unrelated keys
    operation.wrapping_mul(7919) % keys.max(1)
}
