//! Background tasks of a [`Cache`](crate::Cache): the deferred queue and the periodic sweeper.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::Shared;
use crate::entry::Slot;
use crate::getter::Getter;

/// Spawns the deferred scheduler of a cache.
///
/// With a `max_concurrent` of zero or less, every queued slot is discarded without running.
pub(crate) fn spawn<G: Getter>(
    cache: Weak<Shared<G>>,
    cancel: CancellationToken,
    receiver: UnboundedReceiver<Weak<Slot<G>>>,
    max_concurrent: isize,
) {
    match usize::try_from(max_concurrent) {
        Ok(max_concurrent) if max_concurrent > 0 => {
            tokio::spawn(run(cache, cancel, receiver, max_concurrent));
        }
        _ => {
            tokio::spawn(discard(cancel, receiver));
        }
    }
}

async fn discard<G: Getter>(
    cancel: CancellationToken,
    mut receiver: UnboundedReceiver<Weak<Slot<G>>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            slot = receiver.recv() => {
                if slot.is_none() {
                    break;
                }
                metric!(counter("precache.deferred.discarded") += 1);
            }
        }
    }
}

async fn run<G: Getter>(
    cache: Weak<Shared<G>>,
    cancel: CancellationToken,
    mut receiver: UnboundedReceiver<Weak<Slot<G>>>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut waiting: VecDeque<Weak<Slot<G>>> = VecDeque::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Ok(permit) = Arc::clone(&semaphore).acquire_owned(), if !waiting.is_empty() => {
                if let Some(slot) = waiting.pop_front() {
                    dispatch(&cache, slot, permit);
                }
                metric!(gauge("precache.deferred.waiting") = waiting.len() as u64);
            }

            slot = receiver.recv() => match slot {
                Some(slot) => {
                    waiting.push_back(slot);
                    metric!(gauge("precache.deferred.waiting") = waiting.len() as u64);
                }
                None => break,
            },
        }
    }

    tracing::debug!(waiting = waiting.len(), "Deferred scheduler stopped");
}

/// Runs a queued slot if it is still in the cache, holding `permit` until its fetch is done.
fn dispatch<G: Getter>(
    cache: &Weak<Shared<G>>,
    slot: Weak<Slot<G>>,
    permit: OwnedSemaphorePermit,
) {
    let entry = cache
        .upgrade()
        .zip(slot.upgrade())
        .and_then(|(cache, slot)| cache.reacquire(&slot));

    // The slot was evicted or replaced while it was waiting, the permit is released right away.
    let Some(entry) = entry else {
        metric!(counter("precache.deferred.skipped") += 1);
        return;
    };

    tracing::trace!(getter = ?entry.key(), "Running deferred fetch");
    tokio::spawn(async move {
        let _ = entry.get().await;
        drop(entry);
        drop(permit);
    });
}

/// Spawns a task that sweeps the cache every `period` until it is shut down.
pub(crate) fn spawn_sweeper<G: Getter>(
    cache: Weak<Shared<G>>,
    cancel: CancellationToken,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                },
            }
        }
    });
}
