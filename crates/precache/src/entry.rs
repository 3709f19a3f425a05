use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::cache::Shared;
use crate::getter::Getter;

/// The memoized outcome of a [`Getter::get`] call.
pub(crate) type Fetched<G> = Result<<G as Getter>::Output, <G as Getter>::Error>;

/// The shared state of one cached getter.
///
/// `getter`, `cancel` and `cache` never change after construction. `refs` may only be changed
/// atomically, and it only ever goes from `0` to `1` while the registry lock is held.
///
/// The fetch runs on its own task, started at most once. Only that task sets `result`.
pub(crate) struct Slot<G: Getter> {
    getter: G,
    cancel: CancellationToken,
    refs: AtomicI64,
    /// Set while the slot sits unused in the registry because the evicter chose to keep it.
    retained: AtomicBool,
    started: AtomicBool,
    result: OnceCell<Fetched<G>>,
    done: Notify,
    cache: Weak<Shared<G>>,
}

impl<G: Getter> Slot<G> {
    /// Creates a slot that already carries the reference of its first [`Entry`].
    pub(crate) fn new(getter: G, cancel: CancellationToken, cache: Weak<Shared<G>>) -> Self {
        Slot {
            getter,
            cancel,
            refs: AtomicI64::new(1),
            retained: AtomicBool::new(false),
            started: AtomicBool::new(false),
            result: OnceCell::new(),
            done: Notify::new(),
            cache,
        }
    }

    pub(crate) fn getter(&self) -> &G {
        &self.getter
    }

    pub(crate) fn refs(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Adds a reference to this slot.
    ///
    /// Returns `true` if the slot was sitting unused in the registry until now, in which case the
    /// evicter has to be told that it is in use again.
    pub(crate) fn acquire(&self) -> bool {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        previous == 0 && self.retained.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_retained(&self) {
        self.retained.store(true, Ordering::Release);
    }

    /// Whether the slot is unreferenced and was kept by the evicter.
    ///
    /// Only meaningful while holding the registry write lock.
    pub(crate) fn is_retained_unused(&self) -> bool {
        self.refs() == 0 && self.retained.load(Ordering::Acquire)
    }

    /// Spawns the fetch, unless it was already started.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let slot = Arc::clone(self);
        tokio::spawn(async move {
            let result = slot.fetch().await;
            // `started` guarantees this is the only writer.
            let _ = slot.result.set(result);
            slot.done.notify_waiters();
        });
    }

    /// Returns the memoized result, starting the fetch first if nobody has started it yet.
    ///
    /// Dropping the returned future does not affect the fetch.
    pub(crate) async fn get(self: &Arc<Self>) -> &Fetched<G> {
        self.start();
        loop {
            // Registered before checking, so a completion in between is not missed.
            let done = self.done.notified();
            if let Some(result) = self.result.get() {
                return result;
            }
            done.await;
        }
    }

    async fn fetch(&self) -> Fetched<G> {
        metric!(counter("precache.computation") += 1);
        tracing::trace!(getter = ?self.getter, "Starting fetch");

        let start = Instant::now();
        let result = self.getter.get(self.cancel.clone()).await;

        metric!(
            timer("precache.computation.duration") = start.elapsed(),
            "status" => if result.is_ok() { "ok" } else { "error" },
            "cancelled" => if self.cancel.is_cancelled() { "true" } else { "false" },
        );
        tracing::trace!(getter = ?self.getter, elapsed = ?start.elapsed(), "Finished fetch");

        result
    }

    /// Drops one reference, handing the slot back to the registry once it is unused.
    fn release(&self) {
        let remain = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        match remain.cmp(&0) {
            CmpOrdering::Greater => {}
            CmpOrdering::Equal => match self.cache.upgrade() {
                Some(cache) => cache.release_unused(self),
                // The registry is gone, there is no map left to remove ourselves from.
                None => self.cancel(),
            },
            CmpOrdering::Less => panic!("precache: internal error: reference count underflow"),
        }
    }
}

impl<G: Getter> fmt::Debug for Slot<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("getter", &self.getter)
            .field("refs", &self.refs())
            .field("fetched", &self.result.initialized())
            .finish()
    }
}

/// A reference to an entry of a [`Cache`](crate::Cache).
///
/// Every `Entry` keeps the cached value alive. Once all entries for a getter are closed, the value
/// is either removed from the cache or, if an [`Evicter`](crate::Evicter) says so, kept around
/// unused until a later request picks it up again.
///
/// An entry is closed either explicitly through [`close`](Self::close) or implicitly when it is
/// dropped. Calling any method other than [`is_closed`](Self::is_closed) on a closed entry panics.
pub struct Entry<G: Getter> {
    slot: Option<Arc<Slot<G>>>,
}

impl<G: Getter> Entry<G> {
    /// Wraps a slot whose reference count already accounts for this entry.
    pub(crate) fn new(slot: Arc<Slot<G>>) -> Self {
        Entry { slot: Some(slot) }
    }

    fn slot(&self, method: &str) -> &Arc<Slot<G>> {
        match &self.slot {
            Some(slot) => slot,
            None => panic!("precache: call to {method} on a closed Entry({self:p})"),
        }
    }

    /// The getter this entry belongs to.
    pub fn key(&self) -> &G {
        self.slot("key").getter()
    }

    /// Returns the result of the [`Getter`].
    ///
    /// If the getter has not been started yet, it is started by this call. If it is running, this
    /// waits for it to finish. Every entry of the same cache slot gets the same result.
    ///
    /// The getter runs on its own task, so cancelling this call, e.g. through a timeout, leaves
    /// the running fetch untouched and a later call picks up its result.
    pub async fn get(&self) -> &Result<G::Output, G::Error> {
        self.slot("get").get().await
    }

    /// Releases this entry's reference.
    ///
    /// When this was the last reference, the cache cancels a still running fetch and either evicts
    /// the value or keeps it unused, depending on the installed evicter.
    pub fn close(&mut self) {
        let Some(slot) = self.slot.take() else {
            panic!("precache: call to close on a closed Entry({self:p})");
        };
        slot.release();
    }

    /// Whether [`close`](Self::close) was already called on this entry.
    pub fn is_closed(&self) -> bool {
        self.slot.is_none()
    }
}

impl<G: Getter> Clone for Entry<G> {
    /// Returns a new entry for the same cache slot that is closed separately.
    fn clone(&self) -> Self {
        let slot = self.slot("clone");
        // `self` is not closed, so there is at least one reference and the slot cannot be
        // removed from the cache before we add ours.
        slot.refs.fetch_add(1, Ordering::AcqRel);
        Entry::new(Arc::clone(slot))
    }
}

impl<G: Getter> Drop for Entry<G> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release();
        }
    }
}

impl<G: Getter> fmt::Debug for Entry<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => f.debug_tuple("Entry").field(slot).finish(),
            None => f.write_str("Entry(<closed>)"),
        }
    }
}
