use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::entry::{Entry, Slot};
use crate::evicter::Evicter;
use crate::getter::Getter;
use crate::scheduler;

type SlotMap<G> = HashMap<G, Arc<Slot<G>>>;

/// How a newly created slot gets its fetch started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    /// Spawn the fetch right away.
    Immediate,
    /// Queue the slot for the deferred scheduler.
    Deferred,
}

impl Admission {
    fn as_str(self) -> &'static str {
        match self {
            Admission::Immediate => "immediate",
            Admission::Deferred => "deferred",
        }
    }
}

/// The registry state shared between the [`Cache`], its slots and its background tasks.
pub(crate) struct Shared<G: Getter> {
    slots: RwLock<SlotMap<G>>,
    /// Serializes all evicter calls. Always locked after `slots`, never before.
    evicter: Mutex<Option<Box<dyn Evicter<G>>>>,
    /// The number of mapped slots the evicter chose to keep while unused.
    retained: AtomicUsize,
    cancel: CancellationToken,
    deferred: mpsc::UnboundedSender<Weak<Slot<G>>>,
}

impl<G: Getter> Shared<G> {
    /// Adds a reference to a slot that is reachable from the map.
    ///
    /// Must be called while holding either side of the `slots` lock.
    fn acquire(&self, slot: &Arc<Slot<G>>) -> Entry<G> {
        if slot.acquire() {
            self.retained.fetch_sub(1, Ordering::AcqRel);
            let mut evicter = self.evicter.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(evicter) = evicter.as_mut() {
                evicter.used(slot.getter());
            }
        }
        Entry::new(Arc::clone(slot))
    }

    /// Takes a new reference on a deferred slot, if it is still the current slot for its getter.
    pub(crate) fn reacquire(&self, slot: &Arc<Slot<G>>) -> Option<Entry<G>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mapped = slots.get(slot.getter())?;
        if !Arc::ptr_eq(mapped, slot) {
            return None;
        }
        Some(self.acquire(slot))
    }

    /// Called by a slot whose reference count just dropped to zero.
    pub(crate) fn release_unused(&self, slot: &Slot<G>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        // Double check to make sure a new reference wasn't added while we were getting the lock.
        if slot.refs() != 0 {
            return;
        }

        // Tell the getter to stop if it's still running.
        slot.cancel();

        let getter = slot.getter();
        let is_mapped = slots
            .get(getter)
            .is_some_and(|mapped| ptr::eq(Arc::as_ptr(mapped), slot));
        if !is_mapped {
            // Already swept by a concurrent admission, and possibly replaced by a newer slot.
            return;
        }

        let should_evict = {
            let mut evicter = self.evicter.lock().unwrap_or_else(PoisonError::into_inner);
            match evicter.as_mut() {
                Some(evicter) => {
                    evicter.unused(getter);
                    evicter.should_evict(getter)
                }
                None => true,
            }
        };

        if should_evict {
            slots.remove(getter);
            metric!(counter("precache.evicted") += 1);
            tracing::trace!(?getter, "Evicted unused cache slot");
        } else {
            slot.mark_retained();
            self.retained.fetch_add(1, Ordering::AcqRel);
            metric!(counter("precache.retained") += 1);
            tracing::trace!(?getter, "Retained unused cache slot");
        }
    }

    /// Asks the evicter about every slot it previously chose to keep.
    ///
    /// This walks the whole map, unless no slot is currently kept.
    fn evict_unused(&self, slots: &mut SlotMap<G>) -> usize {
        if self.retained.load(Ordering::Acquire) == 0 {
            return 0;
        }

        let mut evicter = self.evicter.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(evicter) = evicter.as_mut() else {
            return 0;
        };

        let before = slots.len();
        slots.retain(|getter, slot| {
            if !slot.is_retained_unused() || !evicter.should_evict(getter) {
                return true;
            }
            self.retained.fetch_sub(1, Ordering::AcqRel);
            false
        });
        let evicted = before - slots.len();

        if evicted > 0 {
            metric!(counter("precache.evicted") += evicted as i64, "reason" => "sweep");
            tracing::trace!(evicted, "Swept unused cache slots");
        }
        evicted
    }

    pub(crate) fn sweep(&self) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        self.evict_unused(&mut slots)
    }
}

impl<G: Getter> Drop for Shared<G> {
    fn drop(&mut self) {
        self.cancel.cancel();

        // Entries may outlive the cache, they are not leaked.
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        let live = slots.values().filter(|slot| slot.refs() > 0).count();
        if live > 0 {
            tracing::debug!(live, "Cache dropped with live entries");
        }
    }
}

/// Remembers the result of [`Getter::get`] until all references to it are closed.
///
/// Requesting a getter that is already cached returns a new [`Entry`] for the existing slot.
/// Otherwise a slot is created and its fetch is started, either right away through
/// [`entry`](Self::entry) or through the throttled queue of [`deferred`](Self::deferred).
///
/// A `Cache` must be created and used from within a Tokio runtime, as it spawns the deferred
/// scheduler and the fetches onto it. Dropping the cache shuts it down; entries that are still
/// alive stay valid and keep their value.
pub struct Cache<G: Getter> {
    shared: Arc<Shared<G>>,
}

impl<G: Getter> Cache<G> {
    /// Creates a new cache.
    ///
    /// `max_deferred` is the number of deferred getters that may run concurrently. A value of zero
    /// or less means that the deferred queue never runs anything.
    pub fn new(max_deferred: isize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            slots: Default::default(),
            evicter: Default::default(),
            retained: AtomicUsize::new(0),
            cancel: cancel.clone(),
            deferred: sender,
        });
        scheduler::spawn(Arc::downgrade(&shared), cancel, receiver, max_deferred);

        Cache { shared }
    }

    /// Creates a new cache with the evicter and sweeping configured in `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::new(config.max_deferred);
        if let Some(evicter) = config.evicter.build() {
            cache.set_evicter(evicter);
        }
        if let Some(period) = config.sweep_interval.filter(|period| !period.is_zero()) {
            scheduler::spawn_sweeper(
                Arc::downgrade(&cache.shared),
                cache.shared.cancel.clone(),
                period,
            );
        }
        cache
    }

    /// Returns a reference to the cached value of the getter, and starts the getter immediately
    /// if it is not in the cache.
    ///
    /// Adding a new value first asks the evicter again about the unused values it kept, which
    /// takes time linear in the size of the cache while any value is kept.
    pub fn entry(&self, getter: G) -> Entry<G> {
        self.entry_for(getter, Admission::Immediate)
    }

    /// Returns a reference to the cached value of the getter, and adds the getter to a queue if it
    /// is not in the cache.
    ///
    /// The queue runs a configured number of getters concurrently, oldest first. Calling
    /// [`Entry::get`] runs the getter right away regardless of the queue.
    ///
    /// Like [`entry`](Self::entry), adding a new value sweeps the unused values kept by the
    /// evicter first.
    pub fn deferred(&self, getter: G) -> Entry<G> {
        self.entry_for(getter, Admission::Deferred)
    }

    fn entry_for(&self, getter: G, admission: Admission) -> Entry<G> {
        metric!(counter("precache.access") += 1, "mode" => admission.as_str());

        {
            let slots = self.shared.slots.read().unwrap_or_else(PoisonError::into_inner);
            // Easy way out: we already have the slot in the cache.
            if let Some(slot) = slots.get(&getter) {
                metric!(counter("precache.hit") += 1, "mode" => admission.as_str());
                return self.shared.acquire(slot);
            }
        }

        let mut slots = self.shared.slots.write().unwrap_or_else(PoisonError::into_inner);
        // Check again to make sure it wasn't added while we were unlocked.
        if let Some(slot) = slots.get(&getter) {
            metric!(counter("precache.hit") += 1, "mode" => admission.as_str());
            return self.shared.acquire(slot);
        }

        self.shared.evict_unused(&mut slots);

        tracing::trace!(?getter, mode = admission.as_str(), "Creating cache slot");
        let slot = Arc::new(Slot::new(
            getter.clone(),
            self.shared.cancel.child_token(),
            Arc::downgrade(&self.shared),
        ));
        slots.insert(getter, Arc::clone(&slot));

        match admission {
            Admission::Immediate => slot.start(),
            Admission::Deferred if self.shared.cancel.is_cancelled() => {
                tracing::trace!(getter = ?slot.getter(), "Cache is shut down, not queueing");
            }
            Admission::Deferred => {
                if self.shared.deferred.send(Arc::downgrade(&slot)).is_err() {
                    tracing::trace!(getter = ?slot.getter(), "Deferred scheduler has stopped");
                }
            }
        }

        Entry::new(slot)
    }

    /// Installs the evicter that decides which unused values are kept.
    ///
    /// Without an evicter, values are removed as soon as their last entry is closed. Replacing an
    /// evicter does not re-evaluate values the previous one chose to keep until the next sweep.
    pub fn set_evicter<E>(&self, evicter: E)
    where
        E: Evicter<G> + 'static,
    {
        let mut slot = self.shared.evicter.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Box::new(evicter));
    }

    /// Asks the evicter again about every unused value it kept, and removes those it no longer
    /// wants. Returns the number of removed values.
    ///
    /// This also happens whenever a new value is added to the cache, and periodically if a
    /// [`sweep_interval`](CacheConfig::sweep_interval) is configured.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Cancels any getters in progress and stops the deferred queue.
    ///
    /// [`Entry::close`] must still be called on, or drop must still happen for, each live entry.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down cache");
        self.shared.cancel.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The number of values in the cache, including unused ones kept by the evicter.
    pub fn len(&self) -> usize {
        self.shared
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no values at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<G: Getter> Drop for Cache<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<G: Getter> fmt::Debug for Cache<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("values", &self.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EvicterConfig;
    use crate::test::{self, CountingGetter, SleepGetter};

    #[tokio::test]
    async fn test_shutdown_cancels_fetch() {
        test::setup();
        let cache = Cache::new(1);

        let getter = SleepGetter::new(Duration::from_secs(3600));
        let entry = cache.entry(getter.clone());
        let clone = entry.clone();

        cache.shutdown();
        assert!(cache.is_shutdown());

        // the getter noticed the cancellation and returned early, which is what gets memoized
        assert_eq!(entry.get().await.as_ref().ok(), Some(&None));
        assert_eq!(clone.get().await.as_ref().ok(), Some(&None));
        assert_eq!(getter.cancelled(), 1);
    }

    #[tokio::test]
    async fn test_deferred_after_shutdown_never_runs() {
        let cache = Cache::new(4);
        cache.shutdown();

        let getter = CountingGetter::new("late");
        let entry = cache.deferred(getter.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(getter.count(), 0);
        assert_eq!(cache.len(), 1);
        drop(entry);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_entries_outlive_cache() {
        let cache = Cache::new(1);
        let getter = CountingGetter::new("outlive");
        let entry = cache.entry(getter.clone());
        drop(cache);

        assert_eq!(entry.get().await.as_ref().ok(), Some(&1));
        drop(entry);
        assert_eq!(getter.count(), 1);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = CacheConfig {
            max_deferred: 2,
            sweep_interval: None,
            evicter: EvicterConfig::Lru { retain: 1 },
        };
        let cache = Cache::from_config(&config);

        let getter = CountingGetter::new("configured");
        cache.entry(getter.clone()).get().await;
        assert_eq!(cache.len(), 1);

        cache.entry(getter.clone()).get().await;
        assert_eq!(getter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let config = CacheConfig {
            max_deferred: 1,
            sweep_interval: Some(Duration::from_secs(1)),
            evicter: EvicterConfig::Delay {
                delay: Duration::from_secs(5),
            },
        };
        let cache = Cache::from_config(&config);

        let getter = CountingGetter::new("swept");
        cache.entry(getter.clone()).get().await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_late_release_keeps_newer_slot() {
        test::setup();
        let cache = Cache::new(1);
        let getter = CountingGetter::new("replaced");

        let entry = cache.entry(getter.clone());
        assert_eq!(entry.get().await.as_ref().ok(), Some(&1));
        let old = Arc::clone(cache.shared.slots.read().unwrap().get(&getter).unwrap());
        drop(entry);
        assert!(cache.is_empty());

        let newer = cache.entry(getter.clone());
        assert_eq!(cache.len(), 1);

        // a stale release of the old slot must not touch the one that replaced it
        cache.shared.release_unused(&old);
        assert_eq!(cache.len(), 1);
        assert_eq!(newer.get().await.as_ref().ok(), Some(&2));

        drop(newer);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_without_evicter() {
        let cache = Cache::new(1);
        let entry = cache.entry(CountingGetter::new("held"));
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);
        drop(entry);
    }

    #[tokio::test]
    async fn test_drop_with_live_entries() {
        let cache = Cache::new(1);
        let getter = CountingGetter::new("alive");
        let entry = cache.entry(getter.clone());

        let logs = test::capture_logs(|| drop(cache));
        assert!(logs.contains("Cache dropped with live entries"), "{logs}");
        assert!(logs.contains("live=1"), "{logs}");
        assert!(!logs.contains("WARN"), "{logs}");

        // the entry is still perfectly usable
        assert_eq!(entry.get().await.as_ref().ok(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_close_cancels_fetch() {
        test::setup();
        let cache = Cache::new(1);
        let getter = SleepGetter::new(Duration::from_secs(3600));

        let entry = cache.entry(getter.clone());
        let clone = entry.clone();
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(entry);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(getter.cancelled(), 0);

        drop(clone);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(getter.cancelled(), 1);
        assert!(cache.is_empty());
    }

    /// Keeps every unused value and records how the cache talks to it.
    #[derive(Clone, Default)]
    struct RecordingEvicter {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingEvicter {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn record(&self, call: &str, getter: &CountingGetter) {
            let call = format!("{call} {}", getter.name());
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Evicter<CountingGetter> for RecordingEvicter {
        fn should_evict(&mut self, getter: &CountingGetter) -> bool {
            self.record("should_evict", getter);
            false
        }

        fn unused(&mut self, getter: &CountingGetter) {
            self.record("unused", getter);
        }

        fn used(&mut self, getter: &CountingGetter) {
            self.record("used", getter);
        }
    }

    #[tokio::test]
    async fn test_evicter_notifications() {
        let cache = Cache::new(1);
        let evicter = RecordingEvicter::default();
        cache.set_evicter(evicter.clone());
        let a = CountingGetter::new("a");

        // neither a new value, a hit, nor closing one of several entries notifies
        let first = cache.entry(a.clone());
        let second = cache.entry(a.clone());
        drop(first);
        assert!(evicter.take().is_empty());

        drop(second);
        assert_eq!(evicter.take(), ["unused a", "should_evict a"]);

        let again = cache.entry(a.clone());
        let clone = again.clone();
        assert_eq!(evicter.take(), ["used a"]);
        drop(again);
        drop(clone);
        assert_eq!(evicter.take(), ["unused a", "should_evict a"]);

        // adding another value asks again about the kept one
        let b = cache.entry(CountingGetter::new("b"));
        assert_eq!(evicter.take(), ["should_evict a"]);
        drop(b);
        assert_eq!(evicter.take(), ["unused b", "should_evict b"]);
    }

    #[tokio::test]
    async fn test_retained_count() {
        let cache = Cache::new(1);
        cache.set_evicter(crate::LruEvicter::new(1));
        let retained = || cache.shared.retained.load(Ordering::Acquire);
        let a = CountingGetter::new("a");

        drop(cache.entry(a.clone()));
        assert_eq!(retained(), 1);

        let entry = cache.entry(a.clone());
        assert_eq!(retained(), 0);
        drop(entry);
        assert_eq!(retained(), 1);

        drop(cache.entry(CountingGetter::new("b")));
        assert_eq!(retained(), 2);

        // only the most recently unused value survives
        assert_eq!(cache.sweep(), 1);
        assert_eq!(retained(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_admission_names() {
        assert_eq!(Admission::Immediate.as_str(), "immediate");
        assert_eq!(Admission::Deferred.as_str(), "deferred");
    }
}
