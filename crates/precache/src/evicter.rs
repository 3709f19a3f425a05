use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Decides when to remove unused values from a [`Cache`](crate::Cache).
///
/// The cache calls these methods one at a time, never concurrently, as long as the evicter is
/// only installed in a single cache. None of them may block.
pub trait Evicter<G>: Send {
    /// Returns `true` if the unused value of this getter should be removed from the cache.
    ///
    /// This is asked right after [`unused`](Self::unused), and again for every value that was
    /// kept whenever the cache sweeps. Implementations may update their bookkeeping here, so
    /// every call counts as a decision rather than a query.
    fn should_evict(&mut self, getter: &G) -> bool;

    /// Notifies the evicter that a getter has no references anymore.
    fn unused(&mut self, getter: &G);

    /// Notifies the evicter that a kept getter has at least one reference again.
    fn used(&mut self, getter: &G);
}

impl<G, E> Evicter<G> for Box<E>
where
    E: Evicter<G> + ?Sized,
{
    fn should_evict(&mut self, getter: &G) -> bool {
        (**self).should_evict(getter)
    }

    fn unused(&mut self, getter: &G) {
        (**self).unused(getter)
    }

    fn used(&mut self, getter: &G) {
        (**self).used(getter)
    }
}

/// An [`Evicter`] that keeps the most recently unused values.
///
/// The `retain` most recently unused values stay in the cache, older unused ones are removed.
///
/// Note that [`should_evict`](Evicter::should_evict) forgets a getter when it answers `true`, so
/// asking twice about the same getter does not give the same answer.
#[derive(Debug)]
pub struct LruEvicter<G> {
    retain: usize,
    /// Unused getters, least recently unused first.
    unused: Vec<G>,
}

impl<G> LruEvicter<G> {
    /// Creates an evicter keeping up to `retain` unused values.
    pub fn new(retain: usize) -> Self {
        LruEvicter {
            retain,
            unused: Vec::new(),
        }
    }

    /// The number of unused values this evicter keeps.
    pub fn retain(&self) -> usize {
        self.retain
    }
}

impl<G: PartialEq> LruEvicter<G> {
    fn remove(&mut self, getter: &G) {
        if let Some(index) = self.unused.iter().position(|g| g == getter) {
            self.unused.remove(index);
        }
    }
}

impl<G: PartialEq + Clone + Send> Evicter<G> for LruEvicter<G> {
    fn should_evict(&mut self, getter: &G) -> bool {
        let keep = self.unused.iter().rev().take(self.retain).any(|g| g == getter);
        if !keep {
            self.remove(getter);
        }
        !keep
    }

    fn unused(&mut self, getter: &G) {
        self.remove(getter);
        self.unused.push(getter.clone());
    }

    fn used(&mut self, getter: &G) {
        self.remove(getter);
    }
}

/// An [`Evicter`] that removes values once they have been unused for some time.
///
/// A value is evicted by the first decision that happens after its delay has passed. With a delay
/// of zero this is the close of its last entry. Otherwise the value is kept and removed by a later
/// sweep of the cache, which happens when other values are added or periodically when configured.
#[derive(Debug)]
pub struct DelayEvicter<G> {
    delay: Duration,
    deadlines: HashMap<G, Instant>,
}

impl<G> DelayEvicter<G> {
    /// Creates an evicter that keeps unused values for `delay`.
    pub fn new(delay: Duration) -> Self {
        DelayEvicter {
            delay,
            deadlines: HashMap::new(),
        }
    }

    /// How long unused values are kept.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<G: Eq + Hash + Clone + Send> Evicter<G> for DelayEvicter<G> {
    fn should_evict(&mut self, getter: &G) -> bool {
        let expired = self
            .deadlines
            .get(getter)
            .is_none_or(|deadline| Instant::now() >= *deadline);
        if expired {
            self.deadlines.remove(getter);
        }
        expired
    }

    fn unused(&mut self, getter: &G) {
        self.deadlines
            .insert(getter.clone(), Instant::now() + self.delay);
    }

    fn used(&mut self, getter: &G) {
        self.deadlines.remove(getter);
    }
}
