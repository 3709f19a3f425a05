use std::fmt;
use std::hash::Hash;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// A unit of work whose result is memoized by a [`Cache`](crate::Cache).
///
/// The getter doubles as the cache key: two getters that compare equal share a single fetch.
/// Implementations must therefore be immutable, and their [`Eq`] and [`Hash`] implementations
/// must only look at the fields that identify the fetched resource.
pub trait Getter: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The value produced by a successful fetch.
    type Output: Send + Sync + 'static;
    /// The error produced by a failed fetch.
    ///
    /// Errors are memoized exactly like successful values.
    type Error: Send + Sync + 'static;

    /// Fetches the value, possibly from disk, the network, or another blocking resource.
    ///
    /// This is called at most once per cache slot, from a freshly spawned task or from the first
    /// [`Entry::get`](crate::Entry::get) caller. The getter may return early once `cancel` fires,
    /// and whatever it returns in that case is what every handle of the slot will see.
    fn get(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<Self::Output, Self::Error>>;
}
