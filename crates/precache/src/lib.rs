//! Reference-counted memoization of expensive or blocking fetches.
//!
//! A [`Cache`] maps [`Getter`]s to shared slots. Requesting the same getter from many places
//! returns [`Entry`] handles that all observe a single fetch, and the slot is released once the
//! last handle is closed or dropped. Whether an unreferenced slot is kept around for reuse is up
//! to an optional [`Evicter`].
//!
//! ```ignore
//! let cache = Cache::new(4);
//! let entry = cache.entry(MyGetter::new("some-key"));
//! let result = entry.get().await;
//! ```
//!
//! Fetches are either started right away ([`Cache::entry`]) or queued and throttled by the
//! deferred scheduler ([`Cache::deferred`]).

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod entry;
mod evicter;
mod getter;
pub mod logging;
mod scheduler;

pub use cache::Cache;
pub use entry::Entry;
pub use evicter::{DelayEvicter, Evicter, LruEvicter};
pub use getter::Getter;
pub use tokio_util::sync::CancellationToken;
