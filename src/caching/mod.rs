//! # In-memory caching infrastructure
//!
//! This module contains the keyed entry store that backs the resource layer, our
//! central [`LoadError`] type, and an explanation of how the pieces fit together.
//!
//! ## Cache layers
//!
//! A cache instance consists of the following parts:
//!
//! - The entry store: a keyed map of values with per-entry metadata (creation time,
//!   staleness deadline, expiry deadline, use count).
//! - The eviction scheduler: trims the store back to capacity after every store and
//!   on a periodic tick.
//! - The change notifier: per-key push streams that republish the entry state after
//!   every mutation.
//!
//! A lookup through [`Cache::get`] can observe an entry in one of three states:
//!
//! - **fresh**: within its staleness window, served as-is.
//! - **stale**: past `stale_time` but before `ttl`. Stale entries are still served
//!   (flagged via [`Cached::is_stale`]) so consumers are never blocked on a refresh;
//!   the resource layer uses the flag to trigger background revalidation.
//! - **expired**: past `ttl`. Expired entries are unusable and behave like misses.
//!
//! Expiry is enforced twice: lazily on every `get`, and eagerly by a per-entry timer
//! that removes the entry at its deadline so that keys which are never read again do
//! not accumulate. Both paths produce the same observable result.
//!
//! ### Metrics
//!
//! Metrics are tagged with a `cache` field carrying the instance name:
//!
//! - `cache.access`: all lookups.
//! - `cache.hit` / `cache.miss`: lookup outcomes; hits are additionally tagged with
//!   `stale`.
//! - `cache.store` / `cache.invalidate`: writes.
//! - `cache.eviction`: entries removed by a capacity trim.
//!
//! ## [`CacheKey`]
//!
//! Keys are built from stable, human-readable metadata which is SHA-256 hashed for
//! map lookups. [`CacheKey::from_request`] derives the metadata canonically from any
//! serializable request descriptor, with object keys sorted so that field order does
//! not change the key. A namespace prefix separates unrelated resources sharing one
//! cache instance.
//!
//! ## [`LoadError`]
//!
//! The caching layer itself never fails: `get`, `store` and `invalidate` are total
//! over valid inputs, and the only construction-time error is a zero `max_size`
//! ([`ConfigError`](crate::config::ConfigError)). [`LoadError`] is the failure type
//! of the I/O performing layers above (loaders, deduplicated requests, mutations).
//! It is cheap to clone so a single failure can be multicast to every waiter of a
//! coalesced request.

mod cache_key;
mod memory;
mod notify;

use std::time::Duration;

use thiserror::Error;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use memory::{Cache, Cached};
pub use notify::Subscription;

/// An error produced while loading a resource from its backing source.
///
/// This error enum is intended to be handed to every waiter of a deduplicated
/// request, which is why all variants are cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The resource does not exist at the backing source.
    #[error("not found")]
    NotFound,
    /// The backing source did not respond in time.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The backing source could not be reached, or answered with a server error.
    ///
    /// The attached string contains the source's response.
    #[error("load failed: {0}")]
    Transport(String),
    /// The resource was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the caching layer itself.
    #[error("internal error")]
    InternalError,
}

impl LoadError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for LoadError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for LoadError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// The result of loading a resource, either the value or the reason the load failed.
pub type LoadResult<T> = Result<T, LoadError>;
