//! Coordination services layered on top of the cache.
//!
//! The caching module stores values; this module decides *when* to load them
//! and what consumers observe in the meantime:
//!
//! - [`Resource`] drives a [`Loader`] per request descriptor, with
//!   stale-while-revalidate reads through a [`CacheBinding`], fallback values
//!   on failure, periodic refresh and prefetching.
//! - [`MutationQueue`] serializes writes through the same loader seam, with
//!   optimistic-update contexts that can revert on failure.
//! - [`Deduper`] collapses concurrent identical requests into one in-flight
//!   call whose result is multicast to every waiter.
//! - [`SharedResourceCache`] is a type-erased facade letting resources of
//!   different item types share one eviction budget.

mod dedupe;
mod mutation;
mod resource;
mod shared;

#[cfg(test)]
mod tests;

pub use dedupe::{is_dedupe_method, Deduper};
pub use mutation::{MutationContext, MutationQueue, MutationQueueBuilder, MutationResult};
pub use resource::{CacheBinding, Loader, Resource, ResourceBuilder, ResourceStore};
pub use shared::SharedResourceCache;
