use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::caching::{Cache, CacheKey, Cached, Subscription};
use crate::config::{CacheConfig, ConfigError};
use crate::services::ResourceStore;

type AnyValue = Arc<dyn Any + Send + Sync>;

/// One cache instance shared across resources of different item types.
///
/// Values are stored type-erased; reads downcast back to the requested type. A
/// downcast failure is reported as a plain miss, so two resources accidentally
/// colliding on a key degrade to reloading instead of panicking. Eviction and
/// expiry apply across all types together, which is the point: one budget for
/// the whole facade.
#[derive(Clone, Debug)]
pub struct SharedResourceCache {
    cache: Cache<AnyValue>,
}

impl SharedResourceCache {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Ok(SharedResourceCache {
            cache: Cache::new(config)?,
        })
    }

    pub fn with_defaults() -> Self {
        SharedResourceCache {
            cache: Cache::with_defaults(),
        }
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Cached<T>> {
        let cached = self.cache.get(key)?;
        let value = cached.value.downcast_ref::<T>()?.clone();
        Some(Cached {
            value,
            is_stale: cached.is_stale,
        })
    }

    pub fn store<T: Send + Sync + 'static>(
        &self,
        key: &CacheKey,
        value: T,
        stale_time: Duration,
        ttl: Duration,
    ) {
        self.cache.store_with(key, Arc::new(value), stale_time, ttl);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Change notifications for `key`, type-erased. Subscribers see every
    /// store and removal regardless of the stored type.
    pub fn subscribe(&self, key: &CacheKey) -> Subscription<AnyValue> {
        self.cache.subscribe(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn close(&self) {
        self.cache.close();
    }
}

/// Lets a typed [`Resource`](super::Resource) bind to the shared facade.
impl<T> ResourceStore<T> for SharedResourceCache
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<Cached<T>> {
        SharedResourceCache::get(self, key)
    }

    fn store_with(&self, key: &CacheKey, value: T, stale_time: Duration, ttl: Duration) {
        SharedResourceCache::store(self, key, value, stale_time, ttl)
    }
}
