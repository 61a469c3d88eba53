use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{CacheConfig, ConfigError, EvictionPolicy};

use super::cache_key::CacheKey;
use super::notify::{ChangeNotifier, Subscription};

/// The result of a successful cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    /// The stored value.
    pub value: T,
    /// Whether the entry is past its staleness window.
    ///
    /// Stale entries are still served so consumers are never blocked; the flag
    /// tells the resource layer to revalidate in the background.
    pub is_stale: bool,
}

/// One entry in the store.
struct Entry<T> {
    value: T,
    /// Set on first store and preserved across re-stores, so "age" reflects the
    /// first insertion rather than the last refresh.
    created_at: Instant,
    stale_at: Instant,
    expires_at: Instant,
    /// Incremented on every read and every store. Stale reads count as usage.
    use_count: u64,
    /// Insertion sequence number, used as the deterministic tie-breaker when
    /// ranking entries for eviction.
    inserted_at: u64,
    /// The eager expiry timer. At most one lives per key; it is aborted and
    /// replaced on every re-store.
    expiry_timer: AbortHandle,
}

struct State<T> {
    entries: FxHashMap<CacheKey, Entry<T>>,
    notifier: ChangeNotifier<T>,
    insert_seq: u64,
    tick: Option<AbortHandle>,
    closed: bool,
}

struct Inner<T> {
    config: CacheConfig,
    state: Mutex<State<T>>,
}

/// A keyed in-memory cache with time-based expiry, staleness tracking,
/// size-bounded eviction and change notification.
///
/// Values are held for at most `ttl` after their last store and flagged stale
/// after `stale_time`. Expiry is enforced both lazily on lookup and eagerly by a
/// per-entry timer, so keys that are never read again still get removed. When the
/// store grows past the configured capacity it is trimmed down to half capacity
/// using the configured [`EvictionPolicy`].
///
/// The cache is cheap to clone and all clones share the same store. Background
/// work (expiry timers, the eviction tick) only holds weak references, so
/// dropping every handle tears the cache down even without an explicit
/// [`close`](Cache::close). Must be constructed inside a Tokio runtime.
pub struct Cache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Cache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .inner
            .state
            .try_lock()
            .map(|s| s.entries.len())
            .unwrap_or_default();
        f.debug_struct("Cache")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .finish()
    }
}

impl<T> Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cache from the given configuration and spawns its periodic
    /// eviction tick.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                entries: FxHashMap::default(),
                notifier: ChangeNotifier::new(),
                insert_seq: 0,
                tick: None,
                closed: false,
            }),
        });

        let tick = spawn_eviction_tick(&inner);
        inner.state.lock().unwrap().tick = Some(tick);

        Ok(Cache { inner })
    }

    /// Creates a cache with default expiry settings (24h ttl, 1h staleness).
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default()).expect("default cache config is valid")
    }

    /// Looks up `key`, bumping its use count.
    ///
    /// Returns `None` if the key is absent or its entry has expired. An entry
    /// past its staleness window is still returned, flagged via
    /// [`Cached::is_stale`]; the read counts as usage regardless.
    pub fn get(&self, key: &CacheKey) -> Option<Cached<T>> {
        let name = self.name();
        metric!(counter("cache.access") += 1, "cache" => name);

        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();

        let cached = match state.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.use_count += 1;
                Some(Cached {
                    value: entry.value.clone(),
                    is_stale: entry.stale_at < now,
                })
            }
            _ => None,
        };
        drop(state);

        match &cached {
            Some(hit) => {
                metric!(counter("cache.hit") += 1, "cache" => name, "stale" => if hit.is_stale { "true" } else { "false" });
            }
            None => {
                metric!(counter("cache.miss") += 1, "cache" => name);
            }
        }
        cached
    }

    /// Stores `value` under `key` using the cache's default expiry windows.
    pub fn store(&self, key: &CacheKey, value: T) {
        let (stale_time, ttl) = (self.inner.config.stale_time, self.inner.config.ttl);
        self.store_with(key, value, stale_time, ttl);
    }

    /// Stores `value` under `key` with per-call expiry windows.
    ///
    /// On replace, the entry's creation time is preserved and its use count
    /// carries over (incremented by one), while both expiry windows and the
    /// expiry timer are reset from now. Subscribers of `key` see the stored
    /// value before the synchronous capacity trim runs, so an entry evicted on
    /// insert still notifies in store-then-remove order.
    pub fn store_with(&self, key: &CacheKey, value: T, stale_time: Duration, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }

        let (created_at, use_count, inserted_at) = match state.entries.remove(key) {
            Some(prev) => {
                prev.expiry_timer.abort();
                (prev.created_at, prev.use_count, prev.inserted_at)
            }
            None => {
                state.insert_seq += 1;
                (now, 0, state.insert_seq)
            }
        };

        let stale_at = now + stale_time;
        let expires_at = now + ttl;
        let expiry_timer = spawn_expiry_timer(&self.inner, key.clone(), expires_at);

        state.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                created_at,
                stale_at,
                expires_at,
                use_count: use_count + 1,
                inserted_at,
                expiry_timer,
            },
        );

        metric!(counter("cache.store") += 1, "cache" => self.name());
        tracing::trace!(cache = self.name(), key = %key, "Storing cache entry");

        state.notifier.publish(
            key,
            Some(Cached {
                value,
                is_stale: stale_at < now,
            }),
        );

        self.inner.trim_locked(&mut state);
    }

    /// Removes `key`, aborting its expiry timer.
    ///
    /// Idempotent: invalidating an absent key does nothing. Subscribers of a
    /// present key receive exactly one `None` notification.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries.remove(key) {
            entry.expiry_timer.abort();
            metric!(counter("cache.invalidate") += 1, "cache" => self.name());
            tracing::trace!(cache = self.name(), key = %key, "Invalidating cache entry");
            state.notifier.publish(key, None);
        }
    }

    /// Subscribes to change notifications for `key`.
    ///
    /// Nothing is replayed on subscribe; the stream yields the post-mutation
    /// entry state after every subsequent store or invalidation of `key` and
    /// terminates when the cache is closed. Subscribing to an already closed
    /// cache yields a stream that has ended.
    pub fn subscribe(&self, key: &CacheKey) -> Subscription<T> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Subscription::terminated();
        }
        state.notifier.subscribe(key.clone())
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears the cache down deterministically: aborts all expiry timers and the
    /// eviction tick, clears the store, and terminates every subscription
    /// stream. Idempotent; subsequent stores are ignored.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;

        for (_, entry) in state.entries.drain() {
            entry.expiry_timer.abort();
        }
        if let Some(tick) = state.tick.take() {
            tick.abort();
        }
        state.notifier.close();

        tracing::debug!(cache = self.name(), "Cache closed");
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Removes `key` if its entry is actually expired.
    ///
    /// This is the eager path driven by the per-entry timer. The deadline check
    /// guards against a timer that fired just before a re-store replaced it.
    fn remove_expired(&self, key: &CacheKey) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            if let Some(entry) = state.entries.remove(key) {
                entry.expiry_timer.abort();
                metric!(counter("cache.expire") += 1, "cache" => self.config.name.as_str());
                state.notifier.publish(key, None);
            }
        }
    }

    /// Trims the store back to half capacity when it exceeds `max_size`.
    ///
    /// Entries are ranked by the configured ordering (use count for lru,
    /// creation time for oldest), ties broken by insertion order; the
    /// `max_size / 2` highest-ranked entries survive.
    fn trim_locked(&self, state: &mut State<T>) {
        let max_size = self.config.eviction.max_size();
        if state.entries.len() <= max_size {
            return;
        }

        let mut ranked: Vec<(CacheKey, u64, Instant, u64)> = state
            .entries
            .iter()
            .map(|(key, e)| (key.clone(), e.use_count, e.created_at, e.inserted_at))
            .collect();

        match self.config.eviction {
            EvictionPolicy::Lru { .. } => {
                ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.3.cmp(&b.3)));
            }
            EvictionPolicy::Oldest { .. } => {
                ranked.sort_by(|a, b| a.2.cmp(&b.2).then(a.3.cmp(&b.3)));
            }
        }

        let keep_count = max_size / 2;
        let evict_count = ranked.len() - keep_count;

        metric!(
            counter("cache.eviction") += evict_count as i64,
            "cache" => self.config.name.as_str(),
            "policy" => self.config.eviction.kind(),
        );
        tracing::debug!(
            cache = self.config.name,
            policy = self.config.eviction.kind(),
            evicted = evict_count,
            "Trimming cache to capacity"
        );

        for (key, ..) in ranked.into_iter().take(evict_count) {
            if let Some(entry) = state.entries.remove(&key) {
                entry.expiry_timer.abort();
                state.notifier.publish(&key, None);
            }
        }
    }
}

/// Spawns the timer that eagerly removes `key` at its expiry deadline.
///
/// The task holds only a weak reference, so it never keeps a dropped cache alive.
fn spawn_expiry_timer<T>(inner: &Arc<Inner<T>>, key: CacheKey, deadline: Instant) -> AbortHandle
where
    T: Clone + Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = weak.upgrade() {
            inner.remove_expired(&key);
        }
    })
    .abort_handle()
}

/// Spawns the periodic eviction tick.
fn spawn_eviction_tick<T>(inner: &Arc<Inner<T>>) -> AbortHandle
where
    T: Clone + Send + Sync + 'static,
{
    let weak: Weak<Inner<T>> = Arc::downgrade(inner);
    let period = inner.config.eviction.check_interval();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let mut state = inner.state.lock().unwrap();
            inner.trim_locked(&mut state);
        }
    })
    .abort_handle()
}
