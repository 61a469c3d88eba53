use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::caching::{Cache, CacheKey, Cached, LoadError, LoadResult};

/// Produces resource values for request descriptors.
///
/// Loaders perform the actual I/O (an HTTP call, a database query). Everything
/// around them, such as caching, deduplication, revalidation and fallbacks, is
/// the coordinator's job; a loader only maps one request to one result.
pub trait Loader: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Item: Clone + Send + Sync + 'static;

    fn load(&self, request: Self::Request) -> BoxFuture<'_, LoadResult<Self::Item>>;
}

/// The typed store surface a [`Resource`] caches through.
///
/// Implemented by [`Cache<T>`] directly and by the type-erased
/// [`SharedResourceCache`](super::SharedResourceCache), so coordinators with
/// different item types can share one underlying facade.
pub trait ResourceStore<T>: Send + Sync + 'static {
    fn get(&self, key: &CacheKey) -> Option<Cached<T>>;
    fn store_with(&self, key: &CacheKey, value: T, stale_time: Duration, ttl: Duration);
}

impl<T> ResourceStore<T> for Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<Cached<T>> {
        Cache::get(self, key)
    }

    fn store_with(&self, key: &CacheKey, value: T, stale_time: Duration, ttl: Duration) {
        Cache::store_with(self, key, value, stale_time, ttl)
    }
}

const FIVE_MINUTES: Duration = Duration::from_secs(300);

type KeyFn<R> = Box<dyn Fn(&R) -> Option<CacheKey> + Send + Sync>;

/// Ties a [`Resource`] to a cache instance.
///
/// Carries the key derivation (a namespace prefix plus either the canonical
/// serialization of the request or a caller-supplied stringifier) and the expiry
/// windows this coordinator stores entries with.
pub struct CacheBinding<R, T> {
    store: Arc<dyn ResourceStore<T>>,
    key_fn: KeyFn<R>,
    stale_time: Duration,
    ttl: Duration,
}

impl<R, T> CacheBinding<R, T>
where
    R: Send + Sync + 'static,
{
    /// Binds to `store` under `prefix`, deriving keys canonically from the
    /// serialized request (field order does not matter).
    ///
    /// A request that fails to serialize is treated as uncacheable.
    pub fn new(store: impl ResourceStore<T>, prefix: &str) -> Self
    where
        R: Serialize,
    {
        let prefix = prefix.to_owned();
        Self::with_key_fn_inner(
            store,
            Box::new(move |request: &R| match CacheKey::from_request(&prefix, request) {
                Ok(key) => Some(key),
                Err(_) => {
                    tracing::warn!(%prefix, "Unserializable request; skipping cache");
                    None
                }
            }),
        )
    }

    /// Binds to `store` under `prefix` with a caller-supplied stringifier.
    pub fn with_key_fn<F>(store: impl ResourceStore<T>, prefix: &str, key_fn: F) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        let prefix = prefix.to_owned();
        Self::with_key_fn_inner(
            store,
            Box::new(move |request: &R| Some(CacheKey::scoped(&prefix, key_fn(request)))),
        )
    }

    fn with_key_fn_inner(store: impl ResourceStore<T>, key_fn: KeyFn<R>) -> Self {
        CacheBinding {
            store: Arc::new(store),
            key_fn,
            stale_time: Duration::ZERO,
            ttl: FIVE_MINUTES,
        }
    }

    /// The staleness window entries stored through this binding get.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// The ttl entries stored through this binding get.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(&self, request: &R) -> Option<CacheKey> {
        (self.key_fn)(request)
    }
}

type SuccessHook<T> = Box<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&LoadError) + Send + Sync>;
type SettledHook = Box<dyn Fn() + Send + Sync>;

struct State<L: Loader> {
    request: Option<L::Request>,
    value: Option<L::Item>,
    error: Option<LoadError>,
    loading: bool,
    /// Request-issuance token. A completing load whose token no longer matches
    /// was superseded and its result is discarded, so slower older loads never
    /// clobber faster newer ones.
    generation: u64,
    load_task: Option<AbortHandle>,
    refresh_task: Option<AbortHandle>,
    closed: bool,
}

struct Inner<L: Loader> {
    loader: L,
    fallback: L::Item,
    keep_previous: bool,
    refresh: Option<Duration>,
    cache: Option<CacheBinding<L::Request, L::Item>>,
    on_success: Option<SuccessHook<L::Item>>,
    on_error: Option<ErrorHook>,
    on_settled: Option<SettledHook>,
    state: Mutex<State<L>>,
}

/// Coordinates an asynchronous [`Loader`] against a cache.
///
/// Per request descriptor change the coordinator consults the cache first: a
/// fresh hit resolves without invoking the loader at all; a stale hit resolves
/// immediately from cache *and* spawns one background revalidation whose result
/// overwrites both the live value and the cache entry; a miss runs the loader in
/// the foreground.
///
/// Loader failures never reach the consumer: the observed value falls back to
/// the configured fallback and the error surfaces through the `on_error` hook.
///
/// Handles are cheap to clone and share one state.
pub struct Resource<L: Loader> {
    inner: Arc<Inner<L>>,
}

impl<L: Loader> Clone for Resource<L> {
    fn clone(&self) -> Self {
        Resource {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Loader> std::fmt::Debug for Resource<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.try_lock();
        let mut s = f.debug_struct("Resource");
        if let Ok(state) = state {
            s.field("loading", &state.loading)
                .field("generation", &state.generation)
                .field("has_value", &state.value.is_some());
        }
        s.finish()
    }
}

/// Configures and builds a [`Resource`].
pub struct ResourceBuilder<L: Loader> {
    loader: L,
    fallback: L::Item,
    keep_previous: bool,
    refresh: Option<Duration>,
    cache: Option<CacheBinding<L::Request, L::Item>>,
    on_success: Option<SuccessHook<L::Item>>,
    on_error: Option<ErrorHook>,
    on_settled: Option<SettledHook>,
}

impl<L: Loader> ResourceBuilder<L> {
    pub fn new(loader: L, fallback: L::Item) -> Self {
        ResourceBuilder {
            loader,
            fallback,
            keep_previous: false,
            refresh: None,
            cache: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Keep the previously resolved value visible while a load for a *new*
    /// request descriptor is in flight, instead of reverting to the fallback.
    pub fn keep_previous(mut self) -> Self {
        self.keep_previous = true;
        self
    }

    /// Reload on a fixed interval.
    pub fn refresh(mut self, period: Duration) -> Self {
        self.refresh = Some(period);
        self
    }

    pub fn cache(mut self, binding: CacheBinding<L::Request, L::Item>) -> Self {
        self.cache = Some(binding);
        self
    }

    pub fn on_success<F: Fn(&L::Item) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F: Fn(&LoadError) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_settled<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_settled = Some(Box::new(f));
        self
    }

    /// Builds the resource and arms its refresh timer, if configured.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Resource<L> {
        let inner = Arc::new(Inner {
            loader: self.loader,
            fallback: self.fallback,
            keep_previous: self.keep_previous,
            refresh: self.refresh,
            cache: self.cache,
            on_success: self.on_success,
            on_error: self.on_error,
            on_settled: self.on_settled,
            state: Mutex::new(State {
                request: None,
                value: None,
                error: None,
                loading: false,
                generation: 0,
                load_task: None,
                refresh_task: None,
                closed: false,
            }),
        });

        let refresh_task = spawn_refresh_timer(&inner);
        inner.state.lock().unwrap().refresh_task = refresh_task;

        Resource { inner }
    }
}

impl<L: Loader> Resource<L> {
    pub fn builder(loader: L, fallback: L::Item) -> ResourceBuilder<L> {
        ResourceBuilder::new(loader, fallback)
    }

    /// Changes the request descriptor.
    ///
    /// `Some` starts a load for the new descriptor (cache permitting); `None`
    /// clears the request and logically cancels any in-flight load.
    pub fn set_request(&self, request: Option<L::Request>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.request = request.clone();
            if request.is_none() {
                state.generation += 1;
                if let Some(task) = state.load_task.take() {
                    task.abort();
                }
                state.loading = false;
                return;
            }
        }

        if let Some(request) = request {
            start_load(&self.inner, request, false);
        }
    }

    /// Forces a reload, bypassing the cache read.
    ///
    /// The refresh timer, if configured, is cancelled and rescheduled so a
    /// manual reload never races a periodic one. Returns false when no request
    /// descriptor is set.
    pub fn reload(&self) -> bool {
        // Spawn the replacement timer up front; the swap below then happens in
        // one critical section, so concurrent reloads can never leave two live
        // timers and a racing close() can never end up with any.
        let rearmed = spawn_refresh_timer(&self.inner);

        let request = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.request.is_none() {
                drop(state);
                if let Some(task) = rearmed {
                    task.abort();
                }
                return false;
            }
            if let Some(displaced) = std::mem::replace(&mut state.refresh_task, rearmed) {
                displaced.abort();
            }
            state.request.clone()
        };

        if let Some(request) = request {
            start_load(&self.inner, request, true);
        }
        true
    }

    /// Warms the cache for `request` without touching this resource's observed
    /// value, loading flag or error.
    ///
    /// Skipped entirely when a fresh entry already exists, and a no-op for
    /// resources without a cache binding. Prefetch failures are swallowed.
    pub async fn prefetch(&self, request: L::Request) {
        let Some(binding) = &self.inner.cache else {
            return;
        };
        let Some(key) = binding.key(&request) else {
            return;
        };

        if let Some(hit) = binding.store.get(&key) {
            if !hit.is_stale {
                return;
            }
        }

        metric!(counter("resource.prefetch") += 1);
        match self.inner.loader.load(request).await {
            Ok(value) => {
                binding
                    .store
                    .store_with(&key, value, binding.stale_time, binding.ttl);
            }
            Err(err) => {
                tracing::debug!(error = %err, "Prefetch failed");
            }
        }
    }

    /// The externally observed value: the last resolved one, or the fallback.
    pub fn value(&self) -> L::Item {
        let state = self.inner.state.lock().unwrap();
        state
            .value
            .clone()
            .unwrap_or_else(|| self.inner.fallback.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().unwrap().loading
    }

    pub fn error(&self) -> Option<LoadError> {
        self.inner.state.lock().unwrap().error.clone()
    }

    /// Tears the resource down: aborts the in-flight load and the refresh
    /// timer. Late completions of already-running loads are discarded.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        state.generation += 1;
        if let Some(task) = state.load_task.take() {
            task.abort();
        }
        if let Some(task) = state.refresh_task.take() {
            task.abort();
        }
        state.loading = false;
    }
}

/// Starts a load for `request`.
///
/// Unless `bypass_cache` is set, the cache is consulted first: a fresh hit
/// resolves without the loader, a stale hit resolves and recurses once in the
/// background. The spawned load applies its result only if its token still
/// matches the current generation.
fn start_load<L: Loader>(inner: &Arc<Inner<L>>, request: L::Request, bypass_cache: bool) {
    let binding = inner.cache.as_ref();
    let key = binding.and_then(|b| b.key(&request));

    if !bypass_cache {
        if let (Some(binding), Some(key)) = (binding, &key) {
            if let Some(hit) = binding.store.get(key) {
                {
                    let mut state = inner.state.lock().unwrap();
                    if state.closed {
                        return;
                    }
                    state.generation += 1;
                    if let Some(task) = state.load_task.take() {
                        task.abort();
                    }
                    state.value = Some(hit.value.clone());
                    state.error = None;
                    state.loading = false;
                }

                if let Some(hook) = &inner.on_success {
                    hook(&hit.value);
                }
                if let Some(hook) = &inner.on_settled {
                    hook();
                }

                if hit.is_stale {
                    // stale-while-revalidate: the consumer already has the old
                    // value; refresh it in the background
                    metric!(counter("resource.revalidate") += 1);
                    start_load(inner, request, true);
                }
                return;
            }
        }
    }

    let token = {
        let mut state = inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.generation += 1;
        if let Some(task) = state.load_task.take() {
            task.abort();
        }
        state.loading = true;
        // Only a request change resets the observed value. Reloads, periodic
        // refreshes and background revalidations keep serving the previous
        // value while the new load is in flight.
        if !bypass_cache && !inner.keep_previous {
            state.value = None;
        }
        state.generation
    };

    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let result = task_inner.loader.load(request).await;

        let mut state = task_inner.state.lock().unwrap();
        if state.closed || state.generation != token {
            // superseded by a newer request; discard
            return;
        }
        state.loading = false;
        state.load_task = None;

        match result {
            Ok(value) => {
                state.value = Some(value.clone());
                state.error = None;
                drop(state);

                if let Some((binding, key)) = task_inner.cache.as_ref().zip(key) {
                    binding
                        .store
                        .store_with(&key, value.clone(), binding.stale_time, binding.ttl);
                }
                if let Some(hook) = &task_inner.on_success {
                    hook(&value);
                }
            }
            Err(err) => {
                state.value = None;
                state.error = Some(err.clone());
                drop(state);

                metric!(counter("resource.load_error") += 1);
                tracing::warn!(error = %err, "Resource load failed; serving fallback");
                if let Some(hook) = &task_inner.on_error {
                    hook(&err);
                }
            }
        }

        if let Some(hook) = &task_inner.on_settled {
            hook();
        }
    });

    let mut state = inner.state.lock().unwrap();
    if state.generation == token && !state.closed {
        state.load_task = Some(handle.abort_handle());
    }
}

/// Arms the periodic refresh timer, if one is configured.
///
/// The task holds only a weak reference so it cannot keep a dropped resource
/// alive; it reloads with a cache bypass like a manual [`Resource::reload`].
fn spawn_refresh_timer<L: Loader>(inner: &Arc<Inner<L>>) -> Option<AbortHandle> {
    let period = inner.refresh?;
    let weak: Weak<Inner<L>> = Arc::downgrade(inner);

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let request = {
                let state = inner.state.lock().unwrap();
                if state.closed {
                    break;
                }
                state.request.clone()
            };
            if let Some(request) = request {
                start_load(&inner, request, true);
            }
        }
    });
    Some(handle.abort_handle())
}
