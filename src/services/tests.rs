use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::caching::{Cache, CacheKey, LoadError, LoadResult};
use crate::config::{CacheConfig, EvictionPolicy};
use crate::services::{
    CacheBinding, Loader, MutationContext, MutationQueue, Resource, SharedResourceCache,
};
use crate::test;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Echoes the request back as `"{request}:{call_number}"`.
///
/// Requests starting with `slow` take 100ms, everything else 10ms. Requests in
/// the `fail` set error out after their delay.
#[derive(Clone, Default)]
struct EchoLoader {
    calls: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
    fail: Arc<Mutex<HashSet<String>>>,
}

impl EchoLoader {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail_on(&self, request: &str) {
        self.fail.lock().unwrap().insert(request.to_owned());
    }
}

impl Loader for EchoLoader {
    type Request = String;
    type Item = String;

    fn load(&self, request: String) -> BoxFuture<'_, LoadResult<String>> {
        let calls = Arc::clone(&self.calls);
        let order = Arc::clone(&self.order);
        let fail = Arc::clone(&self.fail);
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            order.lock().unwrap().push(request.clone());

            let delay = if request.starts_with("slow") { 100 } else { 10 };
            tokio::time::sleep(ms(delay)).await;

            if fail.lock().unwrap().contains(&request) {
                return Err(LoadError::InternalError);
            }
            Ok(format!("{request}:{n}"))
        })
    }
}

fn test_cache() -> Cache<String> {
    Cache::new(CacheConfig {
        name: "test".into(),
        ttl: Duration::from_secs(300),
        stale_time: Duration::from_secs(60),
        eviction: EvictionPolicy::default(),
    })
    .unwrap()
}

fn binding(cache: &Cache<String>, stale_time: Duration) -> CacheBinding<String, String> {
    CacheBinding::new(cache.clone(), "test")
        .stale_time(stale_time)
        .ttl(Duration::from_secs(300))
}

#[tokio::test(start_paused = true)]
async fn test_miss_loads_through_loader() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = test_cache();
    let resource = Resource::builder(loader.clone(), "fallback".to_owned())
        .cache(binding(&cache, Duration::from_secs(60)))
        .build();

    assert_eq!(resource.value(), "fallback");

    resource.set_request(Some("a".to_owned()));
    assert!(resource.is_loading());
    assert_eq!(resource.value(), "fallback");

    tokio::time::sleep(ms(20)).await;

    assert_eq!(resource.value(), "a:1");
    assert!(!resource.is_loading());
    assert_eq!(resource.error(), None);
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_hit_skips_loader() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = test_cache();
    let resource = Resource::builder(loader.clone(), String::new())
        .cache(binding(&cache, Duration::from_secs(60)))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(loader.calls(), 1);

    // still fresh, so setting the same request resolves from cache
    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;

    assert_eq!(resource.value(), "a:1");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_hit_revalidates_in_background() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = test_cache();
    let resource = Resource::builder(loader.clone(), String::new())
        .cache(binding(&cache, ms(50)))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:1");

    tokio::time::sleep(ms(60)).await;

    // the stale value is served immediately while exactly one revalidation
    // runs behind it
    resource.set_request(Some("a".to_owned()));
    assert_eq!(resource.value(), "a:1");

    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:2");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_results_discarded() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new()).build();

    resource.set_request(Some("slow".to_owned()));
    tokio::time::sleep(ms(1)).await;
    resource.set_request(Some("fast".to_owned()));

    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "fast:2");

    // give the slow load's deadline time to pass; its result must not
    // overwrite the newer one
    tokio::time::sleep(ms(200)).await;
    assert_eq!(resource.value(), "fast:2");
}

#[tokio::test(start_paused = true)]
async fn test_error_serves_fallback() {
    test::setup();

    let loader = EchoLoader::default();
    loader.fail_on("a");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let resource = Resource::builder(loader.clone(), "fallback".to_owned())
        .on_error({
            let seen = Arc::clone(&seen);
            move |err| seen.lock().unwrap().push(err.clone())
        })
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;

    assert_eq!(resource.value(), "fallback");
    assert_eq!(resource.error(), Some(LoadError::InternalError));
    assert_eq!(seen.lock().unwrap().as_slice(), [LoadError::InternalError]);
}

#[tokio::test(start_paused = true)]
async fn test_keep_previous_spans_request_changes() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), "fallback".to_owned())
        .keep_previous()
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:1");

    resource.set_request(Some("b".to_owned()));
    tokio::time::sleep(ms(1)).await;
    assert!(resource.is_loading());
    assert_eq!(resource.value(), "a:1");

    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "b:2");
}

#[tokio::test(start_paused = true)]
async fn test_request_change_resets_value() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), "fallback".to_owned()).build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:1");

    resource.set_request(Some("b".to_owned()));
    tokio::time::sleep(ms(1)).await;
    assert_eq!(resource.value(), "fallback");

    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "b:2");
}

#[tokio::test(start_paused = true)]
async fn test_reload_keeps_value_while_in_flight() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), "fallback".to_owned()).build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:1");

    assert!(resource.reload());
    tokio::time::sleep(ms(1)).await;
    assert!(resource.is_loading());
    assert_eq!(resource.value(), "a:1");

    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:2");
}

#[tokio::test(start_paused = true)]
async fn test_reload_without_request_is_noop() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new()).build();

    assert!(!resource.reload());
    tokio::time::sleep(ms(50)).await;
    assert_eq!(loader.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_warms_cache_without_touching_state() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = test_cache();
    let resource = Resource::builder(loader.clone(), "fallback".to_owned())
        .cache(binding(&cache, Duration::from_secs(60)))
        .build();

    resource.prefetch("b".to_owned()).await;

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(resource.value(), "fallback");
    assert!(!resource.is_loading());

    // a subsequent request resolves from the warmed entry
    resource.set_request(Some("b".to_owned()));
    assert_eq!(resource.value(), "b:1");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_skips_fresh_entries() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = test_cache();
    let resource = Resource::builder(loader.clone(), String::new())
        .cache(binding(&cache, Duration::from_secs(60)))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(loader.calls(), 1);

    resource.prefetch("a".to_owned()).await;
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_interval_reloads() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new())
        .refresh(ms(100))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(30)).await;
    assert_eq!(loader.calls(), 1);

    tokio::time::sleep(ms(100)).await;
    assert_eq!(loader.calls(), 2);
    tokio::time::sleep(ms(100)).await;
    assert_eq!(loader.calls(), 3);
    assert_eq!(resource.value(), "a:3");

    resource.close();
    tokio::time::sleep(ms(300)).await;
    assert_eq!(loader.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reload_rearms_refresh_timer() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new())
        .refresh(ms(100))
        .build();

    // timer armed at t=0, first periodic reload due at t=100
    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(80)).await;
    assert_eq!(loader.calls(), 1);

    // manual reload at t=80 pushes the next periodic one to t=180
    assert!(resource.reload());
    tokio::time::sleep(ms(40)).await;
    assert_eq!(loader.calls(), 2);

    tokio::time::sleep(ms(100)).await;
    assert_eq!(loader.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reload_after_close_installs_no_timer() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new())
        .refresh(ms(100))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(30)).await;
    assert_eq!(loader.calls(), 1);

    resource.close();
    assert!(!resource.reload());

    tokio::time::sleep(ms(500)).await;
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_reloads_leave_one_timer() {
    test::setup();

    let loader = EchoLoader::default();
    let resource = Resource::builder(loader.clone(), String::new())
        .refresh(ms(100))
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(30)).await;
    assert_eq!(loader.calls(), 1);

    // the second reload supersedes the first's load and its rearmed timer
    assert!(resource.reload());
    assert!(resource.reload());
    tokio::time::sleep(ms(20)).await;
    assert_eq!(loader.calls(), 2);

    // exactly one periodic reload per period afterwards
    tokio::time::sleep(ms(100)).await;
    assert_eq!(loader.calls(), 3);
    tokio::time::sleep(ms(100)).await;
    assert_eq!(loader.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_mutations_run_in_submission_order() {
    test::setup();

    let loader = EchoLoader::default();
    let settled = Arc::new(AtomicUsize::new(0));
    let queue: MutationQueue<_, ()> = MutationQueue::builder(loader.clone())
        .on_settled({
            let settled = Arc::clone(&settled);
            move || {
                settled.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();

    queue.enqueue("a".to_owned());
    queue.enqueue("b".to_owned());
    queue.enqueue("c".to_owned());
    assert_eq!(queue.pending(), 3);

    tokio::time::sleep(ms(100)).await;

    assert_eq!(
        loader.order.lock().unwrap().as_slice(),
        ["a".to_owned(), "b".to_owned(), "c".to_owned()]
    );
    assert_eq!(queue.pending(), 0);
    assert_eq!(settled.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_reverts_and_continues() {
    test::setup();

    let loader = EchoLoader::default();
    loader.fail_on("b");

    let applied = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let queue: MutationQueue<_, String> = MutationQueue::builder(loader.clone())
        .on_mutate({
            let applied = Arc::clone(&applied);
            move |request: &String| {
                applied.lock().unwrap().push(request.clone());
                let applied = Arc::clone(&applied);
                let request = request.clone();
                MutationContext::with_revert(request.clone(), move || {
                    applied.lock().unwrap().retain(|r| r != &request);
                })
            }
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |_err, meta, is_last| errors.lock().unwrap().push((meta, is_last))
        })
        .build();

    queue.enqueue("a".to_owned());
    queue.enqueue("b".to_owned());
    queue.enqueue("c".to_owned());

    tokio::time::sleep(ms(100)).await;

    // the failed optimistic update was rolled back, the rest stuck
    assert_eq!(
        applied.lock().unwrap().as_slice(),
        ["a".to_owned(), "c".to_owned()]
    );
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        [("b".to_owned(), false)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_final_mutation_is_flagged_last() {
    test::setup();

    let loader = EchoLoader::default();
    loader.fail_on("b");
    let errors = Arc::new(Mutex::new(Vec::new()));

    let queue: MutationQueue<_, String> = MutationQueue::builder(loader.clone())
        .on_mutate(|request: &String| MutationContext::new(request.clone()))
        .on_error({
            let errors = Arc::clone(&errors);
            move |_err, meta, is_last| errors.lock().unwrap().push((meta, is_last))
        })
        .build();

    queue.enqueue("a".to_owned());
    queue.enqueue("b".to_owned());

    tokio::time::sleep(ms(100)).await;

    assert_eq!(errors.lock().unwrap().as_slice(), [("b".to_owned(), true)]);
    assert_eq!(queue.pending(), 0);
}

#[test]
fn test_queue_debug_reports_pending() {
    let queue: MutationQueue<EchoLoader, ()> =
        MutationQueue::builder(EchoLoader::default()).build();
    assert_eq!(format!("{queue:?}"), "MutationQueue { pending: 0 }");
}

#[tokio::test(start_paused = true)]
async fn test_close_reverts_in_flight_mutation() {
    test::setup();

    let loader = EchoLoader::default();
    let applied = Arc::new(Mutex::new(Vec::new()));

    let queue: MutationQueue<_, String> = MutationQueue::builder(loader.clone())
        .on_mutate({
            let applied = Arc::clone(&applied);
            move |request: &String| {
                applied.lock().unwrap().push(request.clone());
                let applied = Arc::clone(&applied);
                let request = request.clone();
                MutationContext::with_revert(request.clone(), move || {
                    applied.lock().unwrap().retain(|r| r != &request);
                })
            }
        })
        .build();

    queue.enqueue("a".to_owned());
    tokio::time::sleep(ms(1)).await;
    assert_eq!(applied.lock().unwrap().as_slice(), ["a".to_owned()]);

    // closing mid-flight rolls the optimistic update back
    queue.close();
    assert!(applied.lock().unwrap().is_empty());
    assert_eq!(queue.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_cache_type_mismatch_is_miss() {
    test::setup();

    let cache = SharedResourceCache::with_defaults();
    let key = CacheKey::scoped("users", "1");

    cache.store(&key, "alice".to_owned(), ms(100), Duration::from_secs(60));

    assert_eq!(cache.get::<String>(&key).map(|c| c.value), Some("alice".to_owned()));
    assert_eq!(cache.get::<u64>(&key), None);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_cache_backs_typed_resources() {
    test::setup();

    let loader = EchoLoader::default();
    let cache = SharedResourceCache::with_defaults();

    let resource = Resource::builder(loader.clone(), String::new())
        .cache(
            CacheBinding::new(cache.clone(), "echo")
                .stale_time(Duration::from_secs(60))
                .ttl(Duration::from_secs(300)),
        )
        .build();

    resource.set_request(Some("a".to_owned()));
    tokio::time::sleep(ms(20)).await;
    assert_eq!(resource.value(), "a:1");
    assert_eq!(cache.len(), 1);

    // a second resource of the same shape hits the shared entry
    let other = Resource::builder(loader.clone(), String::new())
        .cache(
            CacheBinding::new(cache.clone(), "echo")
                .stale_time(Duration::from_secs(60))
                .ttl(Duration::from_secs(300)),
        )
        .build();
    other.set_request(Some("a".to_owned()));
    assert_eq!(other.value(), "a:1");
    assert_eq!(loader.calls(), 1);
}
